//! Page controller - drives one rendered settlements page
//!
//! Load the page, make sure the Futures tab is shown, pick or detect the trade
//! date, expand the table with "load all", then hand the final DOM snapshot to
//! the table extractor. Tab and expand failures degrade the session but do not
//! abort it; discovery and extraction failures do.

use chrono::{Local, NaiveDate};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::browser::Browser;
use super::strategies::{self, DatePick, DATE_LIST_STRATEGIES};
use super::table;
use crate::config::ScraperConfig;
use crate::error::{BrowserError, ExtractionError, ScrapeError};
use crate::types::{Commodity, SettlementRecord, TradeDate};

/// Fixed waits between navigation steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub page_load: Duration,
    pub step: Duration,
    pub expand: Duration,
}

impl Timings {
    pub fn from_config(config: &ScraperConfig) -> Self {
        Self {
            page_load: Duration::from_millis(config.page_load_wait_ms),
            step: Duration::from_millis(config.step_wait_ms),
            expand: Duration::from_millis(config.expand_wait_ms),
        }
    }

    /// No waiting at all (pre-rendered pages, tests)
    pub fn none() -> Self {
        Self {
            page_load: Duration::ZERO,
            step: Duration::ZERO,
            expand: Duration::ZERO,
        }
    }
}

/// Page state ready for extraction
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub title: String,
    pub settlement_date: NaiveDate,
    /// Which detection produced `settlement_date`
    pub date_source: &'static str,
    pub futures_tab: bool,
    pub load_all_clicked: bool,
}

pub const DATE_SOURCE_REQUESTED: &str = "requested";
pub const DATE_SOURCE_FALLBACK: &str = "fallback-yesterday";

pub struct PageController<B: Browser> {
    browser: B,
    timings: Timings,
}

impl<B: Browser> PageController<B> {
    pub fn new(browser: B, timings: Timings) -> Self {
        Self { browser, timings }
    }

    async fn pause(&self, wait: Duration) {
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    async fn load(&mut self, url: &str) -> Result<String, BrowserError> {
        self.browser.goto(url).await?;
        self.pause(self.timings.page_load).await;
        self.browser.source().await
    }

    /// Trade dates offered by the page's date control.
    pub async fn discover_dates(&mut self, url: &str) -> Result<Vec<TradeDate>, ScrapeError> {
        let mut html = self.load(url).await?;

        // Custom dropdowns only render their entries once opened.
        if strategies::find_trade_dates(&html).is_none() {
            if let Some(opener) = strategies::find_date_opener(&html) {
                debug!(element = %opener, "Opening date dropdown");
                self.browser.click(&opener).await?;
                self.pause(self.timings.step).await;
                html = self.browser.source().await?;
            }
        }

        match strategies::find_trade_dates(&html) {
            Some((strategy, dates)) => {
                info!(url, strategy, count = dates.len(), "Trade dates discovered");
                Ok(dates)
            }
            None => Err(ScrapeError::Discovery {
                url: url.to_string(),
                tried: strategies::strategy_names(DATE_LIST_STRATEGIES),
            }),
        }
    }

    /// Bring the page to a state where the full settlement table is present.
    ///
    /// With `target_date` the date control is switched to that date first;
    /// otherwise the page's current date is detected.
    pub async fn prepare(
        &mut self,
        url: &str,
        target_date: Option<NaiveDate>,
    ) -> Result<RenderedPage, ScrapeError> {
        let html = self.load(url).await?;
        let futures_tab = self.ensure_futures_tab(&html).await;

        if let Some(date) = target_date {
            self.select_date(date).await?;
        }

        let html = self.browser.source().await?;
        let (settlement_date, date_source) = match target_date {
            Some(date) => {
                if let Some((strategy, shown)) = strategies::detect_settlement_date(&html) {
                    if shown != date {
                        warn!(requested = %date, shown = %shown, strategy, "Page shows a different date");
                    }
                }
                (date, DATE_SOURCE_REQUESTED)
            }
            None => match strategies::detect_settlement_date(&html) {
                Some((strategy, date)) => (date, strategy),
                None => {
                    let yesterday = Local::now().date_naive().pred_opt().unwrap_or_default();
                    warn!(url, date = %yesterday, "Settlement date not detected, assuming yesterday");
                    (yesterday, DATE_SOURCE_FALLBACK)
                }
            },
        };
        debug!(date = %settlement_date, source = date_source, "Settlement date");

        let load_all_clicked = self.expand_all(&html).await;
        let html = if load_all_clicked {
            self.browser.source().await?
        } else {
            html
        };

        let title = strategies::page_title(&html);
        Ok(RenderedPage {
            url: url.to_string(),
            html,
            title,
            settlement_date,
            date_source,
            futures_tab,
            load_all_clicked,
        })
    }

    /// Click the Futures tab unless already active. Failure is logged only.
    async fn ensure_futures_tab(&mut self, html: &str) -> bool {
        let Some((strategy, tab)) = strategies::find_futures_tab(html) else {
            warn!("Futures tab not found, continuing with current view");
            return false;
        };
        if tab.active {
            debug!(strategy, "Futures tab already active");
            return true;
        }
        match self.browser.click(&tab.target).await {
            Ok(()) => {
                debug!(strategy, element = %tab.target, "Futures tab selected");
                self.pause(self.timings.step).await;
                true
            }
            Err(e) => {
                warn!(strategy, error = %e, "Failed to click Futures tab, continuing");
                false
            }
        }
    }

    async fn select_date(&mut self, date: NaiveDate) -> Result<(), ScrapeError> {
        let mut html = self.browser.source().await?;
        let mut plan = strategies::plan_date_pick(&html, date);

        if plan.is_none() {
            if let Some(opener) = strategies::find_date_opener(&html) {
                self.browser.click(&opener).await?;
                self.pause(self.timings.step).await;
                html = self.browser.source().await?;
                plan = strategies::plan_date_pick(&html, date);
            }
        }

        match plan {
            Some(DatePick::Select { target, label }) => {
                self.browser.select_option(&target, &label).await?;
            }
            Some(DatePick::Click(target)) => {
                self.browser.click(&target).await?;
            }
            None => return Err(ScrapeError::DateUnavailable(date)),
        }

        info!(%date, "Trade date selected");
        self.pause(self.timings.page_load).await;
        Ok(())
    }

    /// Trigger "load all". A missing control leaves a partial contract set.
    async fn expand_all(&mut self, html: &str) -> bool {
        let Some((strategy, target)) = strategies::find_load_all(html) else {
            warn!("Load-all control not found, table may be partial");
            return false;
        };
        match self.browser.click(&target).await {
            Ok(()) => {
                debug!(strategy, element = %target, "Load all clicked");
                self.pause(self.timings.expand).await;
                true
            }
            Err(e) => {
                warn!(strategy, error = %e, "Load all click failed, table may be partial");
                false
            }
        }
    }

    /// Locate the settlement table in a prepared page.
    pub fn extract(
        page: &RenderedPage,
        commodity: Commodity,
    ) -> Result<Vec<SettlementRecord>, ExtractionError> {
        table::locate_settlement_table(&page.html, page.settlement_date, commodity)
    }

    /// Prepare and extract in one go.
    pub async fn scrape(
        &mut self,
        url: &str,
        commodity: Commodity,
        target_date: Option<NaiveDate>,
    ) -> Result<Vec<SettlementRecord>, ScrapeError> {
        let page = self.prepare(url, target_date).await?;
        let records = Self::extract(&page, commodity)?;
        info!(
            commodity = %commodity,
            date = %page.settlement_date,
            records = records.len(),
            load_all = page.load_all_clicked,
            "Scraped settlements"
        );
        Ok(records)
    }

    pub async fn close(mut self) -> Result<(), BrowserError> {
        self.browser.close().await
    }
}

/// One scrape session. The browser is closed on every exit path.
pub async fn run_session<B: Browser>(
    browser: B,
    timings: Timings,
    url: &str,
    commodity: Commodity,
    target_date: Option<NaiveDate>,
) -> Result<Vec<SettlementRecord>, ScrapeError> {
    let mut controller = PageController::new(browser, timings);
    let result = controller.scrape(url, commodity, target_date).await;
    if let Err(e) = controller.close().await {
        warn!(error = %e, "Failed to close browser session");
    }
    result
}

/// One date discovery session. The browser is closed on every exit path.
pub async fn run_discovery<B: Browser>(
    browser: B,
    timings: Timings,
    url: &str,
) -> Result<Vec<TradeDate>, ScrapeError> {
    let mut controller = PageController::new(browser, timings);
    let result = controller.discover_dates(url).await;
    if let Err(e) = controller.close().await {
        warn!(error = %e, "Failed to close browser session");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cme::browser::{MockBrowser, Target};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const URL: &str = "https://example.test/settlements";

    const FULL_PAGE: &str = r#"
        <html><head><title>Crude Oil Settlements</title></head><body>
          <div role="tab" class="active">Futures</div>
          <select><option>Monday, 15 Dec 2025</option>
            <option selected>Friday, 12 Dec 2025</option>
            <option>Thursday, 11 Dec 2025</option></select>
          <table>
            <tr><th>Month</th><th>Open</th><th>High</th><th>Low</th><th>Last</th>
                <th>Change</th><th>Settle</th><th>Est. Volume</th><th>Prior Day OI</th></tr>
            <tr><td>JAN 26</td><td>70.10</td><td>71.00</td><td>69.50</td><td>70.80</td>
                <td>+0.25</td><td>70.75</td><td>12000</td><td>5000</td></tr>
          </table>
          <button>LOAD ALL</button>
        </body></html>"#;

    const BARE_TABLE: &str = r#"<html><body><table>
        <tr><th>Month</th><th>Settle</th><th>Change</th></tr>
        <tr><td>FEB 26</td><td>3.985</td><td>-.045</td></tr>
        </table></body></html>"#;

    const NO_SETTLE: &str = r#"<html><head><title>Settlements</title></head><body>
        <table><tr><th>Month</th><th>Open</th><th>High</th></tr>
        <tr><td>JAN 26</td><td>70.10</td><td>71.00</td></tr></table></body></html>"#;

    fn serving(pages: Vec<&'static str>) -> MockBrowser {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut browser = MockBrowser::new();
        browser.expect_goto().returning(|_| Ok(()));
        browser.expect_source().returning(move || {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            Ok(pages[i.min(pages.len() - 1)].to_string())
        });
        browser
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn scrape_session_clicks_load_all_and_closes() {
        let mut browser = serving(vec![FULL_PAGE]);
        browser
            .expect_click()
            .withf(|t| *t == Target::new("button, a", 0))
            .times(1)
            .returning(|_| Ok(()));
        browser.expect_close().times(1).returning(|| Ok(()));

        let records = run_session(browser, Timings::none(), URL, Commodity::WTI, None)
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].date, date(2025, 12, 12));
        assert_eq!(records[0].settle, 70.75);
    }

    #[tokio::test]
    async fn extraction_failure_still_closes_browser() {
        let mut browser = serving(vec![NO_SETTLE]);
        browser.expect_close().times(1).returning(|| Ok(()));

        let err = run_session(browser, Timings::none(), URL, Commodity::WTI, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ScrapeError::Extraction(ExtractionError::NoRecords { table_count: 1, .. })
        ));
        assert!(err.is_layout_change());
    }

    #[tokio::test]
    async fn navigation_failure_still_closes_browser() {
        let mut browser = MockBrowser::new();
        browser
            .expect_goto()
            .returning(|_| Err(BrowserError::Command("net::ERR_NAME_NOT_RESOLVED".into())));
        browser
            .expect_close()
            .times(1)
            .returning(|| Err(BrowserError::Command("already gone".into())));

        let err = run_session(browser, Timings::none(), URL, Commodity::HH, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Browser(_)));
    }

    #[tokio::test]
    async fn missing_tab_and_load_all_degrade_without_failing() {
        let mut browser = serving(vec![BARE_TABLE]);
        browser.expect_click().times(0);

        let mut controller = PageController::new(browser, Timings::none());
        let page = controller.prepare(URL, None).await.unwrap();

        assert!(!page.futures_tab);
        assert!(!page.load_all_clicked);
        assert_eq!(page.date_source, DATE_SOURCE_FALLBACK);
        assert_eq!(
            page.settlement_date,
            Local::now().date_naive().pred_opt().unwrap()
        );

        let records = PageController::<MockBrowser>::extract(&page, Commodity::HH).unwrap();
        assert_eq!(records[0].change, Some(-0.045));
    }

    #[tokio::test]
    async fn inactive_futures_tab_is_clicked() {
        let page = r#"<html><body>
            <a href="/options">Options</a><a href="/futures">Futures</a>
            <table><tr><th>Month</th><th>Settle</th><th>Last</th></tr>
            <tr><td>JAN 26</td><td>70.75</td><td>70.80</td></tr></table></body></html>"#;
        let mut browser = serving(vec![page]);
        browser
            .expect_click()
            .withf(|t| *t == Target::new("button, a", 1))
            .times(1)
            .returning(|_| Ok(()));

        let mut controller = PageController::new(browser, Timings::none());
        let rendered = controller.prepare(URL, None).await.unwrap();
        assert!(rendered.futures_tab);
    }

    #[tokio::test]
    async fn tab_click_failure_is_not_fatal() {
        let page = r#"<html><body><button>Futures</button>
            <table><tr><th>Month</th><th>Settle</th><th>Last</th></tr>
            <tr><td>JAN 26</td><td>70.75</td><td>70.80</td></tr></table></body></html>"#;
        let mut browser = serving(vec![page]);
        browser
            .expect_click()
            .returning(|_| Err(BrowserError::Command("element not interactable".into())));

        let mut controller = PageController::new(browser, Timings::none());
        let rendered = controller.prepare(URL, None).await.unwrap();
        assert!(!rendered.futures_tab);
    }

    #[tokio::test]
    async fn requested_date_is_selected() {
        let mut browser = serving(vec![FULL_PAGE]);
        browser
            .expect_select_option()
            .withf(|t, label| *t == Target::new("select", 0) && label == "Thursday, 11 Dec 2025")
            .times(1)
            .returning(|_, _| Ok(()));
        browser.expect_click().returning(|_| Ok(()));

        let mut controller = PageController::new(browser, Timings::none());
        let page = controller.prepare(URL, Some(date(2025, 12, 11))).await.unwrap();
        assert_eq!(page.settlement_date, date(2025, 12, 11));
        assert_eq!(page.date_source, DATE_SOURCE_REQUESTED);
    }

    #[tokio::test]
    async fn unavailable_date_is_an_error() {
        let browser = serving(vec![FULL_PAGE]);
        let mut controller = PageController::new(browser, Timings::none());
        let err = controller
            .prepare(URL, Some(date(2024, 1, 2)))
            .await
            .unwrap_err();
        assert!(matches!(err, ScrapeError::DateUnavailable(d) if d == date(2024, 1, 2)));
    }

    #[tokio::test]
    async fn discovery_lists_dates() {
        let mut browser = serving(vec![FULL_PAGE]);
        browser.expect_close().times(1).returning(|| Ok(()));

        let dates = run_discovery(browser, Timings::none(), URL).await.unwrap();
        assert_eq!(dates.len(), 3);
        assert_eq!(dates[2].iso_date, date(2025, 12, 11));
    }

    #[tokio::test]
    async fn discovery_opens_custom_dropdown() {
        let closed = r#"<div class="date-selector">Select date</div>"#;
        let open = r#"<div class="date-selector">Select date</div>
            <ul><li role="option">Monday, 15 Dec 2025</li></ul>"#;
        let mut browser = serving(vec![closed, open]);
        browser.expect_click().times(1).returning(|_| Ok(()));

        let mut controller = PageController::new(browser, Timings::none());
        let dates = controller.discover_dates(URL).await.unwrap();
        assert_eq!(dates[0].iso_date, date(2025, 12, 15));
    }

    #[tokio::test]
    async fn discovery_failure_names_strategies() {
        let mut browser = serving(vec!["<html><body>Nothing here</body></html>"]);
        browser.expect_close().times(1).returning(|| Ok(()));

        match run_discovery(browser, Timings::none(), URL).await {
            Err(ScrapeError::Discovery { url, tried }) => {
                assert_eq!(url, URL);
                assert_eq!(tried, vec!["select-options", "clickable-options"]);
            }
            other => panic!("expected discovery error, got {other:?}"),
        }
    }
}
