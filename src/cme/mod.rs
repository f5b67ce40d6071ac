//! CME module - settlement scraping from the rendered settlements pages
//!
//! One browser session per call; sessions against the exchange are spaced by
//! the configured rate limit.

pub mod browser;
pub mod controller;
pub mod strategies;
pub mod table;

pub use browser::{Browser, Target, WebDriverBrowser};
pub use controller::{run_discovery, run_session, PageController, RenderedPage, Timings};

use chrono::NaiveDate;
use std::future::Future;
use tracing::{info, warn};

use crate::config::ScraperConfig;
use crate::error::{BrowserError, ScrapeError};
use crate::rate_limit::RateLimiter;
use crate::types::{Commodity, SettlementRecord, TradeDate};

/// Entry point for settlement scraping
pub struct CmeScraper {
    config: ScraperConfig,
    limiter: RateLimiter,
}

impl CmeScraper {
    pub fn new(config: ScraperConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit());
        Self { config, limiter }
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    /// Records for the date the page currently shows (normally the prior
    /// business day).
    pub async fn scrape_commodity(
        &self,
        commodity: Commodity,
    ) -> Result<Vec<SettlementRecord>, ScrapeError> {
        self.scrape_commodity_on(commodity, None).await
    }

    /// Records for `date`, or for the page's current date when `None`.
    pub async fn scrape_commodity_on(
        &self,
        commodity: Commodity,
        date: Option<NaiveDate>,
    ) -> Result<Vec<SettlementRecord>, ScrapeError> {
        self.limiter.wait().await;
        let url = self.config.url_for(commodity);
        info!(commodity = %commodity, url, date = ?date, "Starting scrape session");

        let browser = WebDriverBrowser::launch(&self.config).await?;
        run_session(
            browser,
            Timings::from_config(&self.config),
            url,
            commodity,
            date,
        )
        .await
    }

    /// Trade dates offered for `commodity`. Empty when discovery fails, so
    /// callers can fall back to manual date entry.
    pub async fn discover_dates(&self, commodity: Commodity) -> Vec<TradeDate> {
        self.limiter.wait().await;
        discover_or_empty(
            WebDriverBrowser::launch(&self.config),
            Timings::from_config(&self.config),
            self.config.url_for(commodity),
            commodity,
        )
        .await
    }
}

/// Run discovery on the browser produced by `launch`. Launch and discovery
/// failures are logged and yield no dates.
async fn discover_or_empty<B, L>(
    launch: L,
    timings: Timings,
    url: &str,
    commodity: Commodity,
) -> Vec<TradeDate>
where
    B: Browser,
    L: Future<Output = Result<B, BrowserError>>,
{
    let result = match launch.await {
        Ok(browser) => run_discovery(browser, timings, url).await,
        Err(e) => Err(e.into()),
    };

    match result {
        Ok(dates) => dates,
        Err(e) => {
            warn!(commodity = %commodity, error = %e, "Trade date discovery failed");
            Vec::new()
        }
    }
}
