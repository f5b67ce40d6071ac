//! Pipeline - the daily scrape-and-store job
//!
//! Commodities are processed one after another, each with its own browser
//! session. A failing commodity is reported and the next one still runs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::cme::CmeScraper;
use crate::error::ScrapeError;
use crate::persistence::{Repository, UpsertSummary};
use crate::reconcile::{ReconcileFilters, ReconcileSummary, Reconciler};
use crate::spot::EiaClient;
use crate::types::{Commodity, SettlementRecord, SpotPriceRecord};

/// Anything that can produce a settlement snapshot for a commodity
#[async_trait]
pub trait SettlementSource: Send + Sync {
    /// Scrape `commodity` for `date`, or for the date the source currently
    /// publishes when `None`.
    async fn settlements(
        &self,
        commodity: Commodity,
        date: Option<NaiveDate>,
    ) -> Result<Vec<SettlementRecord>, ScrapeError>;
}

#[async_trait]
impl SettlementSource for CmeScraper {
    async fn settlements(
        &self,
        commodity: Commodity,
        date: Option<NaiveDate>,
    ) -> Result<Vec<SettlementRecord>, ScrapeError> {
        self.scrape_commodity_on(commodity, date).await
    }
}

/// Anything that can produce a spot price history for a commodity
#[async_trait]
pub trait SpotSource: Send + Sync {
    async fn spot_prices(&self, commodity: Commodity) -> anyhow::Result<Vec<SpotPriceRecord>>;
}

#[async_trait]
impl SpotSource for EiaClient {
    async fn spot_prices(&self, commodity: Commodity) -> anyhow::Result<Vec<SpotPriceRecord>> {
        self.fetch(commodity).await
    }
}

/// Result for one commodity of a daily run
#[derive(Debug, Clone, Serialize)]
pub struct CommodityReport {
    pub commodity: Commodity,
    /// Trade date of the scraped snapshot
    pub date: Option<NaiveDate>,
    pub scraped: usize,
    pub saved: usize,
    pub skipped: usize,
    /// Data for the date was already stored, nothing written
    pub already_present: bool,
    pub errors: Vec<String>,
    pub error: Option<String>,
}

impl CommodityReport {
    fn new(commodity: Commodity) -> Self {
        Self {
            commodity,
            date: None,
            scraped: 0,
            saved: 0,
            skipped: 0,
            already_present: false,
            errors: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub commodities: Vec<CommodityReport>,
}

impl DailyReport {
    pub fn success(&self) -> bool {
        self.commodities.iter().all(|c| c.error.is_none())
    }
}

/// Outcome of refreshing the spot history of one commodity
#[derive(Debug, Clone, Serialize)]
pub struct SpotReport {
    pub commodity: Commodity,
    pub fetched: usize,
    pub stored: Option<UpsertSummary>,
    pub error: Option<String>,
}

pub struct Pipeline<'a, S: SettlementSource> {
    source: &'a S,
    repo: &'a Repository,
    /// Re-write dates that are already stored
    overwrite: bool,
}

impl<'a, S: SettlementSource> Pipeline<'a, S> {
    pub fn new(source: &'a S, repo: &'a Repository) -> Self {
        Self {
            source,
            repo,
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Scrape and store each commodity in turn.
    pub async fn daily(&self, commodities: &[Commodity], date: Option<NaiveDate>) -> DailyReport {
        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(commodities.len());
        for &commodity in commodities {
            reports.push(self.scrape_and_store(commodity, date).await);
        }

        let report = DailyReport {
            started_at,
            finished_at: Utc::now(),
            commodities: reports,
        };
        if report.success() {
            info!(commodities = commodities.len(), "Daily run finished");
        } else {
            warn!("Daily run finished with errors");
        }
        report
    }

    /// One commodity: scrape, then store unless the date is already present.
    pub async fn scrape_and_store(
        &self,
        commodity: Commodity,
        date: Option<NaiveDate>,
    ) -> CommodityReport {
        let mut report = CommodityReport::new(commodity);

        let records = match self.source.settlements(commodity, date).await {
            Ok(records) => records,
            Err(e) => {
                error!(
                    commodity = %commodity,
                    error = %e,
                    layout_change = e.is_layout_change(),
                    "Scrape failed"
                );
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.scraped = records.len();
        let Some(trade_date) = records.first().map(|r| r.date) else {
            return report;
        };
        report.date = Some(trade_date);

        if !self.overwrite {
            match self.repo.exists(trade_date, Some(commodity)) {
                Ok(true) => {
                    info!(commodity = %commodity, date = %trade_date, "Already stored, skipping");
                    report.already_present = true;
                    report.skipped = records.len();
                    return report;
                }
                Ok(false) => {}
                Err(e) => {
                    report.error = Some(format!("{e:#}"));
                    return report;
                }
            }
        }

        let summary = self.repo.upsert_settlements(&records);
        info!(
            commodity = %commodity,
            date = %trade_date,
            scraped = records.len(),
            saved = summary.saved,
            skipped = summary.skipped,
            "Settlements stored"
        );
        report.saved = summary.saved;
        report.skipped = summary.skipped;
        report.errors = summary.errors;
        report
    }

    pub fn reconcile(&self, filters: ReconcileFilters) -> anyhow::Result<ReconcileSummary> {
        Reconciler::new(self.repo).reconcile(filters)
    }
}

/// Fetch and store spot prices for each commodity. A failed fetch is reported
/// and the next commodity is still refreshed.
pub async fn refresh_spot<P: SpotSource>(
    source: &P,
    repo: &Repository,
    commodities: &[Commodity],
) -> Vec<SpotReport> {
    let mut reports = Vec::with_capacity(commodities.len());
    for &commodity in commodities {
        let report = match source.spot_prices(commodity).await {
            Ok(records) => SpotReport {
                commodity,
                fetched: records.len(),
                stored: Some(repo.upsert_spot_prices(&records)),
                error: None,
            },
            Err(e) => {
                error!(commodity = %commodity, error = %e, "Spot fetch failed");
                SpotReport {
                    commodity,
                    fetched: 0,
                    stored: None,
                    error: Some(format!("{e:#}")),
                }
            }
        };
        reports.push(report);
    }
    reports
}
