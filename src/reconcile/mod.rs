//! Reconciler - futures vs spot basis error
//!
//! Pairs every stored settlement with the spot price of the same commodity and
//! day, stores one [`ErrorRecord`] per pair and summarizes the error
//! distribution.

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::normalize;
use crate::persistence::{Repository, UpsertSummary};
use crate::types::{Commodity, ErrorRecord, SettlementRecord, SpotPriceRecord};

/// Which settlements to reconcile; unset fields do not filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileFilters {
    pub commodity: Option<Commodity>,
    /// Inclusive
    pub start: Option<NaiveDate>,
    /// Inclusive
    pub end: Option<NaiveDate>,
}

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    /// Error records actually stored (inserted or updated)
    pub calculated: usize,
    /// Settlements without a spot price for their day
    pub skipped: usize,
    pub total_settlements: usize,
    pub errors: Vec<ErrorRecord>,
    pub stored: UpsertSummary,
}

/// Distribution of one error measure.
///
/// Percentiles pick `sorted[floor(p * n)]` and fall back to the first or last
/// value when the sample is small (n < 4 for p25/p75, n < 10 for p90,
/// n < 20 for p95). This is an approximation, not an interpolated percentile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Summary {
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation; 0 for a single value
    pub std_dev: f64,
    pub p25: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorStatistics {
    pub count: usize,
    pub absolute_error: Option<Summary>,
    pub percentage_error: Option<Summary>,
}

pub fn basis_error(futures: f64, spot: f64) -> f64 {
    (futures - spot).abs()
}

/// Signed error relative to spot, in percent. `None` when spot is zero.
pub fn percentage_error(futures: f64, spot: f64) -> Option<f64> {
    if spot == 0.0 {
        None
    } else {
        Some((futures - spot) / spot * 100.0)
    }
}

/// Days from the settlement date to the 25th of the contract month; `None`
/// once that day has passed or the label is not a contract month.
pub fn days_to_expiry(settlement_date: NaiveDate, contract_month: &str) -> Option<i64> {
    let proxy = normalize::expiry_proxy_date(contract_month)?;
    let days = (proxy - settlement_date).num_days();
    (days >= 0).then_some(days)
}

pub fn summarize(values: &[f64]) -> Option<Summary> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len();
    let first = sorted[0];
    let last = sorted[n - 1];

    let mean = sorted.iter().sum::<f64>() / n as f64;
    let std_dev = if n > 1 {
        (sorted.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64).sqrt()
    } else {
        0.0
    };
    let at = |percent: usize, min_n: usize, fallback: f64| {
        if n >= min_n {
            sorted[n * percent / 100]
        } else {
            fallback
        }
    };

    Some(Summary {
        mean,
        median: sorted[n / 2],
        min: first,
        max: last,
        std_dev,
        p25: at(25, 4, first),
        p75: at(75, 4, last),
        p90: at(90, 10, last),
        p95: at(95, 20, last),
    })
}

/// Build the error record for a matched settlement/spot pair.
pub fn error_record(settlement: &SettlementRecord, spot: &SpotPriceRecord) -> ErrorRecord {
    ErrorRecord {
        settlement_ref: settlement.key().to_string(),
        spot_ref: spot.key().to_string(),
        commodity: settlement.commodity,
        contract_month: settlement.contract_month.clone(),
        futures_price: settlement.settle,
        spot_price: spot.price,
        absolute_error: basis_error(settlement.settle, spot.price),
        percentage_error: percentage_error(settlement.settle, spot.price),
        days_to_expiry: days_to_expiry(settlement.date, &settlement.contract_month),
        date: settlement.date,
        created_at: Utc::now(),
    }
}

pub struct Reconciler<'a> {
    repo: &'a Repository,
}

impl<'a> Reconciler<'a> {
    pub fn new(repo: &'a Repository) -> Self {
        Self { repo }
    }

    /// Compute and store error records for every settlement matching
    /// `filters`. Settlements without a spot price are counted as skipped.
    pub fn reconcile(&self, filters: ReconcileFilters) -> Result<ReconcileSummary> {
        let settlements =
            self.repo
                .settlements_between(filters.commodity, filters.start, filters.end)?;

        // First source per (commodity, day), in source order.
        let mut spots: BTreeMap<(Commodity, NaiveDate), SpotPriceRecord> = BTreeMap::new();
        for spot in self.repo.spot_prices(filters.commodity)? {
            spots.entry((spot.commodity, spot.date)).or_insert(spot);
        }

        let mut skipped = 0;
        let mut errors = Vec::with_capacity(settlements.len());
        for settlement in &settlements {
            match spots.get(&(settlement.commodity, settlement.date)) {
                Some(spot) => errors.push(error_record(settlement, spot)),
                None => {
                    debug!(settlement = %settlement.key(), "No spot price, skipped");
                    skipped += 1;
                }
            }
        }

        let stored = self.repo.upsert_error_records(&errors);
        info!(
            paired = errors.len(),
            calculated = stored.saved,
            skipped,
            total = settlements.len(),
            "Reconciliation finished"
        );

        Ok(ReconcileSummary {
            calculated: stored.saved,
            skipped,
            total_settlements: settlements.len(),
            errors,
            stored,
        })
    }

    /// Statistics over stored error records.
    pub fn statistics(
        &self,
        commodity: Option<Commodity>,
        contract_month: Option<&str>,
    ) -> Result<ErrorStatistics> {
        let records = self.repo.error_records(commodity, contract_month)?;
        let absolute: Vec<f64> = records.iter().map(|r| r.absolute_error).collect();
        let percentage: Vec<f64> = records.iter().filter_map(|r| r.percentage_error).collect();

        Ok(ErrorStatistics {
            count: records.len(),
            absolute_error: summarize(&absolute),
            percentage_error: summarize(&percentage),
        })
    }
}
