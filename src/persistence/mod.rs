//! CSV Persistence Module
//!
//! Idempotent storage of settlements, spot prices and basis error records,
//! keyed by business identity. Each record type lives in one CSV table under
//! the data directory; an upsert loads the table, inserts or updates by key and
//! rewrites the file atomically.
//!
//! Upserts are serialized within a process. Two processes writing the same
//! table race on the check-then-write and the later write wins.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use csv::{ReaderBuilder, WriterBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::types::{Commodity, ErrorRecord, SettlementKey, SettlementRecord, SpotKey, SpotPriceRecord};

/// At most this many error messages are returned per upsert
const MAX_REPORTED_ERRORS: usize = 5;
const MAX_ERROR_LEN: usize = 200;

/// Outcome of one upsert batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    /// Inserted or updated
    pub saved: usize,
    /// Rejected or failed to store
    pub skipped: usize,
    /// First few failures, truncated
    pub errors: Vec<String>,
    /// Total number of failures
    pub error_count: usize,
}

impl UpsertSummary {
    fn fail(&mut self, message: String) {
        self.skipped += 1;
        self.error_count += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(truncate(&message, MAX_ERROR_LEN));
        }
    }
}

fn truncate(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        message.to_string()
    } else {
        let mut cut: String = message.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    }
}

/// A record stored in its own keyed table
trait Keyed: Serialize + DeserializeOwned + Clone {
    type Key: Ord + Clone;

    /// File name under the data directory
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    /// Rendered key for messages
    fn label(&self) -> String;

    fn validate(&self) -> std::result::Result<(), String>;

    /// Copy the mutable fields onto an existing record with the same key.
    fn merge_into(&self, existing: &mut Self);
}

impl Keyed for SettlementRecord {
    type Key = SettlementKey;
    const TABLE: &'static str = "settlements.csv";

    fn key(&self) -> SettlementKey {
        SettlementRecord::key(self)
    }

    fn label(&self) -> String {
        self.key().to_string()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.contract_month.trim().is_empty() {
            return Err("contract month is empty".to_string());
        }
        if !self.settle.is_finite() {
            return Err(format!("settle {} is not a number", self.settle));
        }
        Ok(())
    }

    fn merge_into(&self, existing: &mut Self) {
        existing.contract_expiry_date = self.contract_expiry_date;
        existing.open = self.open;
        existing.high = self.high;
        existing.low = self.low;
        existing.last = self.last;
        existing.change = self.change;
        existing.settle = self.settle;
        existing.est_volume = self.est_volume;
        existing.prior_day_open_interest = self.prior_day_open_interest;
    }
}

impl Keyed for SpotPriceRecord {
    type Key = SpotKey;
    const TABLE: &'static str = "spot_prices.csv";

    fn key(&self) -> SpotKey {
        SpotPriceRecord::key(self)
    }

    fn label(&self) -> String {
        self.key().to_string()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.source.trim().is_empty() {
            return Err("source is empty".to_string());
        }
        // Zero and negative prints are real market data and are kept.
        if !self.price.is_finite() {
            return Err(format!("price {} is not a finite number", self.price));
        }
        Ok(())
    }

    fn merge_into(&self, existing: &mut Self) {
        existing.price = self.price;
    }
}

impl Keyed for ErrorRecord {
    type Key = (String, String);
    const TABLE: &'static str = "error_records.csv";

    fn key(&self) -> (String, String) {
        ErrorRecord::key(self)
    }

    fn label(&self) -> String {
        format!("{} vs {}", self.settlement_ref, self.spot_ref)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        if self.settlement_ref.is_empty() || self.spot_ref.is_empty() {
            return Err("missing settlement or spot reference".to_string());
        }
        if !self.futures_price.is_finite() || !self.spot_price.is_finite() {
            return Err("prices must be finite".to_string());
        }
        Ok(())
    }

    fn merge_into(&self, existing: &mut Self) {
        existing.commodity = self.commodity;
        existing.contract_month = self.contract_month.clone();
        existing.date = self.date;
        existing.futures_price = self.futures_price;
        existing.spot_price = self.spot_price;
        existing.absolute_error = self.absolute_error;
        existing.percentage_error = self.percentage_error;
        existing.days_to_expiry = self.days_to_expiry;
    }
}

/// In-memory image of one CSV table
struct CsvTable<R: Keyed> {
    path: PathBuf,
    rows: BTreeMap<R::Key, R>,
}

impl<R: Keyed> CsvTable<R> {
    fn load(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(R::TABLE);
        let mut rows = BTreeMap::new();

        if path.exists() {
            let file = fs::File::open(&path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
            for result in reader.deserialize() {
                let record: R = result
                    .with_context(|| format!("Failed to deserialize row of {}", R::TABLE))?;
                rows.insert(record.key(), record);
            }
        }

        Ok(Self { path, rows })
    }

    /// Rewrite the table through a temporary file so readers never see a
    /// half-written table.
    fn store(&self) -> Result<()> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let file = fs::File::create(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            let mut writer = WriterBuilder::new().has_headers(true).from_writer(file);
            for record in self.rows.values() {
                writer
                    .serialize(record)
                    .with_context(|| format!("Failed to write row of {}", R::TABLE))?;
            }
            writer.flush().context("Failed to flush CSV writer")?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn into_values(self) -> impl Iterator<Item = R> {
        self.rows.into_values()
    }
}

/// Record store rooted at a data directory
pub struct Repository {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl Repository {
    /// Open (creating if needed) the data directory.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        info!(data_dir = %data_dir.display(), "Repository opened");
        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn upsert<R: Keyed>(&self, records: &[R]) -> UpsertSummary {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut summary = UpsertSummary::default();

        let mut table = match CsvTable::<R>::load(&self.data_dir) {
            Ok(table) => table,
            Err(e) => {
                warn!(table = R::TABLE, error = %e, "Failed to load table, batch not stored");
                for record in records {
                    summary.fail(format!("{}: {e:#}", record.label()));
                }
                return summary;
            }
        };

        let mut touched = Vec::with_capacity(records.len());
        let mut inserted = 0usize;
        for record in records {
            if let Err(reason) = record.validate() {
                summary.fail(format!("{}: {reason}", record.label()));
                continue;
            }
            match table.rows.get_mut(&record.key()) {
                Some(existing) => record.merge_into(existing),
                None => {
                    table.rows.insert(record.key(), record.clone());
                    inserted += 1;
                }
            }
            touched.push(record.label());
        }

        if touched.is_empty() {
            return summary;
        }

        match table.store() {
            Ok(()) => {
                summary.saved = touched.len();
                debug!(
                    table = R::TABLE,
                    inserted,
                    updated = touched.len() - inserted,
                    "Table written"
                );
            }
            Err(e) => {
                warn!(table = R::TABLE, error = %e, "Failed to store table");
                for label in touched {
                    summary.fail(format!("{label}: {e:#}"));
                }
            }
        }

        info!(
            table = R::TABLE,
            saved = summary.saved,
            skipped = summary.skipped,
            "Upsert finished"
        );
        summary
    }

    pub fn upsert_settlements(&self, records: &[SettlementRecord]) -> UpsertSummary {
        self.upsert(records)
    }

    pub fn upsert_spot_prices(&self, records: &[SpotPriceRecord]) -> UpsertSummary {
        self.upsert(records)
    }

    pub fn upsert_error_records(&self, records: &[ErrorRecord]) -> UpsertSummary {
        self.upsert(records)
    }

    fn settlements(&self) -> Result<impl Iterator<Item = SettlementRecord>> {
        Ok(CsvTable::<SettlementRecord>::load(&self.data_dir)?.into_values())
    }

    /// Any settlement stored for `date` (and `commodity`, when given).
    pub fn exists(&self, date: NaiveDate, commodity: Option<Commodity>) -> Result<bool> {
        Ok(self
            .settlements()?
            .any(|r| r.date == date && commodity.map_or(true, |c| r.commodity == c)))
    }

    /// Most recent settlement date.
    pub fn latest(&self, commodity: Option<Commodity>) -> Result<Option<NaiveDate>> {
        Ok(self
            .settlements()?
            .filter(|r| commodity.map_or(true, |c| r.commodity == c))
            .map(|r| r.date)
            .max())
    }

    /// Settlements of one trade date, ordered by commodity then expiry.
    pub fn query(
        &self,
        date: NaiveDate,
        commodity: Option<Commodity>,
    ) -> Result<Vec<SettlementRecord>> {
        let mut records: Vec<SettlementRecord> = self
            .settlements()?
            .filter(|r| r.date == date && commodity.map_or(true, |c| r.commodity == c))
            .collect();
        records.sort_by(|a, b| {
            (a.commodity, a.contract_expiry_date).cmp(&(b.commodity, b.contract_expiry_date))
        });
        Ok(records)
    }

    /// Settlements in an inclusive date range, ordered by date, commodity, expiry.
    pub fn settlements_between(
        &self,
        commodity: Option<Commodity>,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<SettlementRecord>> {
        let mut records: Vec<SettlementRecord> = self
            .settlements()?
            .filter(|r| commodity.map_or(true, |c| r.commodity == c))
            .filter(|r| start.map_or(true, |s| r.date >= s))
            .filter(|r| end.map_or(true, |e| r.date <= e))
            .collect();
        records.sort_by(|a, b| {
            (a.date, a.commodity, a.contract_expiry_date).cmp(&(
                b.date,
                b.commodity,
                b.contract_expiry_date,
            ))
        });
        Ok(records)
    }

    /// Spot prices in key order (commodity, date, source).
    pub fn spot_prices(&self, commodity: Option<Commodity>) -> Result<Vec<SpotPriceRecord>> {
        Ok(CsvTable::<SpotPriceRecord>::load(&self.data_dir)?
            .into_values()
            .filter(|r| commodity.map_or(true, |c| r.commodity == c))
            .collect())
    }

    /// Spot price for a commodity and day. With several sources the first in
    /// source order is returned.
    pub fn spot_price(
        &self,
        commodity: Commodity,
        date: NaiveDate,
    ) -> Result<Option<SpotPriceRecord>> {
        Ok(self
            .spot_prices(Some(commodity))?
            .into_iter()
            .find(|r| r.date == date))
    }

    pub fn error_records(
        &self,
        commodity: Option<Commodity>,
        contract_month: Option<&str>,
    ) -> Result<Vec<ErrorRecord>> {
        Ok(CsvTable::<ErrorRecord>::load(&self.data_dir)?
            .into_values()
            .filter(|r| commodity.map_or(true, |c| r.commodity == c))
            .filter(|r| contract_month.map_or(true, |m| r.contract_month == m))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RowPrices;

    fn temp_data_dir(test_name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "settlebasis_persistence_{}_{}",
            test_name,
            uuid::Uuid::new_v4()
        ))
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn settlement(day: NaiveDate, commodity: Commodity, month: &str, settle: f64) -> SettlementRecord {
        SettlementRecord::from_row(
            day,
            commodity,
            month,
            RowPrices {
                open: Some(settle - 0.5),
                settle: Some(settle),
                ..RowPrices::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn upsert_is_idempotent() {
        let data_dir = temp_data_dir("idempotent");
        let repo = Repository::open(&data_dir).unwrap();
        let records = vec![
            settlement(date(2025, 12, 15), Commodity::WTI, "JAN 26", 70.75),
            settlement(date(2025, 12, 15), Commodity::WTI, "FEB 26", 70.40),
        ];

        let first = repo.upsert_settlements(&records);
        assert_eq!(first.saved, 2);
        assert_eq!(first.skipped, 0);

        let second = repo.upsert_settlements(&records);
        assert_eq!(second.saved, 2);
        assert_eq!(second.error_count, 0);

        assert_eq!(repo.query(date(2025, 12, 15), None).unwrap().len(), 2);
        fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn update_changes_mutable_fields_only() {
        let data_dir = temp_data_dir("update");
        let repo = Repository::open(&data_dir).unwrap();
        let original = settlement(date(2025, 12, 15), Commodity::HH, "JAN 26", 4.215);
        repo.upsert_settlements(std::slice::from_ref(&original));

        let mut revised = settlement(date(2025, 12, 15), Commodity::HH, "JAN 26", 4.300);
        revised.est_volume = Some(1000.0);
        repo.upsert_settlements(&[revised]);

        let stored = repo.query(date(2025, 12, 15), Some(Commodity::HH)).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].settle, 4.3);
        assert_eq!(stored[0].est_volume, Some(1000.0));
        assert_eq!(stored[0].created_at, original.created_at);
        fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn invalid_records_are_skipped_and_errors_capped() {
        let data_dir = temp_data_dir("invalid");
        let repo = Repository::open(&data_dir).unwrap();

        let mut spots: Vec<SpotPriceRecord> = (1..=7)
            .map(|d| SpotPriceRecord::new(Commodity::WTI, date(2025, 12, d), f64::NAN, "EIA"))
            .collect();
        spots.push(SpotPriceRecord::new(Commodity::WTI, date(2025, 12, 8), 70.0, "EIA"));

        let summary = repo.upsert_spot_prices(&spots);
        assert_eq!(summary.saved, 1);
        assert_eq!(summary.skipped, 7);
        assert_eq!(summary.error_count, 7);
        assert_eq!(summary.errors.len(), 5);
        assert!(summary.errors[0].starts_with("WTI/2025-12-01/EIA"));
        fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn long_errors_are_truncated() {
        let long = "x".repeat(500);
        let cut = truncate(&long, MAX_ERROR_LEN);
        assert_eq!(cut.chars().count(), MAX_ERROR_LEN + 3);
        assert_eq!(truncate("short", MAX_ERROR_LEN), "short");
    }

    #[test]
    fn read_helpers() {
        let data_dir = temp_data_dir("reads");
        let repo = Repository::open(&data_dir).unwrap();
        assert!(!repo.exists(date(2025, 12, 15), None).unwrap());
        assert_eq!(repo.latest(None).unwrap(), None);

        repo.upsert_settlements(&[
            settlement(date(2025, 12, 12), Commodity::WTI, "FEB 26", 70.4),
            settlement(date(2025, 12, 12), Commodity::WTI, "JAN 26", 70.7),
            settlement(date(2025, 12, 15), Commodity::HH, "JAN 26", 4.2),
        ]);

        assert!(repo.exists(date(2025, 12, 12), Some(Commodity::WTI)).unwrap());
        assert!(!repo.exists(date(2025, 12, 12), Some(Commodity::HH)).unwrap());
        assert_eq!(repo.latest(None).unwrap(), Some(date(2025, 12, 15)));
        assert_eq!(
            repo.latest(Some(Commodity::WTI)).unwrap(),
            Some(date(2025, 12, 12))
        );

        let wti = repo.query(date(2025, 12, 12), Some(Commodity::WTI)).unwrap();
        let months: Vec<&str> = wti.iter().map(|r| r.contract_month.as_str()).collect();
        assert_eq!(months, vec!["JAN 26", "FEB 26"]);

        let ranged = repo
            .settlements_between(None, Some(date(2025, 12, 13)), None)
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].commodity, Commodity::HH);
        fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn spot_lookup_prefers_first_source() {
        let data_dir = temp_data_dir("spot");
        let repo = Repository::open(&data_dir).unwrap();
        repo.upsert_spot_prices(&[
            SpotPriceRecord::new(Commodity::WTI, date(2025, 12, 15), 70.1, "Manual"),
            SpotPriceRecord::new(Commodity::WTI, date(2025, 12, 15), 70.0, "EIA"),
        ]);

        let spot = repo
            .spot_price(Commodity::WTI, date(2025, 12, 15))
            .unwrap()
            .unwrap();
        assert_eq!(spot.source, "EIA");
        assert!(repo.spot_price(Commodity::HH, date(2025, 12, 15)).unwrap().is_none());
        fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn optional_fields_survive_csv() {
        let data_dir = temp_data_dir("optional");
        let repo = Repository::open(&data_dir).unwrap();
        let record = settlement(date(2025, 12, 15), Commodity::WTI, "JAN 26", 70.75);
        repo.upsert_settlements(std::slice::from_ref(&record));

        let stored = repo.query(date(2025, 12, 15), None).unwrap();
        assert_eq!(stored[0].open, Some(70.25));
        assert_eq!(stored[0].high, None);
        assert_eq!(stored[0].contract_expiry_date, date(2026, 1, 31));
        assert!(data_dir.join("settlements.csv").exists());
        assert!(!data_dir.join("settlements.csv.tmp").exists());
        fs::remove_dir_all(&data_dir).ok();
    }

    #[test]
    fn unreadable_table_fails_whole_batch() {
        let data_dir = temp_data_dir("corrupt");
        let repo = Repository::open(&data_dir).unwrap();
        fs::write(data_dir.join("spot_prices.csv"), "commodity,date\nOIL,not-a-date\n").unwrap();

        let summary = repo.upsert_spot_prices(&[SpotPriceRecord::new(
            Commodity::HH,
            date(2025, 12, 15),
            4.1,
            "EIA",
        )]);
        assert_eq!(summary.saved, 0);
        assert_eq!(summary.error_count, 1);
        fs::remove_dir_all(&data_dir).ok();
    }
}
