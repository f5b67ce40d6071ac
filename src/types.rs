//! Core types used throughout SettleBasis
//!
//! Defines the commodities, the persisted record shapes and their identity keys.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::normalize;

/// Supported commodities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Commodity {
    /// WTI light sweet crude oil
    WTI,
    /// Henry Hub natural gas
    HH,
}

impl Commodity {
    pub const ALL: [Commodity; 2] = [Commodity::WTI, Commodity::HH];

    /// CME product code used in contract symbols (e.g. `CLZ2024`)
    pub fn cme_code(&self) -> &'static str {
        match self {
            Commodity::WTI => "CL",
            Commodity::HH => "NG",
        }
    }

    /// Human readable product name
    pub fn display_name(&self) -> &'static str {
        match self {
            Commodity::WTI => "WTI Crude Oil",
            Commodity::HH => "Henry Hub Natural Gas",
        }
    }

    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "WTI" | "CL" => Some(Commodity::WTI),
            "HH" | "NG" => Some(Commodity::HH),
            _ => None,
        }
    }
}

impl fmt::Display for Commodity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Commodity::WTI => write!(f, "WTI"),
            Commodity::HH => write!(f, "HH"),
        }
    }
}

/// A trade date offered by the exchange's date picker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TradeDate {
    pub iso_date: NaiveDate,
    /// Text exactly as shown by the page (e.g. "Monday, 15 Dec 2025")
    pub display_text: String,
}

/// Optional numeric columns of one settlement table row
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RowPrices {
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub last: Option<f64>,
    pub change: Option<f64>,
    pub settle: Option<f64>,
    pub est_volume: Option<f64>,
    pub prior_day_open_interest: Option<f64>,
}

/// Daily settlement for one futures contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub date: NaiveDate,
    pub commodity: Commodity,
    /// Contract month label as printed by the exchange ("JAN 26")
    pub contract_month: String,
    /// Last calendar day of the contract month
    pub contract_expiry_date: NaiveDate,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub last: Option<f64>,
    pub change: Option<f64>,
    pub settle: f64,
    pub est_volume: Option<f64>,
    pub prior_day_open_interest: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl SettlementRecord {
    /// Build a record from a parsed row.
    ///
    /// Returns `None` when the row has no settle price or the month label
    /// does not resolve to a contract month.
    pub fn from_row(
        date: NaiveDate,
        commodity: Commodity,
        contract_month: &str,
        prices: RowPrices,
    ) -> Option<Self> {
        let settle = prices.settle?;
        let contract_month = contract_month.trim().to_string();
        let contract_expiry_date = normalize::month_label_to_expiry(&contract_month)?;

        Some(Self {
            date,
            commodity,
            contract_month,
            contract_expiry_date,
            open: prices.open,
            high: prices.high,
            low: prices.low,
            last: prices.last,
            change: prices.change,
            settle,
            est_volume: prices.est_volume,
            prior_day_open_interest: prices.prior_day_open_interest,
            created_at: Utc::now(),
        })
    }

    pub fn key(&self) -> SettlementKey {
        SettlementKey {
            date: self.date,
            commodity: self.commodity,
            contract_month: self.contract_month.clone(),
        }
    }
}

/// Business identity of a settlement: `(date, commodity, contract_month)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SettlementKey {
    pub date: NaiveDate,
    pub commodity: Commodity,
    pub contract_month: String,
}

impl fmt::Display for SettlementKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.date, self.commodity, self.contract_month)
    }
}

/// Spot (cash market) price observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotPriceRecord {
    pub commodity: Commodity,
    pub date: NaiveDate,
    pub price: f64,
    /// Publisher of the price, e.g. "EIA"
    pub source: String,
    pub created_at: DateTime<Utc>,
}

impl SpotPriceRecord {
    pub fn new(commodity: Commodity, date: NaiveDate, price: f64, source: &str) -> Self {
        Self {
            commodity,
            date,
            price,
            source: source.to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> SpotKey {
        SpotKey {
            commodity: self.commodity,
            date: self.date,
            source: self.source.clone(),
        }
    }
}

/// Business identity of a spot price: `(commodity, date, source)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpotKey {
    pub commodity: Commodity,
    pub date: NaiveDate,
    pub source: String,
}

impl fmt::Display for SpotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.commodity, self.date, self.source)
    }
}

/// Futures/spot basis error for one settlement matched with one spot price
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Rendered [`SettlementKey`] of the settlement side
    pub settlement_ref: String,
    /// Rendered [`SpotKey`] of the spot side
    pub spot_ref: String,
    pub commodity: Commodity,
    pub contract_month: String,
    pub futures_price: f64,
    pub spot_price: f64,
    pub absolute_error: f64,
    /// `None` when the spot price is zero
    pub percentage_error: Option<f64>,
    /// `None` when the expiry proxy lies before the settlement date
    pub days_to_expiry: Option<i64>,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn key(&self) -> (String, String) {
        (self.settlement_ref.clone(), self.spot_ref.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn settlement_requires_settle_price() {
        let prices = RowPrices {
            open: Some(70.1),
            high: Some(71.0),
            ..RowPrices::default()
        };
        assert!(SettlementRecord::from_row(date(2025, 12, 15), Commodity::WTI, "JAN 26", prices).is_none());
    }

    #[test]
    fn settlement_derives_expiry_from_label() {
        let prices = RowPrices {
            settle: Some(70.75),
            ..RowPrices::default()
        };
        let record =
            SettlementRecord::from_row(date(2025, 12, 15), Commodity::WTI, " JAN 26 ", prices).unwrap();
        assert_eq!(record.contract_month, "JAN 26");
        assert_eq!(record.contract_expiry_date, date(2026, 1, 31));
        assert_eq!(record.key().to_string(), "2025-12-15/WTI/JAN 26");
    }

    #[test]
    fn settlement_with_unknown_month_is_dropped() {
        let prices = RowPrices {
            settle: Some(3.1),
            ..RowPrices::default()
        };
        assert!(SettlementRecord::from_row(date(2025, 12, 15), Commodity::HH, "FOO 26", prices).is_none());
    }

    #[test]
    fn commodity_parsing_accepts_cme_codes() {
        assert_eq!(Commodity::from_str("wti"), Some(Commodity::WTI));
        assert_eq!(Commodity::from_str("NG"), Some(Commodity::HH));
        assert_eq!(Commodity::from_str("BRENT"), None);
        assert_eq!(SpotPriceRecord::new(Commodity::HH, date(2025, 1, 2), 3.2, "EIA").key().to_string(), "HH/2025-01-02/EIA");
    }
}
