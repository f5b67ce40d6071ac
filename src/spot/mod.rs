//! Spot module - EIA spot price history
//!
//! Fetches the EIA history pages over plain HTTP and reads spot prices out of
//! their tables. Two layouts are understood: a long table with a date column
//! and a price column, and the year-by-month grid of the monthly history
//! pages.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use reqwest::Client;
use scraper::Html;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::cme::strategies::select_all;
use crate::cme::table::table_rows;
use crate::config::SpotConfig;
use crate::normalize::parse_price;
use crate::rate_limit::RateLimiter;
use crate::types::{Commodity, SpotPriceRecord};

const DAILY_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];
const PRICE_KEYWORDS: &[&str] = &["price", "dollar", "per barrel", "per mmbtu"];
const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

/// HTTP client for the EIA history pages
pub struct EiaClient {
    http: Client,
    config: SpotConfig,
    limiter: RateLimiter,
}

impl EiaClient {
    pub fn new(config: SpotConfig) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;
        let limiter = RateLimiter::new(Duration::from_secs_f64(config.rate_limit_secs.max(0.0)));
        Ok(Self {
            http,
            config,
            limiter,
        })
    }

    /// Download and parse the spot history of one commodity.
    pub async fn fetch(&self, commodity: Commodity) -> Result<Vec<SpotPriceRecord>> {
        self.limiter.wait().await;
        let url = self.config.url_for(commodity);
        debug!(commodity = %commodity, url, "Fetching spot prices");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {url}"))?;
        if !response.status().is_success() {
            bail!("Failed to fetch {} spot prices: {}", commodity, response.status());
        }
        let html = response
            .text()
            .await
            .context("Failed to read spot price page")?;

        let records = parse_spot_tables(&html, commodity, &self.config.source);
        info!(commodity = %commodity, records = records.len(), "Spot prices parsed");
        Ok(records)
    }
}

/// Date cell of an EIA table. Monthly values map to the first of the month.
pub fn parse_spot_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    DAILY_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").ok())
        .or_else(|| {
            let dated = format!("01 {raw}");
            ["%d %b %Y", "%d %B %Y"]
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(&dated, fmt).ok())
        })
}

enum Layout {
    /// One observation per row
    Long { date_col: usize, price_col: usize },
    /// One year per row, one month per column
    Grid {
        year_col: usize,
        months: Vec<(usize, u32)>,
    },
}

fn month_of(header: &str) -> Option<u32> {
    let lower = header.trim().to_lowercase();
    let abbr = lower.get(..3)?;
    MONTHS.iter().position(|m| *m == abbr).map(|i| i as u32 + 1)
}

/// Header row index and layout of a table, if it looks like a price table.
fn detect_layout(rows: &[Vec<String>]) -> Option<(usize, Layout)> {
    let (header_at, header) = rows.iter().enumerate().find(|(_, row)| {
        row.iter().any(|c| {
            let lower = c.to_lowercase();
            lower.contains("date") || lower.contains("year")
        })
    })?;
    let lower: Vec<String> = header.iter().map(|c| c.to_lowercase()).collect();

    let date_col = lower
        .iter()
        .position(|c| c.contains("date") || c.contains("year"))?;
    let price_col = lower
        .iter()
        .position(|c| PRICE_KEYWORDS.iter().any(|k| c.contains(k)));

    if let Some(price_col) = price_col {
        return Some((header_at, Layout::Long { date_col, price_col }));
    }

    let months: Vec<(usize, u32)> = header
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != date_col)
        .filter_map(|(i, c)| month_of(c).map(|m| (i, m)))
        .collect();
    if lower[date_col].contains("year") && !months.is_empty() {
        return Some((
            header_at,
            Layout::Grid {
                year_col: date_col,
                months,
            },
        ));
    }
    None
}

fn records_from_rows(
    rows: &[Vec<String>],
    commodity: Commodity,
    source: &str,
) -> Vec<SpotPriceRecord> {
    let Some((header_at, layout)) = detect_layout(rows) else {
        return Vec::new();
    };
    let body = &rows[header_at + 1..];
    let mut records = Vec::new();

    match layout {
        Layout::Long {
            date_col,
            price_col,
        } => {
            for row in body {
                if row.len() <= date_col.max(price_col) {
                    continue;
                }
                let (Some(date), Some(price)) =
                    (parse_spot_date(&row[date_col]), parse_price(&row[price_col]))
                else {
                    continue;
                };
                records.push(SpotPriceRecord::new(commodity, date, price, source));
            }
        }
        Layout::Grid { year_col, months } => {
            for row in body {
                let Some(year) = row.get(year_col).and_then(|y| y.trim().parse::<i32>().ok())
                else {
                    continue;
                };
                for &(col, month) in &months {
                    let price = row.get(col).and_then(|p| parse_price(p));
                    let date = NaiveDate::from_ymd_opt(year, month, 1);
                    if let (Some(date), Some(price)) = (date, price) {
                        records.push(SpotPriceRecord::new(commodity, date, price, source));
                    }
                }
            }
        }
    }
    records
}

/// All spot prices found in the page's tables, one per day, ordered by date.
/// The first table mentioning a day wins.
pub fn parse_spot_tables(html: &str, commodity: Commodity, source: &str) -> Vec<SpotPriceRecord> {
    let doc = Html::parse_document(html);
    let mut by_date: BTreeMap<NaiveDate, SpotPriceRecord> = BTreeMap::new();

    for (index, table) in select_all(&doc, "table") {
        let rows = table_rows(&table);
        let records = records_from_rows(&rows, commodity, source);
        if !records.is_empty() {
            debug!(table = index, records = records.len(), "Spot table parsed");
        }
        for record in records {
            by_date.entry(record.date).or_insert(record);
        }
    }

    by_date.into_values().collect()
}
