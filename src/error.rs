//! Error taxonomy for the scrape pipeline
//!
//! Row-level parse failures never surface here: the extractor drops those
//! rows. Per-record persistence failures are collected in
//! [`crate::persistence::UpsertSummary`] and missing spot prices are counted as
//! skips by the reconciler.

use chrono::NaiveDate;
use thiserror::Error;

/// Failure talking to the browser automation session
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("failed to start browser session: {0}")]
    Session(String),
    #[error("browser command failed: {0}")]
    Command(String),
    #[error("no element #{index} matches `{css}`")]
    NoSuchElement { css: String, index: usize },
}

/// The rendered page did not contain a usable settlement table
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionError {
    #[error("table has no header cells")]
    NoHeader,
    #[error("required column `{column}` missing from header {headers:?}")]
    MissingColumn {
        column: &'static str,
        headers: Vec<String>,
    },
    #[error(
        "no settlement records found (title: {page_title:?}, tables: {table_count}, date: {date}); rejected: {rejections:?}"
    )]
    NoRecords {
        page_title: String,
        table_count: usize,
        date: NaiveDate,
        /// One line per rejected table
        rejections: Vec<String>,
    },
}

/// Fatal outcome of a scrape session
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("no date selector found on {url} (tried: {})", tried.join(", "))]
    Discovery { url: String, tried: Vec<&'static str> },
    #[error("trade date {0} is not offered by the date selector")]
    DateUnavailable(NaiveDate),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Browser(#[from] BrowserError),
}

impl ScrapeError {
    /// True when the failure points at a changed page layout rather than a
    /// transport or browser problem.
    pub fn is_layout_change(&self) -> bool {
        matches!(
            self,
            ScrapeError::Discovery { .. }
                | ScrapeError::Extraction(ExtractionError::NoRecords { .. })
                | ScrapeError::Extraction(ExtractionError::MissingColumn { .. })
        )
    }
}
