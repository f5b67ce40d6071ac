//! SettleBasis Library
//!
//! CME settlement scraping, idempotent CSV storage and futures/spot basis
//! reconciliation for WTI crude oil and Henry Hub natural gas.

pub mod cme;
pub mod config;
pub mod error;
pub mod normalize;
pub mod persistence;
pub mod pipeline;
pub mod rate_limit;
pub mod reconcile;
pub mod spot;
pub mod types;
