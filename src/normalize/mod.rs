//! Normalizer - text to canonical values
//!
//! Pure parsing helpers for the heterogeneous strings found on exchange and
//! spot pages. Every function returns `None` instead of failing; callers drop
//! the field (or the whole row) on `None`.

use chrono::{Datelike, NaiveDate};

use crate::types::Commodity;

/// General date patterns, tried in order. First match wins.
pub const DATE_FORMATS: &[&str] = &[
    "%m/%d/%Y",
    "%Y-%m-%d",
    "%m-%d-%Y",
    "%Y/%m/%d",
    "%B %d, %Y",
    "%b %d, %Y",
    "%d %b %Y",
    "%d %B %Y",
];

/// Tokens that mean "no value" in exchange tables
const SENTINELS: &[&str] = &["", "-", "NA", "N/A"];

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];

/// CME contract month codes, January first
const MONTH_CODES: [char; 12] = ['F', 'G', 'H', 'J', 'K', 'M', 'N', 'Q', 'U', 'V', 'X', 'Z'];

/// Day of the contract month used as a coarse expiry proxy.
///
/// Real last-trading-day rules differ per product; downstream statistics
/// depend on this exact definition, so keep it.
pub const EXPIRY_PROXY_DAY: u32 = 25;

/// Parse a price cell ("1,234.50", "$70.10", "70.75B").
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '—'))
        .map(|c| if c == '−' { '-' } else { c })
        .collect();
    parse_cleaned(&cleaned)
}

/// Parse a change cell. Parenthesized values are negative: "(0.25)" -> -0.25.
pub fn parse_change(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, ',' | '$' | '—' | ')'))
        .map(|c| match c {
            '(' | '−' => '-',
            other => other,
        })
        .collect();
    parse_cleaned(&cleaned)
}

fn parse_cleaned(cleaned: &str) -> Option<f64> {
    // Broker annotations such as "A"/"B" trail the number.
    let stripped = cleaned
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .trim();
    if SENTINELS.contains(&stripped) {
        return None;
    }
    let value = stripped.parse::<f64>().ok()?;
    value.is_finite().then_some(value)
}

/// Resolve a month label ("JAN 26", "feb 2024") to `(year, month)`.
///
/// Two-digit years below 50 are 20xx, the rest 19xx.
pub fn parse_contract_month(label: &str) -> Option<(i32, u32)> {
    let upper = label.trim().to_uppercase();
    let mut parts = upper.split_whitespace();
    let month_abbr = parts.next()?;
    let year_str = parts.next()?;

    let month = MONTHS.iter().position(|m| *m == month_abbr)? as u32 + 1;

    if !year_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year = match year_str.len() {
        2 => {
            let yy: i32 = year_str.parse().ok()?;
            if yy < 50 {
                2000 + yy
            } else {
                1900 + yy
            }
        }
        4 => year_str.parse().ok()?,
        _ => return None,
    };

    Some((year, month))
}

/// Last calendar day of the contract month: "FEB 24" -> 2024-02-29.
pub fn month_label_to_expiry(label: &str) -> Option<NaiveDate> {
    let (year, month) = parse_contract_month(label)?;
    last_day_of_month(year, month)
}

/// Expiry proxy (25th of the contract month) used for days-to-expiry.
pub fn expiry_proxy_date(label: &str) -> Option<NaiveDate> {
    let (year, month) = parse_contract_month(label)?;
    NaiveDate::from_ymd_opt(year, month, EXPIRY_PROXY_DAY)
}

pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}

/// Try every pattern of [`DATE_FORMATS`] against the whole string.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(trimmed, fmt).ok())
}

/// Date picker option text: "Monday, 15 Dec 2025".
pub fn parse_dropdown_date(raw: &str) -> Option<NaiveDate> {
    let (_, date_part) = raw.split_once(',')?;
    NaiveDate::parse_from_str(date_part.trim(), "%d %b %Y").ok()
}

/// Find a date embedded in free text such as a page title or a header cell
/// ("Settlements as of 12/15/2025", "Trade Date: 15 Dec 2025").
pub fn find_date_in_text(text: &str) -> Option<NaiveDate> {
    if let Some(date) = parse_date(text).or_else(|| parse_dropdown_date(text)) {
        return Some(date);
    }

    let tokens: Vec<&str> = text
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| matches!(c, '(' | ')' | '[' | ']' | ':' | ';' | '|')))
        .filter(|t| !t.is_empty())
        .collect();

    for width in [1, 3] {
        for window in tokens.windows(width) {
            let joined = window.join(" ");
            let candidate = joined.trim_end_matches(['.', ',']);
            if let Some(date) = parse_date(candidate) {
                return Some(date);
            }
        }
    }
    None
}

/// Parse a CME contract symbol: "CLZ2024" -> (WTI, 2024, 12).
pub fn parse_contract_symbol(symbol: &str) -> Option<(Commodity, i32, u32)> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.len() < 5 || !symbol.is_ascii() {
        return None;
    }
    let (code, rest) = symbol.split_at(2);
    let commodity = match code {
        "CL" => Commodity::WTI,
        "NG" => Commodity::HH,
        _ => return None,
    };

    let mut chars = rest.chars();
    let month_code = chars.next()?;
    let month = MONTH_CODES.iter().position(|c| *c == month_code)? as u32 + 1;

    let year_str = chars.as_str();
    if year_str.len() != 4 || !year_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = year_str.parse().ok()?;

    Some((commodity, year, month))
}

/// Month label in the exchange's format: (2026, 1) -> "JAN 26".
pub fn format_month_label(year: i32, month: u32) -> Option<String> {
    let abbr = MONTHS.get(month.checked_sub(1)? as usize)?;
    Some(format!("{} {:02}", abbr, year.rem_euclid(100)))
}

/// Convenience for callers holding a date instead of a label.
pub fn month_label_for(date: NaiveDate) -> Option<String> {
    format_month_label(date.year(), date.month())
}
