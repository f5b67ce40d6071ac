//! Settlement table location and row extraction
//!
//! Header cells are classified into semantic fields by case-insensitive
//! substring rules; data rows are mapped through the resulting column map and
//! turned into [`SettlementRecord`]s. Rows without a settle price never become
//! records.

use chrono::NaiveDate;
use scraper::{ElementRef, Html};
use tracing::{debug, info};

use super::strategies::{select_all, text_of};
use crate::error::ExtractionError;
use crate::normalize::{parse_change, parse_price};
use crate::types::{Commodity, RowPrices, SettlementRecord};

/// Semantic column of the settlement table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Month,
    Open,
    High,
    Low,
    Last,
    Change,
    Settle,
    EstVolume,
    PriorDayOpenInterest,
}

impl Field {
    const COUNT: usize = 9;

    fn slot(self) -> usize {
        self as usize
    }
}

/// Classify one header cell. Rules are checked in order; "OPEN INTEREST" never
/// counts as the open price.
pub fn classify_header(text: &str) -> Option<Field> {
    let upper = text.trim().to_uppercase();
    if upper.is_empty() {
        return None;
    }
    let has = |needle: &str| upper.contains(needle);

    if has("MONTH") {
        Some(Field::Month)
    } else if has("OPEN") && !has("INTEREST") {
        Some(Field::Open)
    } else if has("HIGH") {
        Some(Field::High)
    } else if has("LOW") {
        Some(Field::Low)
    } else if has("LAST") {
        Some(Field::Last)
    } else if has("CHANGE") {
        Some(Field::Change)
    } else if has("SETTLE") {
        Some(Field::Settle)
    } else if has("VOLUME") {
        Some(Field::EstVolume)
    } else if has("OPEN INTEREST")
        || has("PRIOR DAY OI")
        || upper.split(|c: char| !c.is_ascii_alphanumeric()).any(|w| w == "OI")
    {
        Some(Field::PriorDayOpenInterest)
    } else {
        None
    }
}

/// Header cell index per field. The first header cell classified as a field
/// owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMap {
    slots: [Option<usize>; Field::COUNT],
}

impl ColumnMap {
    pub fn from_header(header: &[String]) -> Self {
        let mut map = Self::default();
        for (index, cell) in header.iter().enumerate() {
            if let Some(field) = classify_header(cell) {
                map.slots[field.slot()].get_or_insert(index);
            }
        }
        map
    }

    pub fn get(&self, field: Field) -> Option<usize> {
        self.slots[field.slot()]
    }
}

/// Turn a table (header row first) into records.
///
/// Fails when the header is empty or has no settle column. An `Ok` with no
/// records means the table was well-formed but held no usable rows.
pub fn extract_records(
    rows: &[Vec<String>],
    date: NaiveDate,
    commodity: Commodity,
) -> Result<Vec<SettlementRecord>, ExtractionError> {
    let header = match rows.first() {
        Some(h) if h.iter().any(|c| !c.trim().is_empty()) => h,
        _ => return Err(ExtractionError::NoHeader),
    };

    let columns = ColumnMap::from_header(header);
    if columns.get(Field::Settle).is_none() {
        return Err(ExtractionError::MissingColumn {
            column: "settle",
            headers: header.clone(),
        });
    }
    let month_col = columns.get(Field::Month).unwrap_or(0);

    let mut records = Vec::new();
    for row in &rows[1..] {
        if row.len() < 3 {
            continue;
        }
        let month = row.get(month_col).map(|m| m.trim()).unwrap_or_default();
        let month_upper = month.to_uppercase();
        if month.is_empty() || month_upper == "MONTH" || month_upper == "TOTAL" {
            continue;
        }

        let cell = |field: Field| {
            columns
                .get(field)
                .and_then(|i| row.get(i))
                .map(String::as_str)
        };
        let price = |field: Field| cell(field).and_then(parse_price);

        let prices = RowPrices {
            open: price(Field::Open),
            high: price(Field::High),
            low: price(Field::Low),
            last: price(Field::Last),
            change: cell(Field::Change).and_then(parse_change),
            settle: price(Field::Settle),
            est_volume: price(Field::EstVolume),
            prior_day_open_interest: price(Field::PriorDayOpenInterest),
        };

        match SettlementRecord::from_row(date, commodity, month, prices) {
            Some(record) => records.push(record),
            None => debug!(month, "Row dropped (no settle or unknown month)"),
        }
    }

    Ok(records)
}

fn nearest<'a>(el: &ElementRef<'a>, tag: &str) -> Option<ElementRef<'a>> {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == tag)
}

/// Cell texts of a table, header row first.
///
/// Only rows and cells owned by this table count, so nested tables do not
/// leak into their parent. The header is the first row containing a `<th>`,
/// or the first row when there is none.
pub fn table_rows(table: &ElementRef) -> Vec<Vec<String>> {
    let rows: Vec<ElementRef> = table
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "tr")
        .filter(|tr| nearest(tr, "table").map(|t| t.id()) == Some(table.id()))
        .collect();

    let mut header_at = None;
    let mut cells: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    for (i, tr) in rows.iter().enumerate() {
        let row_cells: Vec<ElementRef> = tr
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|e| matches!(e.value().name(), "td" | "th"))
            .filter(|c| nearest(c, "tr").map(|r| r.id()) == Some(tr.id()))
            .collect();
        if header_at.is_none() && row_cells.iter().any(|c| c.value().name() == "th") {
            header_at = Some(i);
        }
        cells.push(row_cells.iter().map(text_of).collect());
    }

    if let Some(h) = header_at {
        let header = cells.remove(h);
        let mut ordered = Vec::with_capacity(cells.len() + 1);
        ordered.push(header);
        ordered.extend(cells.into_iter().skip(h));
        ordered
    } else {
        cells
    }
}

/// Try every table in page order; the first one yielding at least one record
/// wins.
pub fn locate_settlement_table(
    html: &str,
    date: NaiveDate,
    commodity: Commodity,
) -> Result<Vec<SettlementRecord>, ExtractionError> {
    let doc = Html::parse_document(html);
    let tables = select_all(&doc, "table");
    let mut rejections = Vec::new();

    for (index, table) in &tables {
        let rows = table_rows(table);
        match extract_records(&rows, date, commodity) {
            Ok(records) if !records.is_empty() => {
                info!(
                    commodity = %commodity,
                    %date,
                    table = index,
                    records = records.len(),
                    "Settlement table located"
                );
                return Ok(records);
            }
            Ok(_) => rejections.push(format!(
                "table {index}: {} rows, none with a settle price",
                rows.len().saturating_sub(1)
            )),
            Err(e) => rejections.push(format!("table {index}: {e}")),
        }
    }

    Err(ExtractionError::NoRecords {
        page_title: super::strategies::page_title(html),
        table_count: tables.len(),
        date,
        rejections,
    })
}
