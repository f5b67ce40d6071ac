//! Element discovery strategies
//!
//! Each page control (date picker, product tab, "load all" button) is located
//! by an ordered list of named strategies. A strategy inspects an HTML snapshot
//! and returns an optional match; [`first_match`] walks the list and stops at
//! the first hit. Order and predicates live here as data so they can be tested
//! without a browser.

use chrono::NaiveDate;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use super::browser::Target;
use crate::normalize;
use crate::types::TradeDate;

/// A named discovery function
#[derive(Clone, Copy)]
pub struct Strategy<T> {
    pub name: &'static str,
    pub find: fn(&Html) -> Option<T>,
}

impl<T> std::fmt::Debug for Strategy<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strategy").field("name", &self.name).finish()
    }
}

/// Run strategies in order; return the first match and the name of the
/// strategy that produced it.
pub fn first_match<T>(doc: &Html, strategies: &[Strategy<T>]) -> Option<(&'static str, T)> {
    for strategy in strategies {
        if let Some(found) = (strategy.find)(doc) {
            debug!(strategy = strategy.name, "Strategy matched");
            return Some((strategy.name, found));
        }
        debug!(strategy = strategy.name, "Strategy found nothing");
    }
    None
}

pub fn strategy_names<T>(strategies: &[Strategy<T>]) -> Vec<&'static str> {
    strategies.iter().map(|s| s.name).collect()
}

// ---------------------------------------------------------------------------
// DOM helpers
// ---------------------------------------------------------------------------

const OPTION_CSS: &str = "[role='option'], .date-option, .dropdown-item";
const TAB_CSS: &str = "[role='tab']";
const LINK_CSS: &str = "button, a";
const OWN_TEXT_CSS: &str = "div, span, li";
const ATTRIBUTE_CSS: &str = "button, a, input, [role='button']";
const SCAN_CSS: &str = "button, a, input, [role='button'], span, div";
const OPENER_CSS: &str = "[role='combobox'], .date-selector, input";

/// Longest text a scanned element may carry and still count as a button label
const SCAN_MAX_TEXT: usize = 30;

/// Elements matching `css` with their index among all matches.
pub(crate) fn select_all<'a>(doc: &'a Html, css: &str) -> Vec<(usize, ElementRef<'a>)> {
    match Selector::parse(css) {
        Ok(selector) => doc.select(&selector).enumerate().collect(),
        Err(e) => {
            warn!(css, error = %e, "Invalid selector");
            Vec::new()
        }
    }
}

/// Descendant text with whitespace runs collapsed.
pub(crate) fn text_of(el: &ElementRef) -> String {
    el.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

/// Text of direct text children only.
fn own_text(el: &ElementRef) -> String {
    el.children()
        .filter_map(|child| child.value().as_text())
        .flat_map(|t| t.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

fn attr_lower(el: &ElementRef, name: &str) -> String {
    el.value().attr(name).unwrap_or_default().to_lowercase()
}

/// Hidden by attribute or inline style, on the element or any ancestor.
fn is_hidden(el: &ElementRef) -> bool {
    std::iter::once(*el)
        .chain(el.ancestors().filter_map(ElementRef::wrap))
        .any(|node| {
            let v = node.value();
            let style: String = attr_lower(&node, "style")
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            v.attr("hidden").is_some()
                || v.attr("aria-hidden") == Some("true")
                || style.contains("display:none")
                || style.contains("visibility:hidden")
        })
}

fn option_date(text: &str) -> Option<NaiveDate> {
    normalize::parse_dropdown_date(text).or_else(|| normalize::parse_date(text))
}

fn options_of<'a>(select: &ElementRef<'a>) -> Vec<ElementRef<'a>> {
    select
        .descendants()
        .filter_map(ElementRef::wrap)
        .filter(|e| e.value().name() == "option")
        .collect()
}

// ---------------------------------------------------------------------------
// Trade date list
// ---------------------------------------------------------------------------

/// Ordered strategies for the list of offered trade dates
pub const DATE_LIST_STRATEGIES: &[Strategy<Vec<TradeDate>>] = &[
    Strategy {
        name: "select-options",
        find: dates_from_select,
    },
    Strategy {
        name: "clickable-options",
        find: dates_from_clickable_options,
    },
];

fn to_trade_date(text: String) -> Option<TradeDate> {
    option_date(&text).map(|iso_date| TradeDate {
        iso_date,
        display_text: text,
    })
}

/// First `<select>` with at least one parseable option.
fn dates_from_select(doc: &Html) -> Option<Vec<TradeDate>> {
    select_all(doc, "select").into_iter().find_map(|(_, select)| {
        let dates: Vec<TradeDate> = options_of(&select)
            .iter()
            .filter_map(|o| to_trade_date(text_of(o)))
            .collect();
        (!dates.is_empty()).then_some(dates)
    })
}

fn dates_from_clickable_options(doc: &Html) -> Option<Vec<TradeDate>> {
    let dates: Vec<TradeDate> = select_all(doc, OPTION_CSS)
        .into_iter()
        .filter_map(|(_, el)| to_trade_date(text_of(&el)))
        .collect();
    (!dates.is_empty()).then_some(dates)
}

pub fn find_trade_dates(html: &str) -> Option<(&'static str, Vec<TradeDate>)> {
    first_match(&Html::parse_document(html), DATE_LIST_STRATEGIES)
}

// ---------------------------------------------------------------------------
// Product tab
// ---------------------------------------------------------------------------

/// Located "Futures" tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabMatch {
    pub target: Target,
    /// Already shown as the selected tab
    pub active: bool,
}

pub const TAB_STRATEGIES: &[Strategy<TabMatch>] = &[
    Strategy {
        name: "role-tab",
        find: tab_by_role,
    },
    Strategy {
        name: "button-exact",
        find: tab_by_exact_text,
    },
    Strategy {
        name: "button-contains",
        find: tab_by_contained_text,
    },
    Strategy {
        name: "own-text",
        find: tab_by_own_text,
    },
];

const FUTURES: &str = "FUTURES";

fn is_active(el: &ElementRef) -> bool {
    let class = attr_lower(el, "class");
    let current = el.value().attr("aria-current");
    class.contains("active")
        || class.contains("selected")
        || el.value().attr("aria-selected") == Some("true")
        || matches!(current, Some(v) if v != "false")
}

fn tab_where(doc: &Html, css: &str, pred: impl Fn(&ElementRef) -> bool) -> Option<TabMatch> {
    select_all(doc, css)
        .into_iter()
        .find(|(_, el)| pred(el))
        .map(|(index, el)| TabMatch {
            target: Target::new(css, index),
            active: is_active(&el),
        })
}

fn tab_by_role(doc: &Html) -> Option<TabMatch> {
    tab_where(doc, TAB_CSS, |el| text_of(el).to_uppercase() == FUTURES)
}

fn tab_by_exact_text(doc: &Html) -> Option<TabMatch> {
    tab_where(doc, LINK_CSS, |el| text_of(el).to_uppercase() == FUTURES)
}

fn tab_by_contained_text(doc: &Html) -> Option<TabMatch> {
    tab_where(doc, LINK_CSS, |el| text_of(el).to_uppercase().contains(FUTURES))
}

fn tab_by_own_text(doc: &Html) -> Option<TabMatch> {
    tab_where(doc, OWN_TEXT_CSS, |el| own_text(el).to_uppercase().contains(FUTURES))
}

pub fn find_futures_tab(html: &str) -> Option<(&'static str, TabMatch)> {
    first_match(&Html::parse_document(html), TAB_STRATEGIES)
}

// ---------------------------------------------------------------------------
// Selected settlement date
// ---------------------------------------------------------------------------

pub const DATE_DETECTION_STRATEGIES: &[Strategy<NaiveDate>] = &[
    Strategy {
        name: "selected-option",
        find: date_from_selected_option,
    },
    Strategy {
        name: "page-title",
        find: date_from_title,
    },
    Strategy {
        name: "table-header",
        find: date_from_table_header,
    },
];

/// Selected option of the first date `<select>`; a select without a
/// `selected` option shows its first option.
fn date_from_selected_option(doc: &Html) -> Option<NaiveDate> {
    select_all(doc, "select").into_iter().find_map(|(_, select)| {
        let options = options_of(&select);
        let shown = options
            .iter()
            .find(|o| o.value().attr("selected").is_some())
            .or_else(|| options.first())?;
        option_date(&text_of(shown))
    })
}

fn date_from_title(doc: &Html) -> Option<NaiveDate> {
    select_all(doc, "title")
        .into_iter()
        .find_map(|(_, t)| normalize::find_date_in_text(&text_of(&t)))
}

fn date_from_table_header(doc: &Html) -> Option<NaiveDate> {
    select_all(doc, "th").into_iter().find_map(|(_, th)| {
        let text = text_of(&th);
        let upper = text.to_uppercase();
        if upper.contains("SETTLEMENT") || upper.contains("DATE") {
            normalize::find_date_in_text(&text)
        } else {
            None
        }
    })
}

pub fn page_title(html: &str) -> String {
    let doc = Html::parse_document(html);
    select_all(&doc, "title")
        .first()
        .map(|(_, t)| text_of(t))
        .unwrap_or_default()
}

pub fn detect_settlement_date(html: &str) -> Option<(&'static str, NaiveDate)> {
    first_match(&Html::parse_document(html), DATE_DETECTION_STRATEGIES)
}

// ---------------------------------------------------------------------------
// "Load all" control
// ---------------------------------------------------------------------------

pub const LOAD_ALL_STRATEGIES: &[Strategy<Target>] = &[
    Strategy {
        name: "exact-text",
        find: load_all_exact,
    },
    Strategy {
        name: "case-insensitive-text",
        find: load_all_case_insensitive,
    },
    Strategy {
        name: "attribute",
        find: load_all_by_attribute,
    },
    Strategy {
        name: "scan",
        find: load_all_scan,
    },
];

fn visible_target(doc: &Html, css: &str, pred: impl Fn(&ElementRef) -> bool) -> Option<Target> {
    select_all(doc, css)
        .into_iter()
        .find(|(_, el)| pred(el) && !is_hidden(el))
        .map(|(index, _)| Target::new(css, index))
}

fn load_all_exact(doc: &Html) -> Option<Target> {
    visible_target(doc, LINK_CSS, |el| text_of(el) == "LOAD ALL")
}

fn load_all_case_insensitive(doc: &Html) -> Option<Target> {
    visible_target(doc, LINK_CSS, |el| {
        let text = text_of(el).to_lowercase();
        text.contains("load all") || text.replace(' ', "").contains("loadall")
    })
}

fn load_all_by_attribute(doc: &Html) -> Option<Target> {
    visible_target(doc, ATTRIBUTE_CSS, |el| {
        let labelled = ["value", "aria-label", "title"]
            .iter()
            .any(|attr| attr_lower(el, attr).contains("load all"));
        let named = ["class", "id"].iter().any(|attr| {
            let v = attr_lower(el, attr);
            v.contains("load") && v.contains("all")
        });
        labelled || named
    })
}

fn load_all_scan(doc: &Html) -> Option<Target> {
    visible_target(doc, SCAN_CSS, |el| {
        let text = text_of(el).to_uppercase();
        text.len() <= SCAN_MAX_TEXT && text.contains("LOAD") && text.contains("ALL")
    })
}

pub fn find_load_all(html: &str) -> Option<(&'static str, Target)> {
    first_match(&Html::parse_document(html), LOAD_ALL_STRATEGIES)
}

// ---------------------------------------------------------------------------
// Choosing a specific trade date
// ---------------------------------------------------------------------------

/// How to switch the page to a requested trade date
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatePick {
    /// Choose `label` in the `<select>` at `target`
    Select { target: Target, label: String },
    /// Click a custom dropdown entry
    Click(Target),
}

/// Find the control entry for `date`: a `<select>` option first, then a
/// clickable option element.
pub fn plan_date_pick(html: &str, date: NaiveDate) -> Option<DatePick> {
    let doc = Html::parse_document(html);

    let from_select = select_all(&doc, "select").into_iter().find_map(|(index, select)| {
        options_of(&select).iter().find_map(|o| {
            let label = text_of(o);
            (option_date(&label) == Some(date)).then(|| DatePick::Select {
                target: Target::new("select", index),
                label,
            })
        })
    });

    from_select.or_else(|| {
        select_all(&doc, OPTION_CSS)
            .into_iter()
            .find(|(_, el)| option_date(&text_of(el)) == Some(date))
            .map(|(index, _)| DatePick::Click(Target::new(OPTION_CSS, index)))
    })
}

/// Control that opens a custom date dropdown.
pub fn find_date_opener(html: &str) -> Option<Target> {
    let doc = Html::parse_document(html);
    select_all(&doc, OPENER_CSS)
        .into_iter()
        .find(|(_, el)| {
            let v = el.value();
            if v.name() == "input" {
                ["placeholder", "aria-label"]
                    .iter()
                    .any(|attr| attr_lower(el, attr).contains("date"))
            } else {
                v.attr("role") == Some("combobox") || attr_lower(el, "class").contains("date-selector")
            }
        })
        .map(|(index, _)| Target::new(OPENER_CSS, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    const DATE_SELECT: &str = r#"
        <html><head><title>Light Sweet Crude Oil Settlements</title></head><body>
          <select id="product"><option>Crude</option><option>Gas</option></select>
          <select id="trade-date">
            <option>Monday, 15 Dec 2025</option>
            <option selected>Friday, 12 Dec 2025</option>
            <option>Thursday, 11 Dec 2025</option>
          </select>
        </body></html>"#;

    #[test]
    fn date_list_prefers_select_with_parseable_options() {
        let (name, dates) = find_trade_dates(DATE_SELECT).unwrap();
        assert_eq!(name, "select-options");
        assert_eq!(dates.len(), 3);
        assert_eq!(dates[0].iso_date, date(2025, 12, 15));
        assert_eq!(dates[0].display_text, "Monday, 15 Dec 2025");
    }

    #[test]
    fn date_list_falls_back_to_clickable_options() {
        let html = r#"<ul>
            <li role="option">Monday, 15 Dec 2025</li>
            <li class="dropdown-item">Friday, 12 Dec 2025</li>
            <li class="dropdown-item">Settings</li>
        </ul>"#;
        let (name, dates) = find_trade_dates(html).unwrap();
        assert_eq!(name, "clickable-options");
        assert_eq!(dates.len(), 2);
    }

    #[test]
    fn date_list_none_without_any_control() {
        assert!(find_trade_dates("<div>Settlements</div>").is_none());
    }

    #[test]
    fn strategy_order_is_explicit() {
        assert_eq!(
            strategy_names(LOAD_ALL_STRATEGIES),
            vec!["exact-text", "case-insensitive-text", "attribute", "scan"]
        );
        assert_eq!(
            strategy_names(DATE_DETECTION_STRATEGIES),
            vec!["selected-option", "page-title", "table-header"]
        );
    }

    #[test]
    fn futures_tab_by_role_reports_active_state() {
        let html = r#"
            <div role="tab" class="tab">Options</div>
            <div role="tab" class="tab is-active" aria-selected="true">Futures</div>"#;
        let (name, tab) = find_futures_tab(html).unwrap();
        assert_eq!(name, "role-tab");
        assert_eq!(tab.target, Target::new(TAB_CSS, 1));
        assert!(tab.active);
    }

    #[test]
    fn futures_tab_by_button_text() {
        let html = r#"<a href="/opt">Options</a><button>Futures</button>"#;
        let (name, tab) = find_futures_tab(html).unwrap();
        assert_eq!(name, "button-exact");
        assert_eq!(tab.target, Target::new(LINK_CSS, 1));
        assert!(!tab.active);

        let html = r#"<a href="/fut">Crude Futures Settlements</a>"#;
        assert_eq!(find_futures_tab(html).unwrap().0, "button-contains");

        let html = r#"<ul><li>Futures</li></ul>"#;
        assert_eq!(find_futures_tab(html).unwrap().0, "own-text");
    }

    #[test]
    fn settlement_date_priority() {
        let (name, d) = detect_settlement_date(DATE_SELECT).unwrap();
        assert_eq!(name, "selected-option");
        assert_eq!(d, date(2025, 12, 12));

        let html = r#"<html><head><title>Settlements as of 12/15/2025</title></head>
            <body><table><tr><th>Trade Date 12/01/2025</th></tr></table></body></html>"#;
        let (name, d) = detect_settlement_date(html).unwrap();
        assert_eq!(name, "page-title");
        assert_eq!(d, date(2025, 12, 15));

        let html = r#"<html><head><title>Settlements</title></head>
            <body><table><tr><th>Month</th><th>Settlement Date: 15 Dec 2025</th></tr></table></body></html>"#;
        let (name, d) = detect_settlement_date(html).unwrap();
        assert_eq!(name, "table-header");
        assert_eq!(d, date(2025, 12, 15));

        assert!(detect_settlement_date("<title>Settlements</title>").is_none());
    }

    #[test]
    fn load_all_strategies_in_order() {
        let html = r#"<button>Load More</button><button>LOAD ALL</button>"#;
        assert_eq!(
            find_load_all(html).unwrap(),
            ("exact-text", Target::new(LINK_CSS, 1))
        );

        let html = r##"<a href="#">Load all contracts</a>"##;
        assert_eq!(find_load_all(html).unwrap().0, "case-insensitive-text");

        let html = r#"<button aria-label="Load all rows">+</button>"#;
        assert_eq!(find_load_all(html).unwrap().0, "attribute");

        let html = r#"<input type="button" class="btn load-all-btn">"#;
        assert_eq!(find_load_all(html).unwrap().0, "attribute");

        let html = r#"<div><span>Load ALL</span></div>"#;
        let (name, target) = find_load_all(html).unwrap();
        assert_eq!(name, "scan");
        // outer div carries the same short text and comes first in document order
        assert_eq!(target, Target::new(SCAN_CSS, 0));
    }

    #[test]
    fn load_all_skips_hidden_controls() {
        let html = r#"
            <div style="display: none"><button>LOAD ALL</button></div>
            <button hidden>Load all</button>
            <div class="footer"><button class="primary">Load All</button></div>"#;
        let (name, target) = find_load_all(html).unwrap();
        assert_eq!(name, "case-insensitive-text");
        assert_eq!(target, Target::new(LINK_CSS, 2));
    }

    #[test]
    fn load_all_absent() {
        assert!(find_load_all("<button>Refresh</button>").is_none());
    }

    #[test]
    fn date_pick_from_select_or_options() {
        assert_eq!(
            plan_date_pick(DATE_SELECT, date(2025, 12, 11)),
            Some(DatePick::Select {
                target: Target::new("select", 1),
                label: "Thursday, 11 Dec 2025".to_string(),
            })
        );

        let html = r#"<div role="option">Monday, 15 Dec 2025</div><div role="option">Friday, 12 Dec 2025</div>"#;
        assert_eq!(
            plan_date_pick(html, date(2025, 12, 12)),
            Some(DatePick::Click(Target::new(OPTION_CSS, 1)))
        );
        assert_eq!(plan_date_pick(html, date(2025, 1, 2)), None);
    }

    #[test]
    fn date_opener() {
        let html = r#"<input placeholder="Search"><input aria-label="Trade date"><div class="date-selector"></div>"#;
        assert_eq!(find_date_opener(html), Some(Target::new(OPENER_CSS, 1)));
        assert_eq!(find_date_opener("<input placeholder='Search'>"), None);
    }
}
