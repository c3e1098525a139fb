//! Core domain model and filter stage for bidwatch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "bidwatch-core";

/// One normalized contract/bid listing as produced by a source adapter.
///
/// Constructed fresh on every run, never mutated; only the identifier
/// outlives the run (in the seen-set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub title: String,
    pub agency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub source: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_date: Option<String>,
    /// Upstream payload kept verbatim for audit/debug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<JsonValue>,
}

/// Per-run options handed to every adapter. Adapters are free to ignore
/// either field; today only the API adapter consumes them.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub since_days: i64,
    pub keywords: Vec<String>,
}

/// Keyword/region filter configuration applied uniformly after all adapters
/// have reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
}

impl FilterOptions {
    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty() && self.regions.is_empty()
    }
}

fn haystack(opp: &Opportunity) -> String {
    let mut text = format!("{} {}", opp.title, opp.agency);
    if let Some(location) = &opp.location {
        text.push(' ');
        text.push_str(location);
    }
    if let Some(category) = &opp.category {
        text.push(' ');
        text.push_str(category);
    }
    text.to_lowercase()
}

fn any_term_matches(text: &str, terms: &[String]) -> bool {
    terms
        .iter()
        .any(|term| text.contains(&term.to_lowercase()))
}

/// Keep an opportunity when every configured term set has at least one
/// case-insensitive substring match against title+agency+location+category.
/// With no keywords and no regions configured this is the identity.
pub fn apply_filters(opportunities: Vec<Opportunity>, filters: &FilterOptions) -> Vec<Opportunity> {
    if filters.is_empty() {
        return opportunities;
    }
    opportunities
        .into_iter()
        .filter(|opp| {
            let text = haystack(opp);
            let keyword_ok = filters.keywords.is_empty() || any_term_matches(&text, &filters.keywords);
            let region_ok = filters.regions.is_empty() || any_term_matches(&text, &filters.regions);
            keyword_ok && region_ok
        })
        .collect()
}

/// Lenient timestamp parsing for upstream date strings: RFC 3339 first, then
/// a bare `YYYY-MM-DDTHH:MM:SS`, then a bare date at midnight.
pub fn parse_utc_datetime(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    None
}

/// Order a batch newest-first by posted date, then by due date. Records
/// without a parseable posted date sort last.
pub fn sort_newest_first(batch: &mut [Opportunity]) {
    batch.sort_by_key(|opp| {
        let posted = opp
            .posted_date
            .as_deref()
            .and_then(parse_utc_datetime)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let due = opp
            .due_date
            .as_deref()
            .and_then(parse_utc_datetime)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        std::cmp::Reverse((posted, due))
    });
}
