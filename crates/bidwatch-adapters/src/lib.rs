//! Source adapter contracts + the three opportunity source adapters.
//!
//! Adapters degrade to an empty batch on failure; the only errors they
//! surface are internal invariant breaks, which the orchestrator logs and
//! treats as zero items.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bidwatch_core::{parse_utc_datetime, FetchOptions, Opportunity};
use bidwatch_storage::HttpFetcher;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use scraper::{Html, Selector};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "bidwatch-adapters";

pub const SAM_SOURCE_ID: &str = "sam.gov";
pub const IMPORT_SOURCE_ID: &str = "missouribuys-import";
pub const BID_BOARD_SOURCE_ID: &str = "missouribuys";

const SAM_SEARCH_URL: &str = "https://api.sam.gov/prod/opportunities/v2/search";
const BID_BOARD_URL: &str = "https://missouribuys.mo.gov/bidboard/Default.aspx";
const SAM_PAGE_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        opts: &FetchOptions,
    ) -> Result<Vec<Opportunity>, AdapterError>;
}

/// Upstream notice payloads are inconsistent about field names; each logical
/// attribute resolves through an ordered candidate list.
const SAM_ID_FIELDS: &[&str] = &["solicitationNumber", "noticeId", "id"];
const SAM_TITLE_FIELDS: &[&str] = &["title", "description"];
const SAM_AGENCY_FIELDS: &[&str] = &["organizationName", "department"];
const SAM_URL_FIELDS: &[&str] = &["uiLink", "webLink"];
const SAM_POSTED_FIELDS: &[&str] = &["publishDate", "modifiedDate"];
const SAM_DUE_FIELDS: &[&str] = &["responseDeadLine"];

const DEFAULT_SAM_KEYWORDS: &[&str] = &["janitorial", "facility support", "IT support"];

fn first_string(value: &JsonValue, candidates: &[&str]) -> Option<String> {
    candidates
        .iter()
        .filter_map(|key| value.get(*key))
        .filter_map(JsonValue::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Paginated keyword search against the SAM.gov opportunities API. Requires
/// `SAM_API_KEY`; without it the adapter skips the run without touching the
/// network.
#[derive(Debug, Clone)]
pub struct SamApiAdapter {
    api_key: Option<String>,
    search_url: String,
}

impl SamApiAdapter {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            search_url: SAM_SEARCH_URL.to_string(),
        }
    }

    pub fn from_env() -> Self {
        Self::new(std::env::var("SAM_API_KEY").ok().filter(|k| !k.is_empty()))
    }

    fn keyword_url(&self, api_key: &str, keyword: &str) -> Result<String, AdapterError> {
        let url = reqwest::Url::parse_with_params(
            &self.search_url,
            &[
                ("api_key", api_key),
                ("q", keyword),
                ("noticeType", "All"),
                ("limit", "50"),
                ("offset", "0"),
                ("sort", "-modifiedDate"),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("building search url: {e}")))?;
        Ok(url.to_string())
    }
}

/// Map one search response page onto the opportunity shape, dropping notices
/// without a resolvable identifier and notices posted before `cutoff`.
/// Notices with no parseable posted date are kept.
pub fn normalize_sam_notices(payload: &JsonValue, cutoff: DateTime<Utc>) -> Vec<Opportunity> {
    let Some(notices) = payload.get("opportunitiesData").and_then(JsonValue::as_array) else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for notice in notices.iter().take(SAM_PAGE_LIMIT) {
        let posted = first_string(notice, SAM_POSTED_FIELDS);
        if let Some(posted_at) = posted.as_deref().and_then(parse_utc_datetime) {
            if posted_at < cutoff {
                continue;
            }
        }
        let Some(id) = first_string(notice, SAM_ID_FIELDS) else {
            continue;
        };
        out.push(Opportunity {
            id,
            title: first_string(notice, SAM_TITLE_FIELDS).unwrap_or_else(|| "Untitled".to_string()),
            agency: first_string(notice, SAM_AGENCY_FIELDS).unwrap_or_else(|| "Unknown".to_string()),
            location: None,
            category: None,
            source: SAM_SOURCE_ID.to_string(),
            url: first_string(notice, SAM_URL_FIELDS)
                .unwrap_or_else(|| "https://sam.gov/".to_string()),
            due_date: first_string(notice, SAM_DUE_FIELDS),
            posted_date: posted,
            raw: Some(notice.clone()),
        });
    }
    out
}

#[async_trait]
impl SourceAdapter for SamApiAdapter {
    fn source_id(&self) -> &'static str {
        SAM_SOURCE_ID
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        opts: &FetchOptions,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        let Some(api_key) = self.api_key.as_deref() else {
            debug!(source_id = SAM_SOURCE_ID, "credential absent; skipping source");
            return Ok(Vec::new());
        };

        let keywords: Vec<String> = if opts.keywords.is_empty() {
            DEFAULT_SAM_KEYWORDS.iter().map(ToString::to_string).collect()
        } else {
            opts.keywords.clone()
        };
        let cutoff = Utc::now() - Duration::days(opts.since_days.max(0));

        let mut results = Vec::new();
        for keyword in &keywords {
            let url = self.keyword_url(api_key, keyword)?;
            let page = match http.get(SAM_SOURCE_ID, &url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(source_id = SAM_SOURCE_ID, keyword = %keyword, error = %err, "keyword search failed; giving up on keyword");
                    continue;
                }
            };
            let payload: JsonValue = match serde_json::from_slice(&page.body) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(source_id = SAM_SOURCE_ID, keyword = %keyword, error = %err, "unparseable search response; giving up on keyword");
                    continue;
                }
            };
            results.extend(normalize_sam_notices(&payload, cutoff));
        }
        Ok(results)
    }
}

/// CSV drop-file import from an external step. Two header shapes are
/// accepted: a full opportunities listing, and a keyword seed file which is
/// validated and yields nothing.
#[derive(Debug, Clone)]
pub struct ImportCsvAdapter {
    path: PathBuf,
}

impl ImportCsvAdapter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn normalize_import_date(value: &str) -> Option<String> {
    if let Ok(date) = NaiveDate::parse_from_str(value, "%m/%d/%Y") {
        return Some(date.to_string());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Some(date.to_string());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date().to_string());
    }
    None
}

fn normalize_import_datetime(value: &str) -> Option<String> {
    let naive = if let Ok(date) = NaiveDate::parse_from_str(value, "%m/%d/%Y") {
        date.and_hms_opt(0, 0, 0)?
    } else if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        dt
    } else if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        date.and_hms_opt(0, 0, 0)?
    } else {
        return None;
    };
    Some(naive.format("%Y-%m-%dT%H:%M:%S").to_string())
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(ToString::to_string)
}

fn parse_import_rows(path: &Path) -> Result<Vec<Opportunity>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();
    let col = |name: &str| headers.iter().position(|h| h == name);

    let has = |name: &str| col(name).is_some();
    if has("keyword") && has("city") && has("state") {
        // Keyword seed shape: read through to validate, parse nothing.
        for record in reader.records() {
            let _ = record?;
        }
        return Ok(Vec::new());
    }
    if !(has("id") && has("title")) {
        return Ok(Vec::new());
    }

    let field = |record: &csv::StringRecord, name: &str| -> Option<String> {
        col(name).and_then(|idx| non_empty(record.get(idx)))
    };

    let mut out = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "dropping malformed import row");
                continue;
            }
        };
        let (Some(id), Some(title)) = (field(&record, "id"), field(&record, "title")) else {
            continue;
        };

        let mut raw = JsonMap::new();
        for (header, value) in headers.iter().zip(record.iter()) {
            raw.insert(header.clone(), JsonValue::String(value.to_string()));
        }

        out.push(Opportunity {
            id,
            title,
            agency: field(&record, "agency").unwrap_or_else(|| "Missouri".to_string()),
            location: field(&record, "location"),
            category: field(&record, "category"),
            source: IMPORT_SOURCE_ID.to_string(),
            url: field(&record, "url").unwrap_or_default(),
            due_date: field(&record, "due_date")
                .as_deref()
                .and_then(normalize_import_date),
            posted_date: field(&record, "created_at")
                .as_deref()
                .and_then(normalize_import_datetime),
            raw: Some(JsonValue::Object(raw)),
        });
    }
    Ok(out)
}

#[async_trait]
impl SourceAdapter for ImportCsvAdapter {
    fn source_id(&self) -> &'static str {
        IMPORT_SOURCE_ID
    }

    async fn fetch(
        &self,
        _http: &HttpFetcher,
        _opts: &FetchOptions,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        let file_len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(_) => {
                debug!(path = %self.path.display(), "import file absent; skipping source");
                return Ok(Vec::new());
            }
        };
        if file_len == 0 {
            return Ok(Vec::new());
        }

        match parse_import_rows(&self.path) {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "import file unreadable; contributing zero items");
                Ok(Vec::new())
            }
        }
    }
}

/// Live scrape of the MissouriBUYS bid board table. One GET, no retries; any
/// network or parse failure contributes zero items.
#[derive(Debug, Clone)]
pub struct BidBoardAdapter {
    url: String,
}

impl Default for BidBoardAdapter {
    fn default() -> Self {
        Self {
            url: BID_BOARD_URL.to_string(),
        }
    }
}

impl BidBoardAdapter {
    pub fn new() -> Self {
        Self::default()
    }
}

fn absolutize_bid_board_href(href: &str) -> String {
    if href.starts_with('/') {
        format!("https://missouribuys.mo.gov{href}")
    } else {
        href.to_string()
    }
}

/// Extract rows that carry both a link and at least identifier + title cells.
pub fn parse_bid_board_rows(html: &str) -> Result<Vec<Opportunity>, AdapterError> {
    let row_sel = Selector::parse("tr").map_err(|e| AdapterError::Message(e.to_string()))?;
    let cell_sel = Selector::parse("td, th").map_err(|e| AdapterError::Message(e.to_string()))?;
    let link_sel = Selector::parse("a").map_err(|e| AdapterError::Message(e.to_string()))?;

    let document = Html::parse_document(html);
    let mut out = Vec::new();
    for row in document.select(&row_sel) {
        let cells: Vec<String> = row
            .select(&cell_sel)
            .map(|cell| cell.text().collect::<String>().trim().to_string())
            .collect();
        let Some(href) = row
            .select(&link_sel)
            .next()
            .and_then(|link| link.value().attr("href"))
        else {
            continue;
        };
        if cells.len() < 2 || cells[0].is_empty() {
            continue;
        }

        out.push(Opportunity {
            id: cells[0].clone(),
            title: cells.get(1).cloned().unwrap_or_default(),
            agency: cells
                .get(2)
                .filter(|c| !c.is_empty())
                .cloned()
                .unwrap_or_else(|| "Missouri".to_string()),
            location: None,
            category: None,
            source: BID_BOARD_SOURCE_ID.to_string(),
            url: absolutize_bid_board_href(href),
            due_date: cells.get(3).filter(|c| !c.is_empty()).cloned(),
            posted_date: None,
            raw: None,
        });
    }
    Ok(out)
}

#[async_trait]
impl SourceAdapter for BidBoardAdapter {
    fn source_id(&self) -> &'static str {
        BID_BOARD_SOURCE_ID
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        _opts: &FetchOptions,
    ) -> Result<Vec<Opportunity>, AdapterError> {
        let page = match http.get_once(BID_BOARD_SOURCE_ID, &self.url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(source_id = BID_BOARD_SOURCE_ID, error = %err, "bid board fetch failed; contributing zero items");
                return Ok(Vec::new());
            }
        };
        let html = String::from_utf8_lossy(&page.body);
        match parse_bid_board_rows(&html) {
            Ok(rows) => Ok(rows),
            Err(err) => {
                warn!(source_id = BID_BOARD_SOURCE_ID, error = %err, "bid board parse failed; contributing zero items");
                Ok(Vec::new())
            }
        }
    }
}

pub fn adapter_for_source(source_id: &str, import_csv: &Path) -> Option<Box<dyn SourceAdapter>> {
    match source_id {
        SAM_SOURCE_ID => Some(Box::new(SamApiAdapter::from_env())),
        IMPORT_SOURCE_ID => Some(Box::new(ImportCsvAdapter::new(import_csv))),
        BID_BOARD_SOURCE_ID => Some(Box::new(BidBoardAdapter::new())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bidwatch_storage::HttpClientConfig;
    use chrono::TimeZone;
    use serde_json::json;

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig::default()).expect("fetcher")
    }

    fn old_cutoff() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap()
    }

    #[test]
    fn sam_notice_fields_resolve_through_candidates() {
        let payload = json!({
            "opportunitiesData": [{
                "solicitationNumber": "W91-123",
                "title": "Custodial Services",
                "organizationName": "Army",
                "uiLink": "https://sam.gov/opp/W91-123",
                "responseDeadLine": "2025-02-01",
                "publishDate": "2025-01-10T00:00:00Z",
                "placeOfPerformance": "Missouri",
                "classificationCode": "S201"
            }]
        });
        let items = normalize_sam_notices(&payload, old_cutoff());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "W91-123");
        assert_eq!(items[0].agency, "Army");
        assert_eq!(items[0].source, SAM_SOURCE_ID);
        assert_eq!(items[0].url, "https://sam.gov/opp/W91-123");
        assert_eq!(items[0].due_date.as_deref(), Some("2025-02-01"));
        assert!(items[0].raw.is_some());
    }

    #[test]
    fn sam_notice_without_identifier_is_dropped() {
        let payload = json!({
            "opportunitiesData": [
                {"title": "No id here"},
                {"noticeId": "N-1", "description": "Fallback title"}
            ]
        });
        let items = normalize_sam_notices(&payload, old_cutoff());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "N-1");
        assert_eq!(items[0].title, "Fallback title");
        assert_eq!(items[0].agency, "Unknown");
        assert_eq!(items[0].url, "https://sam.gov/");
    }

    #[test]
    fn sam_notices_older_than_cutoff_are_dropped_but_undated_kept() {
        let cutoff = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().unwrap();
        let payload = json!({
            "opportunitiesData": [
                {"id": "old", "publishDate": "2024-06-01T00:00:00Z"},
                {"id": "fresh", "publishDate": "2025-03-01T00:00:00Z"},
                {"id": "undated"}
            ]
        });
        let ids: Vec<String> = normalize_sam_notices(&payload, cutoff)
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["fresh".to_string(), "undated".to_string()]);
    }

    #[tokio::test]
    async fn sam_without_credential_returns_empty_without_network() {
        let adapter = SamApiAdapter::new(None);
        let items = adapter
            .fetch(&fetcher(), &FetchOptions::default())
            .await
            .expect("fetch");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn import_csv_normalizes_dates_and_keeps_raw_row() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mobuys.csv");
        std::fs::write(
            &path,
            "id,title,agency,location,category,url,due_date,created_at\n\
             IFB-1,Trash Pickup,MO,Springfield,waste,https://ex/1,01/15/2025,2025-01-01\n",
        )
        .expect("write csv");

        let items = ImportCsvAdapter::new(&path)
            .fetch(&fetcher(), &FetchOptions::default())
            .await
            .expect("fetch");

        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "IFB-1");
        assert_eq!(items[0].due_date.as_deref(), Some("2025-01-15"));
        assert_eq!(items[0].posted_date.as_deref(), Some("2025-01-01T00:00:00"));
        assert_eq!(items[0].location.as_deref(), Some("Springfield"));
        assert_eq!(items[0].source, IMPORT_SOURCE_ID);
        let raw = items[0].raw.as_ref().expect("raw row");
        assert_eq!(raw.get("agency").and_then(|v| v.as_str()), Some("MO"));
    }

    #[tokio::test]
    async fn import_csv_drops_rows_missing_id_or_title() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mobuys.csv");
        std::fs::write(
            &path,
            "id,title,agency\nIFB-1,Trash Pickup,MO\n,No Id,MO\nIFB-2,,MO\n",
        )
        .expect("write csv");

        let items = ImportCsvAdapter::new(&path)
            .fetch(&fetcher(), &FetchOptions::default())
            .await
            .expect("fetch");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "IFB-1");
    }

    #[tokio::test]
    async fn import_csv_keyword_shape_yields_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mobuys.csv");
        std::fs::write(&path, "keyword,city,state\njanitorial,Springfield,MO\n").expect("write csv");

        let items = ImportCsvAdapter::new(&path)
            .fetch(&fetcher(), &FetchOptions::default())
            .await
            .expect("fetch");
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn import_csv_absent_or_empty_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let absent = ImportCsvAdapter::new(dir.path().join("missing.csv"))
            .fetch(&fetcher(), &FetchOptions::default())
            .await
            .expect("fetch absent");
        assert!(absent.is_empty());

        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "").expect("write empty");
        let empty = ImportCsvAdapter::new(&path)
            .fetch(&fetcher(), &FetchOptions::default())
            .await
            .expect("fetch empty");
        assert!(empty.is_empty());
    }

    #[test]
    fn bid_board_rows_require_link_and_columns() {
        let html = r#"
            <table>
              <tr><th>ID</th><th>Title</th><th>Agency</th><th>Due</th></tr>
              <tr>
                <td>BID-1</td><td>Road Salt</td><td>MoDOT</td><td>2025-03-01</td>
                <td><a href="/bid/BID-1">view</a></td>
              </tr>
              <tr><td>BID-2</td><td>No link row</td></tr>
              <tr>
                <td>BID-3</td>
                <td><a href="https://other.example/bid/3">Snow Removal</a></td>
              </tr>
            </table>
        "#;
        let items = parse_bid_board_rows(html).expect("parse");
        assert_eq!(items.len(), 2);

        assert_eq!(items[0].id, "BID-1");
        assert_eq!(items[0].url, "https://missouribuys.mo.gov/bid/BID-1");
        assert_eq!(items[0].agency, "MoDOT");
        assert_eq!(items[0].due_date.as_deref(), Some("2025-03-01"));

        assert_eq!(items[1].id, "BID-3");
        assert_eq!(items[1].url, "https://other.example/bid/3");
        assert_eq!(items[1].agency, "Missouri");
        assert_eq!(items[1].due_date, None);
        assert_eq!(items[1].source, BID_BOARD_SOURCE_ID);
    }

    #[test]
    fn adapter_registry_resolves_known_sources() {
        let import = Path::new("data/import/mobuys.csv");
        assert!(adapter_for_source(SAM_SOURCE_ID, import).is_some());
        assert!(adapter_for_source(IMPORT_SOURCE_ID, import).is_some());
        assert!(adapter_for_source(BID_BOARD_SOURCE_ID, import).is_some());
        assert!(adapter_for_source("unknown", import).is_none());
    }
}
