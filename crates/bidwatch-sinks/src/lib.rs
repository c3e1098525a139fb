//! Output sinks for a processed opportunity batch.
//!
//! File sinks are idempotent per call: re-running overwrites the destination
//! atomically. Tracker sinks are best-effort and report a typed outcome per
//! item instead of raising.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bidwatch_core::{parse_utc_datetime, Opportunity};
use bidwatch_storage::{write_atomic, write_json_atomic};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::debug;

pub const CRATE_NAME: &str = "bidwatch-sinks";

pub const CSV_COLUMNS: &[&str] = &[
    "id",
    "title",
    "agency",
    "source",
    "link",
    "location",
    "posted_date",
    "due_date",
];

const TRACKER_PUSH_CAP: usize = 50;
const TRACKER_TIMEOUT: Duration = Duration::from_secs(20);

/// Full batch as a pretty-printed JSON array.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSink;

impl JsonSink {
    pub async fn write(&self, path: impl AsRef<Path>, items: &[Opportunity]) -> Result<()> {
        write_json_atomic(path, &items).await
    }
}

/// Fixed-column CSV mirror; missing fields render as empty cells.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvSink;

impl CsvSink {
    pub async fn write(&self, path: impl AsRef<Path>, items: &[Opportunity]) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(CSV_COLUMNS)
            .context("writing csv header")?;
        for item in items {
            writer
                .write_record([
                    item.id.as_str(),
                    item.title.as_str(),
                    item.agency.as_str(),
                    item.source.as_str(),
                    item.url.as_str(),
                    item.location.as_deref().unwrap_or(""),
                    item.posted_date.as_deref().unwrap_or(""),
                    item.due_date.as_deref().unwrap_or(""),
                ])
                .context("writing csv row")?;
        }
        let bytes = writer
            .into_inner()
            .context("flushing csv buffer")?;
        write_atomic(path, &bytes).await
    }
}

fn due_sort_key(item: &Opportunity) -> (bool, DateTime<Utc>) {
    match item.due_date.as_deref().and_then(parse_utc_datetime) {
        Some(due) => (false, due),
        None => (true, DateTime::<Utc>::MAX_UTC),
    }
}

/// Human-readable report: one section per source, items ordered by due date
/// ascending with undated items last.
pub fn render_markdown(items: &[Opportunity]) -> String {
    let mut by_source: BTreeMap<&str, Vec<&Opportunity>> = BTreeMap::new();
    for item in items {
        by_source.entry(item.source.as_str()).or_default().push(item);
    }

    let mut lines = vec!["# Contract Opportunities".to_string(), String::new()];
    for (source, group) in &mut by_source {
        group.sort_by_key(|item| due_sort_key(item));
        lines.push(format!("## {source}"));
        lines.push(String::new());
        for item in group.iter() {
            let label = if item.url.is_empty() {
                item.title.clone()
            } else {
                format!("[{}]({})", item.title, item.url)
            };
            let due = item.due_date.as_deref().unwrap_or("N/A");
            lines.push(format!("- {} | {} | due: {}", label, item.agency, due));
        }
        lines.push(String::new());
    }
    lines.join("\n")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MarkdownSink;

impl MarkdownSink {
    pub async fn write(&self, path: impl AsRef<Path>, items: &[Opportunity]) -> Result<()> {
        write_atomic(path, render_markdown(items).as_bytes()).await
    }
}

/// Per-item disposition from a tracker sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Sent,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub status: ItemStatus,
}

/// Whole-sink disposition: skipped entirely when configuration is absent,
/// otherwise one outcome per attempted item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkRun {
    Skipped { reason: String },
    Completed(Vec<ItemOutcome>),
}

impl SinkRun {
    pub fn sent_count(&self) -> usize {
        match self {
            SinkRun::Skipped { .. } => 0,
            SinkRun::Completed(outcomes) => outcomes
                .iter()
                .filter(|o| o.status == ItemStatus::Sent)
                .count(),
        }
    }

    pub fn failed_count(&self) -> usize {
        match self {
            SinkRun::Skipped { .. } => 0,
            SinkRun::Completed(outcomes) => outcomes
                .iter()
                .filter(|o| matches!(o.status, ItemStatus::Failed { .. }))
                .count(),
        }
    }
}

fn tracker_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(TRACKER_TIMEOUT)
        .build()
        .context("building tracker http client")
}

fn outcome_from_response(
    id: &str,
    response: std::result::Result<reqwest::Response, reqwest::Error>,
) -> ItemOutcome {
    let status = match response {
        Ok(resp) if resp.status().is_success() => ItemStatus::Sent,
        Ok(resp) => ItemStatus::Failed {
            reason: format!("http status {}", resp.status().as_u16()),
        },
        Err(err) => ItemStatus::Failed {
            reason: err.to_string(),
        },
    };
    ItemOutcome {
        id: id.to_string(),
        status,
    }
}

/// Opens one issue per new item. Requires `GITHUB_TOKEN` and `GITHUB_REPO`
/// (`owner/repo`); without them the sink is a successful no-op.
#[derive(Debug, Clone)]
pub struct GitHubIssueSink {
    token: Option<String>,
    repo: Option<String>,
    client: reqwest::Client,
}

impl GitHubIssueSink {
    pub fn new(token: Option<String>, repo: Option<String>) -> Result<Self> {
        Ok(Self {
            token,
            repo,
            client: tracker_client()?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(
            std::env::var("GITHUB_TOKEN").ok().filter(|v| !v.is_empty()),
            std::env::var("GITHUB_REPO").ok().filter(|v| !v.is_empty()),
        )
    }

    pub async fn push(&self, items: &[Opportunity]) -> SinkRun {
        let (Some(token), Some(repo)) = (self.token.as_deref(), self.repo.as_deref()) else {
            debug!("github sink unconfigured; skipping");
            return SinkRun::Skipped {
                reason: "missing GITHUB_TOKEN or GITHUB_REPO".to_string(),
            };
        };

        let url = format!("https://api.github.com/repos/{repo}/issues");
        let mut outcomes = Vec::with_capacity(items.len());
        for item in items.iter().take(TRACKER_PUSH_CAP) {
            let body = format!(
                "- Agency: {}\n- Source: {}\n- Due: {}\n- Link: {}\n",
                item.agency,
                item.source,
                item.due_date.as_deref().unwrap_or("N/A"),
                item.url,
            );
            let payload = json!({
                "title": format!("[{}] {}", item.source, item.title),
                "body": body,
                "labels": ["opportunity"],
            });
            let response = self
                .client
                .post(&url)
                .bearer_auth(token)
                .header(reqwest::header::USER_AGENT, "bidwatch")
                .header(reqwest::header::ACCEPT, "application/vnd.github+json")
                .json(&payload)
                .send()
                .await;
            outcomes.push(outcome_from_response(&item.id, response));
        }
        SinkRun::Completed(outcomes)
    }
}

/// Pushes new items as pages into a Notion database. Requires `NOTION_TOKEN`
/// and `NOTION_DB_ID`; without them the sink is a successful no-op.
#[derive(Debug, Clone)]
pub struct NotionSink {
    token: Option<String>,
    database_id: Option<String>,
    client: reqwest::Client,
}

impl NotionSink {
    pub fn new(token: Option<String>, database_id: Option<String>) -> Result<Self> {
        Ok(Self {
            token,
            database_id,
            client: tracker_client()?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(
            std::env::var("NOTION_TOKEN").ok().filter(|v| !v.is_empty()),
            std::env::var("NOTION_DB_ID").ok().filter(|v| !v.is_empty()),
        )
    }

    pub async fn push(&self, items: &[Opportunity]) -> SinkRun {
        let (Some(token), Some(database_id)) = (self.token.as_deref(), self.database_id.as_deref())
        else {
            debug!("notion sink unconfigured; skipping");
            return SinkRun::Skipped {
                reason: "missing NOTION_TOKEN or NOTION_DB_ID".to_string(),
            };
        };

        let mut outcomes = Vec::with_capacity(items.len());
        for item in items.iter().take(TRACKER_PUSH_CAP) {
            let mut properties = json!({
                "Title": {"title": [{"text": {"content": item.title}}]},
                "Solicitation ID": {"rich_text": [{"text": {"content": item.id}}]},
                "Agency": {"rich_text": [{"text": {"content": item.agency}}]},
                "URL": {"url": item.url},
                "Source": {"rich_text": [{"text": {"content": item.source}}]},
            });
            if let (Some(due), Some(map)) = (item.due_date.as_deref(), properties.as_object_mut()) {
                map.insert("Due Date".to_string(), json!({"date": {"start": due}}));
            }
            let payload = json!({
                "parent": {"database_id": database_id},
                "properties": properties,
            });
            let response = self
                .client
                .post("https://api.notion.com/v1/pages")
                .bearer_auth(token)
                .header("Notion-Version", "2022-06-28")
                .json(&payload)
                .send()
                .await;
            outcomes.push(outcome_from_response(&item.id, response));
        }
        SinkRun::Completed(outcomes)
    }
}
