//! Run orchestration: source registry, configuration, and the sequential
//! batch pipeline (fetch, filter, dedupe, sinks, summary).

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use bidwatch_adapters::{adapter_for_source, SourceAdapter};
use bidwatch_core::{apply_filters, sort_newest_first, FetchOptions, FilterOptions, Opportunity};
use bidwatch_sinks::{CsvSink, GitHubIssueSink, JsonSink, MarkdownSink, NotionSink, SinkRun};
use bidwatch_storage::{
    diff_ids, write_json_atomic, BackoffPolicy, HttpClientConfig, HttpFetcher, SeenDiff,
    SeenIdStore,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceEntry {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TrackerToggles {
    #[serde(default)]
    pub github: bool,
    #[serde(default)]
    pub notion: bool,
}

/// `sources.yaml`: which sources run, the filter configuration, and which
/// tracker sinks are enabled. A missing or unparseable registry falls back
/// to the built-in default; configuration absence is never an error.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceEntry>,
    #[serde(default)]
    pub filters: FilterOptions,
    #[serde(default)]
    pub trackers: TrackerToggles,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        let entry = |source_id: &str, display_name: &str| SourceEntry {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            enabled: true,
        };
        Self {
            sources: vec![
                entry(bidwatch_adapters::SAM_SOURCE_ID, "SAM.gov search"),
                entry(bidwatch_adapters::IMPORT_SOURCE_ID, "MissouriBUYS import drop"),
                entry(bidwatch_adapters::BID_BOARD_SOURCE_ID, "MissouriBUYS bid board"),
            ],
            filters: FilterOptions::default(),
            trackers: TrackerToggles::default(),
        }
    }
}

impl SourceRegistry {
    pub fn load_or_default(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return Self::default(),
        };
        match serde_yaml::from_str(&text) {
            Ok(registry) => registry,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "source registry unparseable; using defaults");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub workspace_root: PathBuf,
    pub output_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub import_csv: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sam_keywords: Vec<String>,
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            output_dir: std::env::var("BIDWATCH_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/contracts")),
            reports_dir: PathBuf::from("reports"),
            import_csv: std::env::var("BIDWATCH_IMPORT_CSV")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/import/mobuys.csv")),
            user_agent: std::env::var("BIDWATCH_USER_AGENT")
                .unwrap_or_else(|_| "bidwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("BIDWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sam_keywords: std::env::var("SAM_KEYWORDS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

/// One run's outcome; also persisted as `latest.meta.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub total: usize,
    pub new_count: usize,
    pub new_ids: Vec<String>,
    pub since_days: i64,
    pub source_counts: BTreeMap<String, usize>,
}

pub struct SyncPipeline {
    config: BotConfig,
    registry: SourceRegistry,
    http: HttpFetcher,
    seen: SeenIdStore,
    adapters: Vec<Box<dyn SourceAdapter>>,
    github: GitHubIssueSink,
    notion: NotionSink,
}

impl SyncPipeline {
    pub fn new(config: BotConfig) -> Result<Self> {
        let registry = SourceRegistry::load_or_default(&config.workspace_root.join("sources.yaml"));
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        })?;
        let seen = SeenIdStore::new(config.output_dir.join("seen_ids.json"));

        let adapters = registry
            .sources
            .iter()
            .filter(|entry| entry.enabled)
            .filter_map(|entry| {
                let adapter = adapter_for_source(&entry.source_id, &config.import_csv);
                if adapter.is_none() {
                    warn!(source_id = %entry.source_id, "no adapter registered; skipping source");
                }
                adapter
            })
            .collect();

        let github = GitHubIssueSink::from_env()?;
        let notion = NotionSink::from_env()?;

        Ok(Self {
            config,
            registry,
            http,
            seen,
            adapters,
            github,
            notion,
        })
    }

    pub fn with_adapters(mut self, adapters: Vec<Box<dyn SourceAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    /// Fetch, filter, dedupe, write sinks, notify trackers, summarize. Every
    /// stage degrades instead of aborting; the run always completes with a
    /// summary, even when every source contributed nothing.
    pub async fn run_once(&self, since_days: i64) -> Result<RunSummary> {
        let created_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, since_days, "starting opportunity run");

        let opts = FetchOptions {
            since_days,
            keywords: self.config.sam_keywords.clone(),
        };

        let mut all_items = Vec::new();
        let mut source_counts = BTreeMap::new();
        for adapter in &self.adapters {
            let count = match adapter.fetch(&self.http, &opts).await {
                Ok(items) => {
                    let count = items.len();
                    all_items.extend(items);
                    count
                }
                Err(err) => {
                    warn!(source_id = adapter.source_id(), error = %err, "adapter failed; contributing zero items");
                    0
                }
            };
            info!(source_id = adapter.source_id(), count, "adapter completed");
            source_counts.insert(adapter.source_id().to_string(), count);
        }

        let filtered = apply_filters(all_items, &self.registry.filters);

        // Batch-level dedupe: the first occurrence of an identifier wins.
        let mut batch: Vec<Opportunity> = Vec::with_capacity(filtered.len());
        let mut ids_in_batch = HashSet::new();
        for item in filtered {
            if ids_in_batch.insert(item.id.clone()) {
                batch.push(item);
            }
        }
        let current_ids: Vec<String> = batch.iter().map(|item| item.id.clone()).collect();

        let diff = match self.seen.diff_and_persist(&current_ids).await {
            Ok(diff) => diff,
            Err(err) => {
                warn!(error = %err, "seen-id state persist failed; continuing with in-memory diff");
                let previously_seen = self.seen.load().await;
                let new_ids = diff_ids(&current_ids, &previously_seen);
                SeenDiff {
                    new_ids,
                    previously_seen,
                }
            }
        };

        sort_newest_first(&mut batch);
        self.write_file_outputs(created_at, &batch).await;

        let new_id_set: HashSet<&str> = diff.new_ids.iter().map(String::as_str).collect();
        let new_items: Vec<Opportunity> = batch
            .iter()
            .filter(|item| new_id_set.contains(item.id.as_str()))
            .cloned()
            .collect();

        if self.registry.trackers.github {
            log_sink_run("github", self.github.push(&new_items).await);
        }
        if self.registry.trackers.notion {
            log_sink_run("notion", self.notion.push(&new_items).await);
        }

        let mut new_ids = diff.new_ids;
        new_ids.sort();
        let summary = RunSummary {
            run_id,
            created_at,
            total: batch.len(),
            new_count: new_ids.len(),
            new_ids,
            since_days,
            source_counts,
        };

        if let Err(err) =
            write_json_atomic(self.config.output_dir.join("latest.meta.json"), &summary).await
        {
            warn!(error = %err, "writing run metadata failed");
        }

        info!(total = summary.total, new = summary.new_count, "opportunity run complete");
        Ok(summary)
    }

    async fn write_file_outputs(&self, created_at: DateTime<Utc>, batch: &[Opportunity]) {
        let date_stamp = created_at.format("%Y-%m-%d").to_string();
        let daily_path = self.config.output_dir.join(format!("{date_stamp}.json"));
        let latest_path = self.config.output_dir.join("latest.json");
        let csv_path = self.config.output_dir.join("latest.csv");
        let report_path = self.config.reports_dir.join("opportunities.md");

        if let Err(err) = JsonSink.write(&daily_path, batch).await {
            warn!(path = %daily_path.display(), error = %err, "writing daily snapshot failed");
        }
        if let Err(err) = JsonSink.write(&latest_path, batch).await {
            warn!(path = %latest_path.display(), error = %err, "writing latest snapshot failed");
        }
        if let Err(err) = CsvSink.write(&csv_path, batch).await {
            warn!(path = %csv_path.display(), error = %err, "writing csv mirror failed");
        }
        if let Err(err) = MarkdownSink.write(&report_path, batch).await {
            warn!(path = %report_path.display(), error = %err, "writing markdown report failed");
        }
    }
}

fn log_sink_run(sink: &str, run: SinkRun) {
    match &run {
        SinkRun::Skipped { reason } => info!(sink, reason = reason.as_str(), "tracker sink skipped"),
        SinkRun::Completed(_) => info!(
            sink,
            sent = run.sent_count(),
            failed = run.failed_count(),
            "tracker sink completed"
        ),
    }
}

pub async fn run_once_from_env(since_days: i64) -> Result<RunSummary> {
    let pipeline = SyncPipeline::new(BotConfig::from_env())?;
    pipeline.run_once(since_days).await
}
