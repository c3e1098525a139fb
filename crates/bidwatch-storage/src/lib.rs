//! Durable state, atomic file writes, and HTTP fetch utilities for bidwatch.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bidwatch-storage";

/// Replace `path` with `bytes` via a temp file in the same directory plus a
/// rename, so a crash mid-write never leaves a partial file behind.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<()> {
    let path = path.as_ref();
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }

    let temp_name = format!(".{}.tmp", Uuid::new_v4());
    let temp_path = match parent {
        Some(parent) => parent.join(temp_name),
        None => PathBuf::from(temp_name),
    };

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Pretty-printed JSON variant of [`write_atomic`].
pub async fn write_json_atomic<T: Serialize>(
    path: impl AsRef<Path>,
    value: &T,
) -> anyhow::Result<()> {
    let path = path.as_ref();
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing JSON for {}", path.display()))?;
    write_atomic(path, &bytes).await
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("serializing seen-id state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("persisting seen-id state to {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}

/// Diff of the current batch against the persisted seen-set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenDiff {
    /// Identifiers not in the persisted set, in first-encountered batch
    /// order, deduplicated within the batch.
    pub new_ids: Vec<String>,
    /// The seen-set as loaded before this run's union was written back.
    pub previously_seen: BTreeSet<String>,
}

/// Identifiers not in `seen`, first occurrence wins within the batch.
pub fn diff_ids(current_ids: &[String], seen: &BTreeSet<String>) -> Vec<String> {
    let mut emitted = BTreeSet::new();
    current_ids
        .iter()
        .filter(|id| !id.is_empty() && !seen.contains(*id) && emitted.insert((*id).clone()))
        .cloned()
        .collect()
}

/// The set of opportunity identifiers ever observed, stored as a sorted JSON
/// array of strings. Read once and written once per run; grows monotonically.
#[derive(Debug, Clone)]
pub struct SeenIdStore {
    path: PathBuf,
}

impl SeenIdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted seen-set. An absent or unreadable file is treated
    /// as empty prior state, never as an error.
    pub async fn load(&self) -> BTreeSet<String> {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return BTreeSet::new(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "seen-id state unreadable; treating as empty");
                return BTreeSet::new();
            }
        };
        match serde_json::from_str::<Vec<String>>(&text) {
            Ok(ids) => ids.into_iter().collect(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "seen-id state unparseable; treating as empty");
                BTreeSet::new()
            }
        }
    }

    /// Compute the new-vs-seen diff for the current batch and persist the
    /// union back, sorted, via an atomic replace.
    pub async fn diff_and_persist(&self, current_ids: &[String]) -> Result<SeenDiff, StateError> {
        let previously_seen = self.load().await;
        let new_ids = diff_ids(current_ids, &previously_seen);

        let mut union = previously_seen.clone();
        union.extend(current_ids.iter().filter(|id| !id.is_empty()).cloned());
        let sorted: Vec<&String> = union.iter().collect();
        let bytes = serde_json::to_vec_pretty(&sorted)?;
        write_atomic(&self.path, &bytes)
            .await
            .map_err(|source| StateError::Persist {
                path: self.path.clone(),
                source,
            })?;

        Ok(SeenDiff {
            new_ids,
            previously_seen,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared blocking-style GET client. `get` retries 429/5xx and transport
/// errors with exponential backoff; `get_once` is single-shot for sources
/// where retrying is not wanted.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get_with_retries(source_id, url, self.backoff.max_retries)
            .await
    }

    pub async fn get_once(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.get_with_retries(source_id, url, 0).await
    }

    async fn get_with_retries(
        &self,
        source_id: &str,
        url: &str,
        max_retries: usize,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_get", source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable && attempt < max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn first_run_reports_new_second_run_reports_none() {
        let dir = tempdir().expect("tempdir");
        let store = SeenIdStore::new(dir.path().join("seen_ids.json"));
        let batch = ids(&["A", "B", "A"]);

        let first = store.diff_and_persist(&batch).await.expect("first diff");
        assert_eq!(first.new_ids, ids(&["A", "B"]));
        assert!(first.previously_seen.is_empty());

        let second = store.diff_and_persist(&batch).await.expect("second diff");
        assert!(second.new_ids.is_empty());
        assert_eq!(
            second.previously_seen,
            ids(&["A", "B"]).into_iter().collect::<BTreeSet<_>>()
        );
    }

    #[tokio::test]
    async fn union_of_diff_halves_equals_persisted_state() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seen_ids.json");
        let store = SeenIdStore::new(&path);

        store.diff_and_persist(&ids(&["B", "C"])).await.expect("seed");
        let diff = store.diff_and_persist(&ids(&["A", "C"])).await.expect("diff");

        let mut union: BTreeSet<String> = diff.previously_seen.clone();
        union.extend(diff.new_ids.iter().cloned());

        let persisted: Vec<String> =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read state"))
                .expect("parse state");
        assert_eq!(persisted, union.into_iter().collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_batch_leaves_state_bytes_unchanged() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seen_ids.json");
        let store = SeenIdStore::new(&path);

        store.diff_and_persist(&ids(&["X", "Y"])).await.expect("seed");
        let before = std::fs::read(&path).expect("read before");

        let diff = store.diff_and_persist(&[]).await.expect("empty run");
        assert!(diff.new_ids.is_empty());
        let after = std::fs::read(&path).expect("read after");
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn unparseable_state_is_treated_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("seen_ids.json");
        std::fs::write(&path, b"not json").expect("seed garbage");

        let store = SeenIdStore::new(&path);
        let diff = store.diff_and_persist(&ids(&["A"])).await.expect("diff");
        assert_eq!(diff.new_ids, ids(&["A"]));
        assert!(diff.previously_seen.is_empty());
    }

    #[test]
    fn diff_preserves_first_encounter_order() {
        let seen: BTreeSet<String> = ids(&["B"]).into_iter().collect();
        let out = diff_ids(&ids(&["C", "B", "A", "C"]), &seen);
        assert_eq!(out, ids(&["C", "A"]));
    }

    #[tokio::test]
    async fn atomic_write_replaces_previous_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.json");

        write_atomic(&path, b"first").await.expect("first write");
        write_atomic(&path, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&path).expect("read"), b"second");
        let leftovers = std::fs::read_dir(dir.path())
            .expect("list dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn backoff_doubles_from_one_second_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
