//! Persisted schedule snapshot + HTTP fetch utilities for schedsync.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use schedsync_core::EventRecord;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "schedsync-storage";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("reading snapshot {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parsing snapshot {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("snapshot {path} lists event {id} more than once")]
    DuplicateId { path: PathBuf, id: String },
    #[error("snapshot {path} stores event {id} under key {key}")]
    KeyMismatch {
        path: PathBuf,
        key: String,
        id: String,
    },
}

#[derive(Debug, Error)]
pub enum SaveError {
    #[error("serializing snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing snapshot {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
#[error("no write access to {path}: {reason}")]
pub struct PermissionError {
    pub path: PathBuf,
    pub reason: String,
}

/// What an upsert did to the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct SavedSnapshot {
    pub path: PathBuf,
    pub records: usize,
    pub bytes: u64,
    pub sha256: String,
    pub last_updated: f64,
}

#[derive(Serialize)]
struct SnapshotDocumentRef<'a> {
    games: Vec<(&'a str, &'a EventRecord)>,
    last_updated: f64,
}

#[derive(Deserialize)]
struct SnapshotDocument {
    games: Vec<(String, EventRecord)>,
    #[serde(alias = "time")]
    last_updated: f64,
}

/// The full known schedule, keyed by event id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    games: BTreeMap<String, EventRecord>,
    last_updated: Option<f64>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record`, or replaces whatever was stored under its id in full.
    pub fn upsert(&mut self, record: EventRecord) -> Upsert {
        match self.games.entry(record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
                Upsert::Inserted
            }
            Entry::Occupied(mut slot) => {
                if *slot.get() == record {
                    Upsert::Unchanged
                } else {
                    slot.insert(record);
                    Upsert::Replaced
                }
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&EventRecord> {
        self.games.get(id)
    }

    pub fn len(&self) -> usize {
        self.games.len()
    }

    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }

    /// Records in ascending id order.
    pub fn records(&self) -> impl Iterator<Item = &EventRecord> {
        self.games.values()
    }

    /// Seconds since the Unix epoch of the last successful write, if known.
    pub fn last_updated(&self) -> Option<f64> {
        self.last_updated
    }

    pub fn last_updated_at(&self) -> Option<DateTime<Utc>> {
        self.last_updated
            .and_then(|secs| DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64))
    }

    /// Renders the persisted document: one-space indentation, keys sorted, games
    /// ascending by id.
    pub fn to_document_bytes(&self, last_updated: f64) -> Result<Vec<u8>, serde_json::Error> {
        let document = SnapshotDocumentRef {
            games: self
                .games
                .iter()
                .map(|(id, record)| (id.as_str(), record))
                .collect(),
            last_updated,
        };
        let mut out = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
        document.serialize(&mut serializer)?;
        out.push(b'\n');
        Ok(out)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let bytes = fs::read(path).await.map_err(|source| LoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let document: SnapshotDocument =
            serde_json::from_slice(&bytes).map_err(|source| LoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        let mut games = BTreeMap::new();
        for (id, record) in document.games {
            if id != record.id {
                return Err(LoadError::KeyMismatch {
                    path: path.to_path_buf(),
                    key: id,
                    id: record.id,
                });
            }
            if games.insert(id.clone(), record).is_some() {
                return Err(LoadError::DuplicateId {
                    path: path.to_path_buf(),
                    id,
                });
            }
        }
        Ok(Self {
            games,
            last_updated: Some(document.last_updated),
        })
    }

    /// Writes the snapshot stamped with the current time, replacing `path` atomically.
    pub async fn save(&mut self, path: impl AsRef<Path>) -> Result<SavedSnapshot, SaveError> {
        let path = path.as_ref();
        let now = Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let bytes = self.to_document_bytes(now)?;
        write_atomically(path, &bytes)
            .await
            .map_err(|source| SaveError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        self.last_updated = Some(now);

        Ok(SavedSnapshot {
            path: path.to_path_buf(),
            records: self.games.len(),
            bytes: bytes.len() as u64,
            sha256: sha256_hex(&bytes),
            last_updated: now,
        })
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write to a sibling temp file, then rename it over `path`.
async fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = parent_dir(path);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }

    if let Ok(meta) = fs::metadata(path).await {
        let _ = fs::set_permissions(&temp_path, meta.permissions()).await;
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err);
    }
    Ok(())
}

/// Fails unless `save` could replace `path`: an existing file must open for writing and
/// the parent directory must accept a new entry, since saves go through a sibling temp
/// file and a rename. The directory is probed by creating and removing a temp file.
pub async fn check_writable(path: impl AsRef<Path>) -> Result<(), PermissionError> {
    let path = path.as_ref();
    let denied = |reason: String| PermissionError {
        path: path.to_path_buf(),
        reason,
    };

    match fs::metadata(path).await {
        Ok(meta) if meta.is_dir() => return Err(denied("path is a directory".to_string())),
        Ok(_) => {
            fs::OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|err| denied(err.to_string()))?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(denied(err.to_string())),
    }

    let parent = parent_dir(path);
    match fs::metadata(parent).await {
        Ok(meta) if !meta.is_dir() => {
            return Err(denied(format!("parent {} is not a directory", parent.display())))
        }
        Ok(_) => {}
        Err(err) => return Err(denied(format!("parent directory {}: {err}", parent.display()))),
    }

    let probe = parent.join(format!(".schedsync-write-check.{}.tmp", Uuid::new_v4()));
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&probe)
        .await
        .map_err(|err| {
            denied(format!(
                "cannot create files in {}: {err}",
                parent.display()
            ))
        })?;
    if let Err(err) = fs::remove_file(&probe).await {
        warn!(path = %probe.display(), error = %err, "could not remove write-check file");
    }
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

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

/// Sequential GET client with a per-request timeout and capped retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
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

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
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

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(%status, attempt, "retrying after server status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
