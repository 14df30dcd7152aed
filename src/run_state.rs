//! Persistence of the previous pass's down-set.
//!
//! Only the most recent [`RunRecord`] is kept; each pass replaces it
//! wholesale. A missing record means "first run" and yields an empty one,
//! while an unreadable record aborts the pass.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EndpointId;
use crate::probe::ProbeResult;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read run state {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("run state {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize run state: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to write run state {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Down endpoints at the end of a pass, plus when that pass ran.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    #[serde(default, alias = "DownServers", deserialize_with = "unique_down_servers")]
    down_servers: Vec<ProbeResult>,
    #[serde(alias = "RunTimeStart")]
    pub run_time_start: DateTime<Utc>,
    #[serde(alias = "RunTimeEnd")]
    pub run_time_end: DateTime<Utc>,
}

impl RunRecord {
    /// Builds a record, keeping only the first entry seen for each endpoint id.
    pub fn new(
        down_servers: Vec<ProbeResult>,
        run_time_start: DateTime<Utc>,
        run_time_end: DateTime<Utc>,
    ) -> Self {
        Self {
            down_servers: dedup_by_id(down_servers),
            run_time_start,
            run_time_end,
        }
    }

    /// The record used when nothing has been persisted yet.
    pub fn empty() -> Self {
        let now = Utc::now();
        Self::new(Vec::new(), now, now)
    }

    pub fn down_servers(&self) -> &[ProbeResult] {
        &self.down_servers
    }

    pub fn into_down_servers(self) -> Vec<ProbeResult> {
        self.down_servers
    }

    pub fn down_ids(&self) -> HashSet<EndpointId> {
        self.down_servers.iter().map(|s| s.id).collect()
    }

    pub fn is_down(&self, id: EndpointId) -> bool {
        self.down_servers.iter().any(|s| s.id == id)
    }

    pub fn duration(&self) -> Duration {
        self.run_time_end - self.run_time_start
    }
}

fn dedup_by_id(down_servers: Vec<ProbeResult>) -> Vec<ProbeResult> {
    let mut seen = HashSet::new();
    down_servers
        .into_iter()
        .filter(|s| seen.insert(s.id))
        .collect()
}

// Accepts `null` as well as a list; the earliest state files wrote `null`
// for an empty down-set.
fn unique_down_servers<'de, D>(deserializer: D) -> Result<Vec<ProbeResult>, D::Error>
where
    D: Deserializer<'de>,
{
    let servers = Option::<Vec<ProbeResult>>::deserialize(deserializer)?;
    Ok(dedup_by_id(servers.unwrap_or_default()))
}

#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn load(&self) -> Result<RunRecord, StateError>;

    async fn save(&self, record: &RunRecord) -> Result<(), StateError>;
}

/// Stores the record as pretty JSON at `path`.
///
/// Saves go to `<path>.tmp` first and are renamed into place, so a crash
/// mid-write leaves the previous record intact.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl RunStateStore for JsonFileStore {
    async fn load(&self) -> Result<RunRecord, StateError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no previous run state, starting fresh");
                return Ok(RunRecord::empty());
            }
            Err(source) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let record: RunRecord =
            serde_json::from_slice(&raw).map_err(|source| StateError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        debug!(
            path = %self.path.display(),
            down = record.down_servers().len(),
            "loaded previous run state"
        );
        Ok(record)
    }

    async fn save(&self, record: &RunRecord) -> Result<(), StateError> {
        let json = serde_json::to_vec_pretty(record).map_err(StateError::Serialize)?;
        let temp_path = self.temp_path();

        tokio::fs::write(&temp_path, &json)
            .await
            .map_err(|source| StateError::Write {
                path: temp_path.clone(),
                source,
            })?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|source| StateError::Write {
                path: self.path.clone(),
                source,
            })?;

        debug!(
            path = %self.path.display(),
            down = record.down_servers().len(),
            "saved run state"
        );
        Ok(())
    }
}

/// Keeps the record in memory. Used by tests and dry runs that must not
/// touch the real state file.
#[derive(Default)]
pub struct InMemoryStore {
    record: Mutex<Option<RunRecord>>,
    saves: Mutex<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: RunRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<RunRecord> {
        self.record
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RunStateStore for InMemoryStore {
    async fn load(&self) -> Result<RunRecord, StateError> {
        Ok(self.snapshot().unwrap_or_else(RunRecord::empty))
    }

    async fn save(&self, record: &RunRecord) -> Result<(), StateError> {
        *self.record.lock().unwrap_or_else(PoisonError::into_inner) = Some(record.clone());
        *self.saves.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        Ok(())
    }
}

/// Opens the run state kept at `path`.
///
/// A `read_only` store loads the file once, up front, and keeps every later
/// save in memory, so the file is never rewritten. A malformed file is still
/// an error either way.
pub async fn open_store(path: &Path, read_only: bool) -> Result<Box<dyn RunStateStore>, StateError> {
    let file = JsonFileStore::new(path);
    if !read_only {
        return Ok(Box::new(file));
    }

    let record = file.load().await?;
    info!(path = %path.display(), "run state opened read-only, saves stay in memory");
    Ok(Box::new(InMemoryStore::with_record(record)))
}
