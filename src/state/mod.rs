//! Persistent record of clusters believed to be live
//!
//! The store is a JSON Lines file at a well-known per-user path shared by
//! every process using this crate. Each mutation rewrites the full snapshot
//! to a temporary file in the same directory and renames it over the
//! canonical path, so readers in other processes never see a partial write.
//!
//! Writers in different processes do not share a lock. A mutation re-reads
//! the file right before its rename and checks afterwards that it landed,
//! retrying from a fresh read when another writer got in between.
//!
//! A record is a claim, not a guarantee: the cluster behind it may already be
//! gone. Consumers verify before acting.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Scope;

/// File name of the shared state file
pub const STATE_FILE_NAME: &str = "clusters.jsonl";

/// Attempts at a read-modify-write before giving up on a contended file
const MAX_WRITE_ATTEMPTS: u32 = 50;

/// Default state file: `$XDG_STATE_HOME/kindtest/clusters.jsonl`, falling
/// back to `~/.kindtest/clusters.jsonl` on platforms without a state dir
pub fn default_state_path() -> PathBuf {
    dirs::state_dir()
        .map(|d| d.join("kindtest"))
        .or_else(|| dirs::home_dir().map(|h| h.join(".kindtest")))
        .unwrap_or_else(|| PathBuf::from(".kindtest"))
        .join(STATE_FILE_NAME)
}

/// Name of this host as recorded in state records
pub fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Errors writing the state file
#[derive(Error, Debug)]
pub enum StateError {
    #[error("State file I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize state record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("State store lock poisoned")]
    Poisoned,

    #[error("State file {path} kept changing under concurrent writers")]
    Contended { path: PathBuf },
}

/// Persisted projection of a cluster handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateRecord {
    pub id: Uuid,
    pub name: String,
    pub kubeconfig_path: Option<PathBuf>,
    /// Process that owns the cluster
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub scope: Scope,
    #[serde(default)]
    pub keep: bool,
    #[serde(default)]
    pub host: Option<String>,
    /// Session within the owning process
    #[serde(default)]
    pub owner: Option<Uuid>,
}

impl StateRecord {
    /// Whether this record was written on the given host (records written
    /// before host tracking count as local)
    pub fn is_local_to(&self, host: &str) -> bool {
        self.host.as_deref().map_or(true, |h| h == host)
    }
}

/// Whether `pid` is a running process that started no later than `since`
///
/// A process that started after `since` reused the pid and does not count.
pub fn process_alive(pid: u32, since: DateTime<Utc>) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    match system.process(pid) {
        // start times have one-second resolution
        Some(process) => process.start_time() <= since.timestamp().max(0) as u64 + 1,
        None => false,
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse state file content, skipping lines that do not decode
///
/// Returns the records in file order plus the number of skipped lines.
pub fn parse_records(content: &str) -> (Vec<StateRecord>, usize) {
    let mut records: Vec<StateRecord> = Vec::new();
    let mut skipped = 0;

    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<StateRecord>(line) {
            Ok(record) => {
                // ids are unique; a later line for the same id wins
                if let Some(existing) = records.iter_mut().find(|r| r.id == record.id) {
                    *existing = record;
                } else {
                    records.push(record);
                }
            }
            Err(e) => {
                warn!("Ignoring corrupt state record on line {}: {}", index + 1, e);
                skipped += 1;
            }
        }
    }

    (records, skipped)
}

/// Serialize records to JSON Lines
pub fn serialize_records(records: &[StateRecord]) -> Result<String, StateError> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    Ok(out)
}

/// Insert or replace a record, keeping file order
pub fn upsert_record(records: &mut Vec<StateRecord>, record: StateRecord) {
    match records.iter_mut().find(|r| r.id == record.id) {
        Some(existing) => *existing = record,
        None => records.push(record),
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

/// File-backed state store
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    // serializes read-modify-write within this process
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at the shared default location
    pub fn at_default_path() -> Self {
        Self::new(default_state_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every readable record
    ///
    /// A missing file is empty. An unreadable file or corrupt lines are
    /// logged and skipped, never fatal.
    pub fn load(&self) -> Vec<StateRecord> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(
                    "State file {} unreadable, treating as empty: {}",
                    self.path.display(),
                    e
                );
                return Vec::new();
            }
        };

        let (records, skipped) = parse_records(&content);
        if skipped > 0 {
            warn!(
                "State file {} had {} corrupt record(s)",
                self.path.display(),
                skipped
            );
        }
        records
    }

    /// Look up a single record
    pub fn get(&self, id: Uuid) -> Option<StateRecord> {
        self.load().into_iter().find(|r| r.id == id)
    }

    /// Insert or replace the record with the same id
    pub fn upsert(&self, record: StateRecord) -> Result<(), StateError> {
        debug!("Recording cluster {} ({})", record.name, record.id);
        self.mutate(
            |records| {
                upsert_record(records, record.clone());
                true
            },
            |records| records.contains(&record),
        )
        .map(|_| ())
    }

    /// Remove a record; removing an unknown id is not an error
    pub fn remove(&self, id: Uuid) -> Result<bool, StateError> {
        let removed = self.mutate(
            |records| {
                let before = records.len();
                records.retain(|r| r.id != id);
                records.len() != before
            },
            |records| records.iter().all(|r| r.id != id),
        )?;
        if removed {
            debug!("Removed state record {}", id);
        }
        Ok(removed)
    }

    /// Read-modify-write against concurrent writers in other processes
    ///
    /// `apply` returns whether it changed anything; `landed` checks a fresh
    /// read for the change. The snapshot is only renamed into place when the
    /// file still holds what was read, and the whole cycle repeats until the
    /// change is visible.
    fn mutate(
        &self,
        mut apply: impl FnMut(&mut Vec<StateRecord>) -> bool,
        landed: impl Fn(&[StateRecord]) -> bool,
    ) -> Result<bool, StateError> {
        let _guard = self.write_lock.lock().map_err(|_| StateError::Poisoned)?;

        for attempt in 0..MAX_WRITE_ATTEMPTS {
            if attempt > 0 {
                backoff(attempt);
            }

            let before = self.read_raw()?;
            let mut records = parse_records(before.as_deref().unwrap_or_default()).0;
            if !apply(&mut records) {
                return Ok(false);
            }

            let temp = self.stage_snapshot(&records)?;
            if self.read_raw()? != before {
                debug!("State file changed while writing, retrying");
                continue;
            }
            temp.persist(&self.path).map_err(|e| self.io_err(e.error))?;

            if landed(&self.load()) {
                return Ok(true);
            }
            debug!("State write was overwritten by another process, retrying");
        }

        Err(StateError::Contended {
            path: self.path.clone(),
        })
    }

    fn read_raw(&self) -> Result<Option<String>, StateError> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_err(e)),
        }
    }

    /// Write the snapshot to a synced temp file next to the state file
    fn stage_snapshot(&self, records: &[StateRecord]) -> Result<NamedTempFile, StateError> {
        let content = serialize_records(records)?;

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(|e| self.io_err(e))?;

        let mut temp = NamedTempFile::new_in(&parent).map_err(|e| self.io_err(e))?;
        temp.write_all(content.as_bytes()).map_err(|e| self.io_err(e))?;
        temp.flush().map_err(|e| self.io_err(e))?;
        temp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        Ok(temp)
    }

    fn io_err(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Randomized pause so competing writers fall out of step
fn backoff(attempt: u32) {
    let jitter = (Uuid::new_v4().as_u128() % 5) as u64;
    let millis = u64::from(attempt.min(10)) + jitter;
    std::thread::sleep(Duration::from_millis(millis));
}
