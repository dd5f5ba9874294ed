//! Cooperative mutual exclusion for a run's mutable state.
//!
//! Ownership is a persisted [`LockRecord`]; liveness of the previous holder is
//! approximated by probing its recorded pid, so a crashed holder's record is
//! deterministically reclaimable without waiting for a timeout.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::io::liveness::ProcessLiveness;

/// Exclusive-ownership marker for a run. Stored separately from the session
/// document so it can be inspected without reading the full state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    /// Unix seconds at acquisition.
    pub acquired_at: u64,
    pub session_id: String,
}

/// Classification of the persisted lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No record exists.
    Free,
    /// The recorded owner is alive; do not proceed.
    Held(LockRecord),
    /// The recorded owner is gone; safe to reclaim.
    Stale(LockRecord),
}

/// Another live process owns the run.
#[derive(Debug, Clone)]
pub struct LockHeldError {
    pub pid: u32,
    pub session_id: String,
}

impl fmt::Display for LockHeldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "run {} is already running (lock held by pid {})",
            self.session_id, self.pid
        )
    }
}

impl std::error::Error for LockHeldError {}

/// The lock vanished or changed owner while this process believed it held it.
#[derive(Debug, Clone)]
pub struct LockLostError {
    pub session_id: String,
}

impl fmt::Display for LockLostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lost lock for run {}", self.session_id)
    }
}

impl std::error::Error for LockLostError {}

/// Guard over the lock file of one run.
#[derive(Debug)]
pub struct LockGuard<P: ProcessLiveness> {
    path: PathBuf,
    session_id: String,
    liveness: P,
}

impl<P: ProcessLiveness> LockGuard<P> {
    pub fn new(path: impl Into<PathBuf>, session_id: &str, liveness: P) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.to_string(),
            liveness,
        }
    }

    /// Read and classify the persisted lock.
    ///
    /// An unreadable or unparsable record signals an unclean exit and is
    /// classified stale rather than surfaced as an error.
    pub fn check(&self) -> Result<LockStatus> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LockStatus::Free);
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "unreadable lock record, treating as stale");
                return Ok(LockStatus::Stale(self.placeholder_record()));
            }
        };
        let record: LockRecord = match serde_json::from_str(&contents) {
            Ok(record) => record,
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "corrupt lock record, treating as stale");
                return Ok(LockStatus::Stale(self.placeholder_record()));
            }
        };
        if self.liveness.is_alive(record.pid) {
            Ok(LockStatus::Held(record))
        } else {
            Ok(LockStatus::Stale(record))
        }
    }

    /// Acquire the lock for the current process.
    ///
    /// A stale record is reclaimed silently (logged as a recovery event); a
    /// held record fails immediately with [`LockHeldError`]. Callers decide
    /// whether to retry later.
    pub fn acquire(&self) -> Result<LockRecord> {
        match self.check()? {
            LockStatus::Free => {}
            LockStatus::Stale(previous) => {
                info!(
                    session_id = %self.session_id,
                    previous_pid = previous.pid,
                    "reclaiming stale lock from crashed process"
                );
            }
            LockStatus::Held(record) => {
                return Err(LockHeldError {
                    pid: record.pid,
                    session_id: self.session_id.clone(),
                }
                .into());
            }
        }

        let record = LockRecord {
            pid: std::process::id(),
            acquired_at: unix_now(),
            session_id: self.session_id.clone(),
        };
        self.write_record(&record)?;
        debug!(session_id = %self.session_id, pid = record.pid, "lock acquired");
        Ok(record)
    }

    /// Remove the lock record unconditionally. Idempotent.
    pub fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(session_id = %self.session_id, "lock released");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("remove lock {}", self.path.display()))
            }
        }
    }

    /// Whether the persisted record names this process as the owner.
    pub fn held_by_current_process(&self) -> Result<bool> {
        match self.check()? {
            LockStatus::Held(record) => Ok(record.pid == std::process::id()),
            LockStatus::Free | LockStatus::Stale(_) => Ok(false),
        }
    }

    fn write_record(&self, record: &LockRecord) -> Result<()> {
        let parent = self
            .path
            .parent()
            .with_context(|| format!("lock path missing parent {}", self.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
        let mut buf = serde_json::to_string_pretty(record)?;
        buf.push('\n');
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &buf)
            .with_context(|| format!("write temp lock {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("replace lock {}", self.path.display()))?;
        Ok(())
    }

    fn placeholder_record(&self) -> LockRecord {
        LockRecord {
            pid: 0,
            acquired_at: 0,
            session_id: self.session_id.clone(),
        }
    }
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
