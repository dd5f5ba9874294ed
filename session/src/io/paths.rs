//! Canonical on-disk layout for a run-scoped directory.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All canonical paths for one run under `<base>/.ralph/runs/<session-id>/`.
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub base: PathBuf,
    pub run_dir: PathBuf,
    pub state_path: PathBuf,
    pub lock_path: PathBuf,
    pub config_path: PathBuf,
    pub stop_path: PathBuf,
    pub iterations_dir: PathBuf,
}

impl SessionPaths {
    pub fn new(base: impl Into<PathBuf>, session_id: &str) -> Self {
        let base = base.into();
        let run_dir = base.join(".ralph").join("runs").join(session_id);
        Self {
            base,
            state_path: run_dir.join("session.json"),
            lock_path: run_dir.join("lock.json"),
            config_path: run_dir.join("config.toml"),
            stop_path: run_dir.join("stop.request"),
            iterations_dir: run_dir.join("iterations"),
            run_dir,
        }
    }

    /// Create the run directory tree. Idempotent; must succeed before either
    /// the lock or the state document is written.
    pub fn ensure_dirs(&self) -> Result<()> {
        create_dir(&self.run_dir)?;
        create_dir(&self.iterations_dir)?;
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}
