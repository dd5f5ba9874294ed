//! Run configuration stored under `<run-dir>/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::ErrorStrategy;

/// Run configuration (TOML).
///
/// Supplied by the orchestration layer when a run is created. The file is
/// intended to be edited by humans and must remain stable; missing fields
/// default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunConfig {
    /// Change this run is linked to, when known.
    pub change_id: Option<String>,

    /// Iteration ceiling; reaching it without success fails the run.
    pub max_iterations: u32,

    pub error: ErrorConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ErrorConfig {
    pub strategy: ErrorStrategy,
    /// Attempts on the same task before the strategy escalates.
    pub max_retries: u32,
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::AnalyzeRetry,
            max_retries: 3,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            change_id: None,
            max_iterations: 10,
            error: ErrorConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.error.max_retries == 0 {
            return Err(anyhow!("error.max_retries must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunConfig> {
    if !path.exists() {
        let cfg = RunConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunConfig) -> Result<()> {
    cfg.validate()?;
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RunConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = RunConfig {
            change_id: Some("change-9".to_string()),
            max_iterations: 25,
            ..RunConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn zero_iterations_is_rejected() {
        let cfg = RunConfig {
            max_iterations: 0,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
