//! Crash-safe persistence of the session state document.
//!
//! Writes go to a temporary file followed by an atomic rename, so the
//! canonical document is always either the previous or the new complete
//! version, never a mix.

use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::types::{
    ErrorHandling, RunContext, SCHEMA_VERSION, SessionState, SessionStatus,
};
use crate::io::config::RunConfig;
use crate::io::paths::SessionPaths;

/// Persisted document version unrecognized by this build. Surfaced, never
/// silently migrated.
#[derive(Debug, Clone)]
pub struct SchemaVersionError {
    pub found: u32,
    pub expected: u32,
}

impl fmt::Display for SchemaVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported session schema version {} (expected {})",
            self.found, self.expected
        )
    }
}

impl std::error::Error for SchemaVersionError {}

/// Pure constructor for a fresh run's state document.
pub fn initial_state(session_id: &str, config: &RunConfig) -> SessionState {
    SessionState {
        schema_version: SCHEMA_VERSION,
        session_id: session_id.to_string(),
        change_id: config.change_id.clone(),
        status: SessionStatus::Running,
        iteration: 0,
        max_iterations: config.max_iterations,
        current_task: None,
        error_handling: ErrorHandling {
            strategy: config.error.strategy,
            max_retries: config.error.max_retries,
        },
        context: RunContext::default(),
    }
}

/// Load the session document, or `None` if no run has been persisted yet.
pub fn read_session(path: &Path) -> Result<Option<SessionState>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read session {}", path.display())),
    };

    // Probe the version before the typed parse so a future schema surfaces as
    // a version error rather than a field mismatch.
    let value: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse session {}", path.display()))?;
    let found = value
        .get("schema_version")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0) as u32;
    if found != SCHEMA_VERSION {
        return Err(SchemaVersionError {
            found,
            expected: SCHEMA_VERSION,
        }
        .into());
    }

    let state: SessionState = serde_json::from_value(value)
        .with_context(|| format!("parse session {}", path.display()))?;
    debug!(session_id = %state.session_id, iteration = state.iteration, "session loaded");
    Ok(Some(state))
}

/// Atomically write the session document (temp file + rename).
pub fn write_session(path: &Path, state: &SessionState) -> Result<()> {
    debug!(
        path = %path.display(),
        session_id = %state.session_id,
        iteration = state.iteration,
        "writing session"
    );
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Remove the run directory: state document, lock, stop marker, iteration
/// logs. Idempotent; deleting an absent session is not an error.
pub fn delete_session(paths: &SessionPaths) -> Result<()> {
    match fs::remove_dir_all(&paths.run_dir) {
        Ok(()) => {
            debug!(run_dir = %paths.run_dir.display(), "session deleted");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("delete session {}", paths.run_dir.display()))
        }
    }
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("session path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp session {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace session {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{CurrentTask, ErrorStrategy};
    use crate::io::config::ErrorConfig;

    fn config() -> RunConfig {
        RunConfig {
            change_id: Some("change-42".to_string()),
            max_iterations: 10,
            error: ErrorConfig {
                strategy: ErrorStrategy::AnalyzeRetry,
                max_retries: 3,
            },
        }
    }

    #[test]
    fn initial_state_matches_contract() {
        let state = initial_state("run-1", &config());

        assert_eq!(state.schema_version, 1);
        assert_eq!(state.status, SessionStatus::Running);
        assert_eq!(state.iteration, 0);
        assert_eq!(state.max_iterations, 10);
        assert_eq!(state.error_handling.strategy, ErrorStrategy::AnalyzeRetry);
        assert_eq!(state.error_handling.max_retries, 3);
        assert!(state.context.recent_failures.is_empty());
        assert!(state.context.codebase_patterns.is_empty());
        assert!(state.current_task.is_none());
    }

    /// Verifies write then read preserves all fields, including the nested
    /// current task.
    #[test]
    fn session_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");

        let mut state = initial_state("run-1", &config());
        state.iteration = 4;
        state.current_task = Some(CurrentTask {
            id: "t7".to_string(),
            description: "wire up the parser".to_string(),
            attempt_count: 2,
        });
        state.context.push_failure(crate::core::types::FailureRecord {
            iteration: 3,
            task_id: "t7".to_string(),
            root_cause: "type error".to_string(),
            fix_plan: "narrow the enum".to_string(),
        });
        state.context.add_pattern("Use zod for validation");

        write_session(&path, &state).expect("write");
        let loaded = read_session(&path).expect("read").expect("present");
        assert_eq!(loaded, state);
    }

    #[test]
    fn read_absent_session_is_none_not_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded = read_session(&temp.path().join("missing.json")).expect("read");
        assert!(loaded.is_none());
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("session.json");

        let mut state = initial_state("run-1", &config());
        state.schema_version = 99;
        let mut buf = serde_json::to_string_pretty(&state).expect("serialize");
        buf.push('\n');
        std::fs::write(&path, buf).expect("seed");

        let err = read_session(&path).unwrap_err();
        let schema = err
            .downcast_ref::<SchemaVersionError>()
            .expect("typed error");
        assert_eq!(schema.found, 99);
        assert_eq!(schema.expected, SCHEMA_VERSION);
    }

    #[test]
    fn delete_is_idempotent_and_read_after_delete_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "run-1");
        paths.ensure_dirs().expect("dirs");

        let state = initial_state("run-1", &config());
        write_session(&paths.state_path, &state).expect("write");

        delete_session(&paths).expect("delete");
        assert!(read_session(&paths.state_path).expect("read").is_none());
        assert!(!paths.lock_path.exists());

        delete_session(&paths).expect("second delete");
    }
}
