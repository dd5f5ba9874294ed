//! Append-only iteration history under `<run-dir>/iterations/`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::core::types::IterationLog;
use crate::io::paths::SessionPaths;

fn entry_path(paths: &SessionPaths, iteration: u32) -> PathBuf {
    paths.iterations_dir.join(format!("{iteration:04}.json"))
}

/// Write one iteration log entry. Entries are never rewritten; each iteration
/// gets its own file so observers can tail the history without re-reading it.
pub fn append_iteration(paths: &SessionPaths, log: &IterationLog) -> Result<PathBuf> {
    fs::create_dir_all(&paths.iterations_dir)
        .with_context(|| format!("create iteration dir {}", paths.iterations_dir.display()))?;
    let path = entry_path(paths, log.iteration);
    let mut buf = serde_json::to_string_pretty(log)?;
    buf.push('\n');
    fs::write(&path, buf).with_context(|| format!("write iteration log {}", path.display()))?;
    Ok(path)
}

/// Load all iteration log entries, ordered by iteration number.
pub fn list_iterations(paths: &SessionPaths) -> Result<Vec<IterationLog>> {
    let entries = match fs::read_dir(&paths.iterations_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("read {}", paths.iterations_dir.display()));
        }
    };

    let mut logs = Vec::new();
    for entry in entries {
        let entry = entry
            .with_context(|| format!("read entry in {}", paths.iterations_dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let log: IterationLog = serde_json::from_str(&contents)
            .with_context(|| format!("parse iteration log {}", path.display()))?;
        logs.push(log);
    }
    logs.sort_by_key(|log| log.iteration);
    Ok(logs)
}
