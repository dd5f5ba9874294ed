//! Context tracking: bounded failure history and deduplicated patterns.
//!
//! These are pure in-memory mutations of the `context` sub-document. The state
//! machine owns persistence; nothing here touches storage.

use crate::core::types::{FailureRecord, RECENT_FAILURE_WINDOW, RunContext};

impl RunContext {
    /// Append a failure, evicting from the front until the rolling window
    /// holds at most [`RECENT_FAILURE_WINDOW`] records.
    pub fn push_failure(&mut self, record: FailureRecord) {
        self.recent_failures.push(record);
        while self.recent_failures.len() > RECENT_FAILURE_WINDOW {
            self.recent_failures.remove(0);
        }
    }

    /// Record a learned codebase pattern. No-op on exact duplicates.
    ///
    /// Returns `true` when the pattern was new.
    pub fn add_pattern(&mut self, pattern: &str) -> bool {
        if self.codebase_patterns.iter().any(|p| p == pattern) {
            return false;
        }
        self.codebase_patterns.push(pattern.to_string());
        true
    }
}
