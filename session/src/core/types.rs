//! Shared deterministic types for the session core.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use serde::{Deserialize, Serialize};

/// Document schema version; bump whenever the persisted shape changes.
pub const SCHEMA_VERSION: u32 = 1;

/// How many recent failures the context retains (oldest evicted first).
pub const RECENT_FAILURE_WINDOW: usize = 3;

/// Lifecycle status of a run. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Running
    }
}

/// Failure escalation strategy. Closed enumeration; `AnalyzeRetry` retries the
/// same task up to `max_retries`, then abandons it after recording a pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorStrategy {
    AnalyzeRetry,
}

/// Retry/escalation policy carried in the session document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorHandling {
    pub strategy: ErrorStrategy,
    pub max_retries: u32,
}

impl Default for ErrorHandling {
    fn default() -> Self {
        Self {
            strategy: ErrorStrategy::AnalyzeRetry,
            max_retries: 3,
        }
    }
}

/// The task the run is currently attempting.
///
/// `attempt_count` increments on retries of the same task and resets when the
/// task changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTask {
    pub id: String,
    pub description: String,
    pub attempt_count: u32,
}

/// One recorded failure, fed back into the next iteration's planning step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub iteration: u32,
    pub task_id: String,
    pub root_cause: String,
    pub fix_plan: String,
}

/// Working memory carried between iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub recent_failures: Vec<FailureRecord>,
    pub codebase_patterns: Vec<String>,
}

/// Persisted state document for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub schema_version: u32,
    pub session_id: String,
    /// Change the run is linked to, when the orchestration layer supplies one.
    pub change_id: Option<String>,
    pub status: SessionStatus,
    /// Completed iterations so far (0 before the first one).
    pub iteration: u32,
    pub max_iterations: u32,
    pub current_task: Option<CurrentTask>,
    pub error_handling: ErrorHandling,
    pub context: RunContext,
}

/// Agent-declared result for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskClaim {
    Success,
    Failed,
}

/// Status recorded in an iteration log entry.
///
/// `Running` is reserved for in-flight entries written by observers; the state
/// machine only records `Success` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationStatus {
    Success,
    Failed,
    Running,
}

impl From<TaskClaim> for IterationStatus {
    fn from(claim: TaskClaim) -> Self {
        match claim {
            TaskClaim::Success => IterationStatus::Success,
            TaskClaim::Failed => IterationStatus::Failed,
        }
    }
}

/// Externally verified check results for one iteration.
///
/// Independent of the agent's own claim; the two are allowed to disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationEvidence {
    pub all_checks_passed: bool,
    /// Free-form detail (check names, command output digest).
    pub details: Option<String>,
}

/// Append-only history entry, one per completed iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationLog {
    pub iteration: u32,
    pub task_id: String,
    /// Unix seconds.
    pub timestamp: u64,
    pub status: IterationStatus,
    pub summary: String,
    pub verification: VerificationEvidence,
}

/// Identity of the task an iteration worked on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRef {
    pub id: String,
    pub description: String,
}

/// What went wrong, when an iteration failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetail {
    pub root_cause: String,
    pub fix_plan: String,
}

/// Outcome of one external agent iteration, reported back to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub task: TaskRef,
    pub claim: TaskClaim,
    pub summary: String,
    pub verification: VerificationEvidence,
    /// Required when `claim` is `Failed`; ignored otherwise.
    pub failure: Option<FailureDetail>,
}
