//! Pure iteration transition for the run state machine.
//!
//! `apply_iteration` consumes the previous state plus an iteration report and
//! produces the next state, the log entry to append, and the policy outcome.
//! The caller persists the result; nothing here performs I/O.

use crate::core::types::{
    CurrentTask, FailureRecord, IterationLog, IterationReport, SessionState, SessionStatus,
    TaskClaim,
};

/// Policy decision produced by one recorded iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// Task succeeded; the run continues with the next task.
    Advanced,
    /// Task failed; retry the same task.
    Retry { task_id: String, attempt: u32 },
    /// Retries exhausted; the task was abandoned and a pattern recorded.
    TaskAbandoned { task_id: String, pattern: String },
    /// The iteration ceiling was reached without success; the run is failed.
    RunFailed { iterations: u32 },
}

/// Result of folding one iteration report into the state document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedIteration {
    pub state: SessionState,
    pub log: IterationLog,
    pub outcome: IterationOutcome,
    /// Agent claimed success while verification disagreed. Surfaced to
    /// observers; never auto-resolved here.
    pub gate_mismatch: bool,
}

/// Fold `report` into `prev`, producing the next state document.
///
/// Caller must ensure `prev.status` is `Running`; terminal states are the
/// caller's responsibility to reject.
pub fn apply_iteration(
    prev: &SessionState,
    report: &IterationReport,
    timestamp: u64,
) -> AppliedIteration {
    let mut state = prev.clone();
    let iteration = prev.iteration + 1;
    let max_retries = state.error_handling.max_retries;

    // A different task id means a fresh task: attempt counters start over.
    let same_task = state
        .current_task
        .as_ref()
        .is_some_and(|t| t.id == report.task.id);
    if !same_task {
        state.current_task = Some(CurrentTask {
            id: report.task.id.clone(),
            description: report.task.description.clone(),
            attempt_count: 0,
        });
    }

    let gate_mismatch =
        report.claim == TaskClaim::Success && !report.verification.all_checks_passed;

    let mut outcome = match report.claim {
        TaskClaim::Success => {
            // Task done; the next report starts a fresh task.
            state.current_task = None;
            IterationOutcome::Advanced
        }
        TaskClaim::Failed => {
            // current_task is always Some here; it was set above when absent.
            let attempt = match state.current_task.as_mut() {
                Some(task) => {
                    task.attempt_count += 1;
                    task.attempt_count
                }
                None => 1,
            };
            let task_id = report.task.id.clone();

            let (root_cause, fix_plan) = match &report.failure {
                Some(detail) => (detail.root_cause.clone(), detail.fix_plan.clone()),
                None => (report.summary.clone(), String::new()),
            };
            state.context.push_failure(FailureRecord {
                iteration,
                task_id: task_id.clone(),
                root_cause: root_cause.clone(),
                fix_plan,
            });

            if attempt >= max_retries {
                let pattern = format!("{task_id}: {root_cause}");
                state.context.add_pattern(&pattern);
                state.current_task = None;
                IterationOutcome::TaskAbandoned { task_id, pattern }
            } else {
                IterationOutcome::Retry { task_id, attempt }
            }
        }
    };

    state.iteration = iteration;

    // Reaching the ceiling without a successful final iteration fails the run.
    // A success on the last allowed iteration stays running so the caller can
    // still complete the run.
    if iteration >= state.max_iterations && report.claim != TaskClaim::Success {
        state.status = SessionStatus::Failed;
        outcome = IterationOutcome::RunFailed {
            iterations: iteration,
        };
    }

    let log = IterationLog {
        iteration,
        task_id: report.task.id.clone(),
        timestamp,
        status: report.claim.into(),
        summary: report.summary.clone(),
        verification: report.verification.clone(),
    };

    AppliedIteration {
        state,
        log,
        outcome,
        gate_mismatch,
    }
}
