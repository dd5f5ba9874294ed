//! Run lifecycle state machine.
//!
//! Owns all mutation of the session document for one run: it acquires the
//! lock, folds iteration reports through the pure transition in
//! [`crate::core::state_update`], persists the result atomically, and pushes
//! transitions to the event bus. External agent work happens outside; callers
//! report outcomes through [`IterationReport`].

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::state_update::{IterationOutcome, apply_iteration};
use crate::core::types::{IterationReport, SessionState, SessionStatus};
use crate::events::{EventBus, RunEvent};
use crate::io::config::{RunConfig, write_config};
use crate::io::iteration_log::append_iteration;
use crate::io::liveness::ProcessLiveness;
use crate::io::lock::{LockGuard, LockLostError, unix_now};
use crate::io::paths::SessionPaths;
use crate::io::session_store::{initial_state, read_session, write_session};

/// Decision taken at an iteration boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// The run may start the next iteration.
    Proceed,
    /// A stop was requested; the run was finalized as stopped.
    Stopped,
}

/// Live handle on one run. At most one exists per run across all processes;
/// the lock guard enforces this.
#[derive(Debug)]
pub struct RunSession<P: ProcessLiveness> {
    paths: SessionPaths,
    lock: LockGuard<P>,
    state: SessionState,
    events: EventBus,
    stop_flag: Arc<AtomicBool>,
    lock_held: bool,
}

impl<P: ProcessLiveness> RunSession<P> {
    /// Create a fresh run: directory scaffolding, lock, config, initial state.
    ///
    /// Fails with [`crate::io::lock::LockHeldError`] when another live process
    /// owns the run; a stale lock from a crashed process is reclaimed.
    pub fn create(
        base: &Path,
        session_id: &str,
        config: &RunConfig,
        liveness: P,
    ) -> Result<Self> {
        config.validate()?;
        let paths = SessionPaths::new(base, session_id);
        paths.ensure_dirs()?;

        let lock = LockGuard::new(&paths.lock_path, session_id, liveness);
        lock.acquire()?;

        write_config(&paths.config_path, config)?;
        let state = initial_state(session_id, config);
        write_session(&paths.state_path, &state)?;
        clear_stop_request(&paths)?;

        info!(session_id, max_iterations = state.max_iterations, "run created");
        let session = Self {
            paths,
            lock,
            state,
            events: EventBus::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            lock_held: true,
        };
        session.emit_status();
        Ok(session)
    }

    /// Re-attach to an interrupted run after a restart.
    ///
    /// The persisted document must exist and still be `running`; a stale lock
    /// left by the crashed process is reclaimed.
    pub fn resume(base: &Path, session_id: &str, liveness: P) -> Result<Self> {
        let paths = SessionPaths::new(base, session_id);
        let state = read_session(&paths.state_path)?
            .ok_or_else(|| anyhow!("no session to resume for run {session_id}"))?;
        if state.status.is_terminal() {
            return Err(anyhow!(
                "run {session_id} already finished ({:?})",
                state.status
            ));
        }

        let lock = LockGuard::new(&paths.lock_path, session_id, liveness);
        lock.acquire()?;
        clear_stop_request(&paths)?;

        info!(session_id, iteration = state.iteration, "run resumed");
        let session = Self {
            paths,
            lock,
            state,
            events: EventBus::new(),
            stop_flag: Arc::new(AtomicBool::new(false)),
            lock_held: true,
        };
        session.emit_status();
        Ok(session)
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    /// Bus carrying this run's transition events. Subscribe before iterating.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// In-process stop trigger, honored at the next iteration boundary.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }

    /// Check the iteration boundary: stop requests first, then lock ownership.
    ///
    /// Stop is cooperative; an in-flight iteration is never preempted. When a
    /// stop was requested (in-process or via the stop marker file), the run is
    /// finalized as `stopped` and the lock released.
    pub fn iteration_gate(&mut self) -> Result<GateDecision> {
        self.ensure_running()?;
        if self.stop_flag.load(Ordering::Relaxed) || stop_requested(&self.paths) {
            info!(session_id = %self.state.session_id, "stop requested, finalizing run");
            self.finalize(SessionStatus::Stopped)?;
            clear_stop_request(&self.paths)?;
            return Ok(GateDecision::Stopped);
        }
        self.ensure_lock_held()?;
        Ok(GateDecision::Proceed)
    }

    /// Record the outcome of one external iteration.
    ///
    /// The updated document is persisted before the in-memory state advances,
    /// so the iteration counter never runs ahead of durable state.
    pub fn record_iteration(&mut self, report: &IterationReport) -> Result<IterationOutcome> {
        self.ensure_running()?;
        self.ensure_lock_held()?;

        let fresh_task = self
            .state
            .current_task
            .as_ref()
            .is_none_or(|t| t.id != report.task.id);

        let applied = apply_iteration(&self.state, report, unix_now());
        write_session(&self.paths.state_path, &applied.state)?;
        append_iteration(&self.paths, &applied.log)
            .with_context(|| format!("record iteration {}", applied.log.iteration))?;

        let session_id = self.state.session_id.clone();
        if fresh_task {
            self.events.publish(&RunEvent::TaskStarted {
                session_id: session_id.clone(),
                task_id: report.task.id.clone(),
            });
        }
        self.events.publish(&RunEvent::Log {
            session_id: session_id.clone(),
            entry: applied.log.clone(),
        });
        if applied.gate_mismatch {
            warn!(
                session_id = %session_id,
                iteration = applied.log.iteration,
                task_id = %report.task.id,
                "agent claimed success but verification checks failed"
            );
            self.events.publish(&RunEvent::GateMismatch {
                session_id: session_id.clone(),
                iteration: applied.log.iteration,
                task_id: report.task.id.clone(),
            });
        }
        match &applied.outcome {
            IterationOutcome::Advanced => {}
            IterationOutcome::Retry { task_id, attempt } => {
                self.events.publish(&RunEvent::TaskRetry {
                    session_id: session_id.clone(),
                    task_id: task_id.clone(),
                    attempt: *attempt,
                });
            }
            IterationOutcome::TaskAbandoned { task_id, pattern } => {
                info!(session_id = %session_id, task_id = %task_id, pattern = %pattern, "task abandoned after retries");
                self.events.publish(&RunEvent::TaskAbandoned {
                    session_id: session_id.clone(),
                    task_id: task_id.clone(),
                });
            }
            IterationOutcome::RunFailed { iterations } => {
                warn!(session_id = %session_id, iterations, "iteration ceiling reached, run failed");
            }
        }

        let failed = applied.state.status == SessionStatus::Failed;
        self.state = applied.state;
        if failed {
            self.emit_status();
            self.release_lock();
        }
        Ok(applied.outcome)
    }

    /// Mark the run completed: persist, notify, release the lock.
    pub fn complete(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.finalize(SessionStatus::Completed)
    }

    /// Mark the run stopped without waiting for the next gate check.
    pub fn stop(&mut self) -> Result<()> {
        self.ensure_running()?;
        self.finalize(SessionStatus::Stopped)?;
        clear_stop_request(&self.paths)
    }

    fn finalize(&mut self, status: SessionStatus) -> Result<()> {
        let mut next = self.state.clone();
        next.status = status;
        write_session(&self.paths.state_path, &next)?;
        self.state = next;
        self.emit_status();
        self.release_lock();
        info!(session_id = %self.state.session_id, status = ?status, "run finalized");
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state.status.is_terminal() {
            return Err(anyhow!(
                "run {} already finished ({:?})",
                self.state.session_id,
                self.state.status
            ));
        }
        Ok(())
    }

    fn ensure_lock_held(&self) -> Result<()> {
        if self.lock_held && self.lock.held_by_current_process()? {
            return Ok(());
        }
        Err(LockLostError {
            session_id: self.state.session_id.clone(),
        }
        .into())
    }

    fn release_lock(&mut self) {
        if !self.lock_held {
            return;
        }
        if let Err(err) = self.lock.release() {
            warn!(session_id = %self.state.session_id, err = %err, "failed to release lock");
        }
        self.lock_held = false;
    }

    fn emit_status(&self) {
        self.events.publish(&RunEvent::Status {
            session_id: self.state.session_id.clone(),
            status: self.state.status,
        });
    }
}

impl<P: ProcessLiveness> Drop for RunSession<P> {
    fn drop(&mut self) {
        // Normal exits release through finalize; this covers early returns and
        // unwinding. A hard crash leaves a stale record for the next process.
        self.release_lock();
    }
}

/// Ask a run (possibly in another process) to stop at its next iteration
/// boundary by writing a stop marker into the run directory.
pub fn request_stop(paths: &SessionPaths) -> Result<()> {
    fs::create_dir_all(&paths.run_dir)
        .with_context(|| format!("create directory {}", paths.run_dir.display()))?;
    fs::write(&paths.stop_path, b"stop\n")
        .with_context(|| format!("write stop marker {}", paths.stop_path.display()))?;
    debug!(path = %paths.stop_path.display(), "stop requested");
    Ok(())
}

/// Whether a stop marker is pending for the run.
pub fn stop_requested(paths: &SessionPaths) -> bool {
    paths.stop_path.exists()
}

fn clear_stop_request(paths: &SessionPaths) -> Result<()> {
    match fs::remove_file(&paths.stop_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("remove stop marker {}", paths.stop_path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        FailureDetail, TaskClaim, TaskRef, VerificationEvidence,
    };
    use crate::io::config::ErrorConfig;
    use crate::io::lock::{LockHeldError, LockRecord, LockStatus};
    use crate::io::session_store::delete_session;
    use crate::test_support::FakeLiveness;

    fn config(max_iterations: u32, max_retries: u32) -> RunConfig {
        RunConfig {
            max_iterations,
            error: ErrorConfig {
                max_retries,
                ..ErrorConfig::default()
            },
            ..RunConfig::default()
        }
    }

    fn success(task_id: &str) -> IterationReport {
        IterationReport {
            task: TaskRef {
                id: task_id.to_string(),
                description: format!("{task_id} description"),
            },
            claim: TaskClaim::Success,
            summary: "done".to_string(),
            verification: VerificationEvidence {
                all_checks_passed: true,
                details: None,
            },
            failure: None,
        }
    }

    fn failure(task_id: &str) -> IterationReport {
        IterationReport {
            claim: TaskClaim::Failed,
            failure: Some(FailureDetail {
                root_cause: "compile error".to_string(),
                fix_plan: "fix the import".to_string(),
            }),
            ..success(task_id)
        }
    }

    #[test]
    fn create_persists_initial_state_and_holds_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");

        let persisted = read_session(&run.paths().state_path)
            .expect("read")
            .expect("present");
        assert_eq!(persisted.status, SessionStatus::Running);
        assert_eq!(persisted.iteration, 0);
        assert!(run.paths().lock_path.exists());
    }

    #[test]
    fn create_fails_while_another_live_process_holds_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = SessionPaths::new(temp.path(), "run-1");
        paths.ensure_dirs().expect("dirs");
        let other = LockRecord {
            pid: 4242,
            acquired_at: 1,
            session_id: "run-1".to_string(),
        };
        fs::write(
            &paths.lock_path,
            serde_json::to_string(&other).expect("serialize"),
        )
        .expect("seed lock");

        let err = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::everyone_alive(),
        )
        .unwrap_err();
        assert!(err.downcast_ref::<LockHeldError>().is_some());
    }

    #[test]
    fn resume_reclaims_stale_lock_from_crashed_process() {
        let temp = tempfile::tempdir().expect("tempdir");
        let session_id;
        {
            let run = RunSession::create(
                temp.path(),
                "run-1",
                &config(10, 3),
                FakeLiveness::only(std::process::id()),
            )
            .expect("create");
            session_id = run.state().session_id.clone();
            // Simulate a crash: drop without finalizing but leave the record.
            let crashed = LockRecord {
                pid: 4_000_000,
                acquired_at: 1,
                session_id: session_id.clone(),
            };
            drop(run);
            fs::write(
                &SessionPaths::new(temp.path(), "run-1").lock_path,
                serde_json::to_string(&crashed).expect("serialize"),
            )
            .expect("seed crashed lock");
        }

        let resumed = RunSession::resume(
            temp.path(),
            &session_id,
            FakeLiveness::only(std::process::id()),
        )
        .expect("resume");
        match resumed.lock.check().expect("check") {
            LockStatus::Held(record) => assert_eq!(record.pid, std::process::id()),
            other => panic!("expected held, got {other:?}"),
        }
    }

    #[test]
    fn resume_without_session_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = RunSession::resume(temp.path(), "run-404", FakeLiveness::everyone_alive())
            .unwrap_err();
        assert!(err.to_string().contains("no session to resume"));
    }

    #[test]
    fn successful_iteration_advances_and_logs() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");
        let sub = run.events().subscribe();

        assert_eq!(run.iteration_gate().expect("gate"), GateDecision::Proceed);
        let outcome = run.record_iteration(&success("t1")).expect("iterate");
        assert_eq!(outcome, IterationOutcome::Advanced);
        assert_eq!(run.state().iteration, 1);

        let logs = crate::io::iteration_log::list_iterations(run.paths()).expect("logs");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].task_id, "t1");

        let events = sub.drain();
        assert!(events.iter().any(|e| matches!(e, RunEvent::TaskStarted { task_id, .. } if task_id == "t1")));
        assert!(events.iter().any(|e| matches!(e, RunEvent::Log { .. })));
    }

    #[test]
    fn retries_exhaust_into_abandonment_and_pattern() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 2),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");
        let sub = run.events().subscribe();

        let first = run.record_iteration(&failure("t1")).expect("first");
        assert_eq!(
            first,
            IterationOutcome::Retry {
                task_id: "t1".to_string(),
                attempt: 1
            }
        );
        let second = run.record_iteration(&failure("t1")).expect("second");
        assert!(matches!(second, IterationOutcome::TaskAbandoned { .. }));
        assert_eq!(
            run.state().context.codebase_patterns,
            vec!["t1: compile error"]
        );

        let events = sub.drain();
        assert!(events.iter().any(|e| matches!(e, RunEvent::TaskRetry { attempt: 1, .. })));
        assert!(events.iter().any(|e| matches!(e, RunEvent::TaskAbandoned { .. })));
    }

    #[test]
    fn ceiling_failure_terminates_and_releases_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(1, 5),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");

        let outcome = run.record_iteration(&failure("t1")).expect("iterate");
        assert_eq!(outcome, IterationOutcome::RunFailed { iterations: 1 });
        assert_eq!(run.state().status, SessionStatus::Failed);
        assert!(!run.paths().lock_path.exists());

        let err = run.record_iteration(&failure("t1")).unwrap_err();
        assert!(err.to_string().contains("already finished"));
    }

    #[test]
    fn gate_mismatch_emits_event_without_failing_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");
        let sub = run.events().subscribe();

        let report = IterationReport {
            verification: VerificationEvidence {
                all_checks_passed: false,
                details: Some("clippy failed".to_string()),
            },
            ..success("t1")
        };
        run.record_iteration(&report).expect("iterate");

        assert_eq!(run.state().status, SessionStatus::Running);
        let events = sub.drain();
        assert!(events.iter().any(|e| matches!(e, RunEvent::GateMismatch { iteration: 1, .. })));
    }

    #[test]
    fn stop_marker_finalizes_at_gate() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");

        request_stop(run.paths()).expect("request stop");
        assert_eq!(run.iteration_gate().expect("gate"), GateDecision::Stopped);
        assert_eq!(run.state().status, SessionStatus::Stopped);
        assert!(!run.paths().lock_path.exists());
        assert!(!stop_requested(run.paths()));
    }

    #[test]
    fn in_process_stop_request_is_honored() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");

        run.request_stop();
        assert_eq!(run.iteration_gate().expect("gate"), GateDecision::Stopped);
    }

    #[test]
    fn lost_lock_is_fatal_to_the_iteration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");

        fs::remove_file(&run.paths().lock_path).expect("steal lock");
        let err = run.record_iteration(&success("t1")).unwrap_err();
        assert!(err.downcast_ref::<LockLostError>().is_some());
    }

    #[test]
    fn complete_finalizes_persists_and_releases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");
        let sub = run.events().subscribe();

        run.record_iteration(&success("t1")).expect("iterate");
        run.complete().expect("complete");

        assert_eq!(run.state().status, SessionStatus::Completed);
        assert!(!run.paths().lock_path.exists());
        let persisted = read_session(&run.paths().state_path)
            .expect("read")
            .expect("present");
        assert_eq!(persisted.status, SessionStatus::Completed);
        assert!(sub.drain().iter().any(|e| matches!(
            e,
            RunEvent::Status { status: SessionStatus::Completed, .. }
        )));
    }

    #[test]
    fn delete_after_run_removes_state_and_lock_together() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run = RunSession::create(
            temp.path(),
            "run-1",
            &config(10, 3),
            FakeLiveness::only(std::process::id()),
        )
        .expect("create");
        let paths = run.paths().clone();
        drop(run);

        delete_session(&paths).expect("delete");
        assert!(!paths.state_path.exists());
        assert!(!paths.lock_path.exists());
    }
}
