//! Run session and lock management for an iterative coding agent.
//!
//! This crate owns the persisted state of a single agent run: at-most-one
//! live process per run, crash recovery via stale-lock detection, a bounded
//! rolling failure window, and an event stream for observers. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (types, context tracking, state
//!   transitions). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (lock file, session store,
//!   iteration logs, process liveness). Isolated to enable mocking in tests.
//!
//! [`run`] coordinates core logic with I/O to drive the run lifecycle, and
//! [`events`] fans transitions out to monitoring clients.

pub mod core;
pub mod events;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
