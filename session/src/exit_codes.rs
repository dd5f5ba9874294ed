//! Stable exit codes for the session CLI.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed due to invalid layout/config/state or other errors.
pub const INVALID: i32 = 1;
/// The run's lock is held by a live process.
pub const ALREADY_RUNNING: i32 = 2;
/// The queried run has no persisted state.
pub const ABSENT: i32 = 3;
