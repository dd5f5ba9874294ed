//! I/O helpers for the session core.

pub mod config;
pub mod iteration_log;
pub mod liveness;
pub mod lock;
pub mod paths;
pub mod session_store;
