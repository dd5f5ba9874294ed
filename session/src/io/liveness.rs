//! Process liveness probing for stale-lock detection.
//!
//! The [`ProcessLiveness`] trait keeps the lock guard independent of the
//! probing mechanism so it is testable with a fake liveness source.

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

/// Answers whether a recorded process identity still resolves to a live
/// process.
pub trait ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Default backend: a zero-signal probe against the pid.
///
/// `ESRCH` means the process is gone; `EPERM` means it exists but belongs to
/// another user, which still counts as alive. A pid reused by an unrelated
/// process after a crash is reported alive; the deployment model accepts this
/// narrow false positive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalProbe;

impl ProcessLiveness for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let pid = match i32::try_from(pid) {
            Ok(pid) => pid,
            Err(_) => return false,
        };
        match kill(Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(_) => true,
        }
    }
}
