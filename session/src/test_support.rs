//! Test-only helpers for exercising the lock guard and state machine.

use std::collections::HashSet;

use crate::io::liveness::ProcessLiveness;

/// Scripted liveness source: answers from a fixed set of live pids.
#[derive(Debug, Clone)]
pub enum FakeLiveness {
    AllAlive,
    AllDead,
    Live(HashSet<u32>),
}

impl FakeLiveness {
    /// Every pid probes as alive.
    pub fn everyone_alive() -> Self {
        FakeLiveness::AllAlive
    }

    /// Every pid probes as dead (all records classify stale).
    pub fn everyone_dead() -> Self {
        FakeLiveness::AllDead
    }

    /// Only the given pid probes as alive.
    pub fn only(pid: u32) -> Self {
        FakeLiveness::Live(HashSet::from([pid]))
    }
}

impl ProcessLiveness for FakeLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        match self {
            FakeLiveness::AllAlive => true,
            FakeLiveness::AllDead => false,
            FakeLiveness::Live(live) => live.contains(&pid),
        }
    }
}
