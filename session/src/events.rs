//! Per-run event fan-out for monitoring clients.
//!
//! Each subscriber owns a bounded queue; when a subscriber falls behind the
//! bus drops its oldest pending event rather than blocking the state machine.
//! A keep-alive tick, distinct from real events, lets consumers detect a dead
//! stream.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::core::types::{IterationLog, SessionStatus};

/// Default per-subscriber queue capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Notification emitted by the run state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run's lifecycle status changed.
    Status {
        session_id: String,
        status: SessionStatus,
    },
    /// A new iteration log entry was appended.
    Log {
        session_id: String,
        entry: IterationLog,
    },
    /// A fresh task started its first attempt.
    TaskStarted { session_id: String, task_id: String },
    /// The current task failed and will be retried.
    TaskRetry {
        session_id: String,
        task_id: String,
        attempt: u32,
    },
    /// Retries exhausted; the task was abandoned.
    TaskAbandoned { session_id: String, task_id: String },
    /// Agent claimed success while verification disagreed.
    GateMismatch {
        session_id: String,
        iteration: u32,
        task_id: String,
    },
    /// Periodic liveness tick; carries no state change.
    KeepAlive,
}

#[derive(Debug)]
struct Queue {
    events: VecDeque<RunEvent>,
    dropped: u64,
    closed: bool,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<Queue>,
    available: Condvar,
    capacity: usize,
}

/// Receiving half of a subscription. Dropping it detaches from the bus.
pub struct Subscriber {
    shared: Arc<Shared>,
}

impl Subscriber {
    /// Wait up to `timeout` for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<RunEvent> {
        let mut queue = match self.shared.queue.lock() {
            Ok(queue) => queue,
            Err(_) => return None,
        };
        loop {
            if let Some(event) = queue.events.pop_front() {
                return Some(event);
            }
            let (next, result) = match self.shared.available.wait_timeout(queue, timeout) {
                Ok(pair) => pair,
                Err(_) => return None,
            };
            queue = next;
            if result.timed_out() && queue.events.is_empty() {
                return None;
            }
        }
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<RunEvent> {
        match self.shared.queue.lock() {
            Ok(mut queue) => queue.events.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Events dropped because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.shared
            .queue
            .lock()
            .map(|queue| queue.dropped)
            .unwrap_or(0)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.closed = true;
        }
    }
}

/// Fan-out bus for one run's events.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Arc<Shared>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber with the default queue capacity.
    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscriber {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                events: VecDeque::new(),
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
        });
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Arc::clone(&shared));
        }
        Subscriber { shared }
    }

    /// Deliver `event` to every live subscriber, dropping the oldest pending
    /// event of any subscriber at capacity.
    pub fn publish(&self, event: &RunEvent) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return;
        };
        subscribers.retain(|shared| {
            let Ok(mut queue) = shared.queue.lock() else {
                return false;
            };
            if queue.closed {
                return false;
            }
            if queue.events.len() >= shared.capacity {
                queue.events.pop_front();
                queue.dropped += 1;
                if queue.dropped == 1 {
                    warn!("slow event subscriber, dropping oldest events");
                }
            }
            queue.events.push_back(event.clone());
            shared.available.notify_all();
            true
        });
    }

    /// Start a keep-alive ticker publishing [`RunEvent::KeepAlive`] every
    /// `interval`. The ticker stops when the returned guard is dropped.
    pub fn start_keep_alive(&self, interval: Duration) -> KeepAliveHandle {
        let bus = self.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            debug!(interval_ms = interval.as_millis() as u64, "keep-alive ticker started");
            // Poll in short slices so dropping the handle stops us promptly.
            let slice = interval.min(Duration::from_millis(50));
            let mut elapsed = Duration::ZERO;
            while !thread_stop.load(Ordering::Relaxed) {
                thread::sleep(slice);
                elapsed += slice;
                if elapsed >= interval {
                    elapsed = Duration::ZERO;
                    bus.publish(&RunEvent::KeepAlive);
                }
            }
        });
        KeepAliveHandle {
            stop,
            handle: Some(handle),
        }
    }
}

/// Owns the keep-alive ticker thread; dropping it stops the ticks.
pub struct KeepAliveHandle {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
