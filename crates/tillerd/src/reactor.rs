//! Embedded event loop for the auxiliary interface.
//!
//! A minimal single-thread reactor: callbacks are scheduled with a delay and
//! run in due order on whichever thread called [`Reactor::run`]. The daemon
//! runs it on the dedicated auxiliary thread and uses a zero-delay callback
//! for the startup readiness handshake, which guarantees the loop is
//! actually dispatching before the worker loop is entered.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

const REACTOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::reactor");

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Scheduled {
    due: Instant,
    seq: u64,
    callback: Callback,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the binary heap yields the earliest entry first;
        // the sequence number keeps same-instant callbacks in FIFO order.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Core {
    queue: BinaryHeap<Scheduled>,
    next_seq: u64,
    stopped: bool,
}

struct Shared {
    core: Mutex<Core>,
    condvar: Condvar,
}

/// Event loop driven by [`Reactor::run`] on its owning thread.
pub struct Reactor {
    shared: Arc<Shared>,
}

/// Cloneable handle for scheduling callbacks and stopping the loop.
#[derive(Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Reactor").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for ReactorHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ReactorHandle").finish_non_exhaustive()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    /// Builds an idle reactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core::default()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns a handle usable from any thread.
    #[must_use]
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs the loop until [`ReactorHandle::stop`] is called.
    ///
    /// Due callbacks run one at a time on the calling thread. Entries still
    /// pending when the loop stops are dropped without running.
    pub fn run(&self) {
        debug!(target: REACTOR_TARGET, "reactor loop entered");
        loop {
            let callback = {
                let mut core = self
                    .shared
                    .core
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                loop {
                    if core.stopped {
                        debug!(target: REACTOR_TARGET, "reactor loop stopped");
                        return;
                    }
                    let now = Instant::now();
                    match core.queue.peek().map(|entry| entry.due) {
                        Some(due) if due <= now => {
                            break;
                        }
                        Some(due) => {
                            let timeout = due.saturating_duration_since(now);
                            let (guard, _) = self
                                .shared
                                .condvar
                                .wait_timeout(core, timeout)
                                .unwrap_or_else(PoisonError::into_inner);
                            core = guard;
                        }
                        None => {
                            core = self
                                .shared
                                .condvar
                                .wait(core)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                    }
                }
                match core.queue.pop() {
                    Some(entry) => entry.callback,
                    None => continue,
                }
            };
            // The lock is dropped before the callback runs so callbacks may
            // schedule further work or stop the loop without deadlocking.
            callback();
        }
    }
}

impl ReactorHandle {
    /// Schedules `callback` to run after `delay`; zero delay runs it on the
    /// next loop iteration.
    pub fn call_later<F>(&self, delay: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut core = self
            .shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = core.next_seq;
        core.next_seq += 1;
        core.queue.push(Scheduled {
            due: Instant::now() + delay,
            seq,
            callback: Box::new(callback),
        });
        self.shared.condvar.notify_all();
    }

    /// Stops the loop; idempotent and callable from any thread.
    pub fn stop(&self) {
        let mut core = self
            .shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        core.stopped = true;
        self.shared.condvar.notify_all();
    }
}
