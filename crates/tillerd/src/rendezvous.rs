//! One-shot readiness gates for startup handshakes.
//!
//! The daemon performs two rendezvous per process lifetime: the calling
//! thread waits for the auxiliary reactor to start processing callbacks, and
//! the first worker job waits for the RPC listener to accept connections.
//! Each handshake uses its own [`RendezvousLatch`]; a latch is never reused.

use std::sync::{Condvar, Mutex, PoisonError};

use tracing::warn;

const RENDEZVOUS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::rendezvous");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    /// No release has happened yet; waiters block.
    Armed,
    /// Released once; the next waiter passes through.
    Released,
    /// The single release has been consumed; further waiters block forever.
    Spent,
}

/// Single-fire gate: `wait` blocks until exactly one `release` has occurred.
///
/// The gate is deliberately not reusable. A `wait` after the release has
/// been consumed blocks indefinitely, which keeps misuse loud instead of
/// silently turning the latch into a counting semaphore. A second `release`
/// is a protocol violation and is logged, not swallowed.
#[derive(Debug)]
pub struct RendezvousLatch {
    state: Mutex<LatchState>,
    condvar: Condvar,
}

impl Default for RendezvousLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl RendezvousLatch {
    /// Builds an armed latch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Armed),
            condvar: Condvar::new(),
        }
    }

    /// Signals that the awaited milestone has been reached.
    ///
    /// Exactly one release is expected per latch. Repeated releases are
    /// logged as protocol violations and otherwise ignored.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == LatchState::Armed {
            *state = LatchState::Released;
            self.condvar.notify_all();
        } else {
            warn!(
                target: RENDEZVOUS_TARGET,
                "rendezvous latch released more than once; ignoring"
            );
        }
    }

    /// Blocks the calling thread until the single release has occurred.
    pub fn wait(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if *state == LatchState::Released {
                *state = LatchState::Spent;
                return;
            }
            state = self
                .condvar
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}
