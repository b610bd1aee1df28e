//! Process-wide fault routing for spawned threads.
//!
//! Every thread the daemon creates goes through [`spawn_routed`], which wraps
//! the thread body so that a panic is delivered to a single [`FaultSink`]
//! instead of unwinding into an unobserved thread death. The sink is the same
//! one used for top-level failures, so operators see every fault in one
//! place. This is an explicit factory: call sites opt in by construction,
//! and no global thread primitive is patched.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use tracing::error;

const FAULT_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::fault");

/// Description of an uncaught failure inside a spawned thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadFault {
    description: String,
}

impl ThreadFault {
    /// Builds a fault from an error the thread body surfaced itself.
    #[must_use]
    pub fn from_message(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let description = payload
            .downcast_ref::<&str>()
            .map(|message| (*message).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "panic payload of unknown type".to_owned());
        Self { description }
    }

    /// Human-readable fault description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Diagnostic sink receiving every routed thread fault.
pub trait FaultSink: Send + Sync {
    /// Invoked on the faulting thread, after its body has stopped running.
    fn thread_fault(&self, thread: &str, fault: &ThreadFault);
}

/// Default sink that records faults through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingFaultSink;

impl TracingFaultSink {
    /// Builds a new sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl FaultSink for TracingFaultSink {
    fn thread_fault(&self, thread: &str, fault: &ThreadFault) {
        error!(
            target: FAULT_TARGET,
            thread,
            fault = %fault.description(),
            "uncaught fault in spawned thread"
        );
    }
}

/// Spawns a named thread whose failures are routed to `sink`.
///
/// The body runs under `catch_unwind`; a panic is converted into a
/// [`ThreadFault`] and reported, then the thread exits normally. The process
/// keeps running; the feature the thread provided simply becomes
/// unavailable. Threads that finish cleanly report nothing.
///
/// # Errors
///
/// Returns the OS error when the thread cannot be created.
pub fn spawn_routed<F>(
    name: &str,
    sink: Arc<dyn FaultSink>,
    body: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    let thread_name = name.to_owned();
    Builder::new().name(thread_name.clone()).spawn(move || {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(body)) {
            let fault = ThreadFault::from_panic(payload.as_ref());
            sink.thread_fault(&thread_name, &fault);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        faults: Mutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        fn faults(&self) -> Vec<(String, String)> {
            self.faults.lock().expect("sink lock").clone()
        }
    }

    impl FaultSink for RecordingSink {
        fn thread_fault(&self, thread: &str, fault: &ThreadFault) {
            self.faults
                .lock()
                .expect("sink lock")
                .push((thread.to_owned(), fault.description().to_owned()));
        }
    }

    #[test]
    fn panics_are_routed_to_the_sink() {
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn_routed("doomed", Arc::clone(&sink) as Arc<dyn FaultSink>, || {
            panic!("listener exploded")
        })
        .expect("spawn thread");

        handle.join().expect("routed thread must not propagate panics");
        assert_eq!(
            sink.faults(),
            vec![("doomed".to_owned(), "listener exploded".to_owned())]
        );
    }

    #[test]
    fn clean_exits_report_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn_routed("calm", Arc::clone(&sink) as Arc<dyn FaultSink>, || {})
            .expect("spawn thread");
        handle.join().expect("join thread");
        assert!(sink.faults().is_empty());
    }

    #[test]
    fn string_panic_payloads_are_preserved() {
        let sink = Arc::new(RecordingSink::default());
        let handle = spawn_routed("fmt", Arc::clone(&sink) as Arc<dyn FaultSink>, || {
            panic!("code {}", 7)
        })
        .expect("spawn thread");
        handle.join().expect("join thread");
        assert_eq!(sink.faults()[0].1, "code 7");
    }
}
