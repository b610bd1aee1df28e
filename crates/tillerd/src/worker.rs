//! Primary worker loop.
//!
//! The calling thread parks here for the process lifetime: it executes the
//! first worker job, then drains deferred jobs until an external stop signal
//! arrives. Operator interrupts (SIGINT/SIGTERM) raise the same stop flag
//! and are treated as a clean request to shut down, never as an error.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use signal_hook::consts::signal::{SIGINT, SIGTERM};
use tracing::{debug, info};

const WORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::worker");
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Unit of work executed on the worker thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The primary worker loop, owned by the calling thread.
pub struct MainWorker {
    jobs: Receiver<Job>,
    stop: Arc<AtomicBool>,
}

/// Cloneable handle for deferring jobs and requesting a stop.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: Sender<Job>,
    stop: Arc<AtomicBool>,
}

impl std::fmt::Debug for MainWorker {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("MainWorker").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("WorkerHandle").finish_non_exhaustive()
    }
}

impl MainWorker {
    /// Builds the worker loop and its handle.
    #[must_use]
    pub fn new() -> (Self, WorkerHandle) {
        let (sender, jobs) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        (
            Self {
                jobs,
                stop: Arc::clone(&stop),
            },
            WorkerHandle { sender, stop },
        )
    }

    /// Registers operator interrupt signals to raise the stop flag.
    ///
    /// # Errors
    ///
    /// Returns the OS error when a signal handler cannot be installed.
    pub fn install_interrupt_handlers(&self) -> io::Result<()> {
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&self.stop))?;
        }
        Ok(())
    }

    /// Runs `first_job`, then dispatches deferred jobs until stopped.
    pub fn run_loop<F>(&self, first_job: F)
    where
        F: FnOnce(),
    {
        debug!(target: WORKER_TARGET, "worker loop entered");
        first_job();
        while !self.stop.load(Ordering::SeqCst) {
            match self.jobs.recv_timeout(POLL_INTERVAL) {
                Ok(job) => job(),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(
            target: WORKER_TARGET,
            "worker loop exiting on stop request"
        );
    }
}

impl WorkerHandle {
    /// Queues `job` for execution on the worker thread.
    ///
    /// Jobs queued after the loop exits are dropped silently; shutdown has
    /// already begun at that point.
    pub fn defer<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _ = self.sender.send(Box::new(job));
    }

    /// Raises the stop flag; the loop exits at its next poll.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
