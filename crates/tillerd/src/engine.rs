//! Execution-engine contract and its placeholder implementation.
//!
//! The engine owns the controlled program's load/start/stop lifecycle and
//! status reporting. The real execution engine is an external collaborator;
//! the daemon consumes it through the [`Engine`] trait and constructs it
//! exactly once during `init`. [`PlaceholderEngine`] stands in for it: it
//! tracks program state, honours autostart, and drives the status-callback
//! list, which is everything the orchestration layer needs.

use std::sync::{Mutex, PoisonError};

use camino::Utf8PathBuf;
use strum::Display;
use thiserror::Error;
use tracing::info;

use crate::vars::RuntimeVars;

const ENGINE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::engine");

/// Controlled-program state as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ProgramState {
    /// No program image is loaded.
    Empty,
    /// A program image is loaded but not running.
    Stopped,
    /// The program is executing.
    Started,
    /// The program failed and cannot continue.
    Broken,
}

/// Callback fired with the new state on every transition.
pub type StatusCallback = Box<dyn Fn(ProgramState) + Send + Sync>;

/// Errors surfaced by engine lifecycle operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Stopping the controlled program failed.
    #[error("failed to stop controlled program: {reason}")]
    Stop {
        /// Engine-reported failure detail.
        reason: String,
    },
    /// Unloading the controlled program failed.
    #[error("failed to unload controlled program: {reason}")]
    Unload {
        /// Engine-reported failure detail.
        reason: String,
    },
}

/// Lifecycle contract the orchestrator drives.
pub trait Engine: Send + Sync {
    /// Loads (and with `autostart`, starts) any previously deployed program.
    ///
    /// Called exactly once, from the first worker job, after the RPC
    /// listener is accepting connections. Must not block the worker loop
    /// beyond the load itself.
    fn auto_load(&self, autostart: bool);

    /// Stops the controlled program.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Stop`] when the program refuses to stop.
    fn stop_program(&self) -> Result<(), EngineError>;

    /// Unloads the controlled program image.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Unload`] when the image cannot be released.
    fn unload_program(&self) -> Result<(), EngineError>;
}

/// Stand-in engine used until a real execution engine is linked in.
pub struct PlaceholderEngine {
    workdir: Utf8PathBuf,
    state: Mutex<ProgramState>,
    callbacks: Vec<StatusCallback>,
    vars: RuntimeVars,
}

impl std::fmt::Debug for PlaceholderEngine {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PlaceholderEngine")
            .field("workdir", &self.workdir)
            .field("state", &self.state)
            .field("callbacks", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}

impl PlaceholderEngine {
    /// Builds the engine with its status observers and shared variables.
    #[must_use]
    pub fn new(workdir: Utf8PathBuf, callbacks: Vec<StatusCallback>, vars: RuntimeVars) -> Self {
        Self {
            workdir,
            state: Mutex::new(ProgramState::Empty),
            callbacks,
            vars,
        }
    }

    /// Current program state.
    #[must_use]
    pub fn state(&self) -> ProgramState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: ProgramState) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == next {
                return;
            }
            *state = next;
        }
        // Callbacks run outside the state lock so an observer reading the
        // engine state cannot deadlock against a concurrent transition.
        for callback in &self.callbacks {
            callback(next);
        }
    }
}

impl Engine for PlaceholderEngine {
    fn auto_load(&self, autostart: bool) {
        info!(
            target: ENGINE_TARGET,
            workdir = %self.workdir,
            autostart,
            "auto-load requested"
        );
        self.vars.set("workdir", self.workdir.as_str());
        self.transition(ProgramState::Stopped);
        if autostart {
            self.transition(ProgramState::Started);
        }
    }

    fn stop_program(&self) -> Result<(), EngineError> {
        if self.state() == ProgramState::Started {
            self.transition(ProgramState::Stopped);
        }
        Ok(())
    }

    fn unload_program(&self) -> Result<(), EngineError> {
        self.transition(ProgramState::Empty);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_callback(seen: Arc<Mutex<Vec<ProgramState>>>) -> StatusCallback {
        Box::new(move |state| seen.lock().expect("callback lock").push(state))
    }

    #[test]
    fn auto_load_with_autostart_reaches_started() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = PlaceholderEngine::new(
            Utf8PathBuf::from("/tmp/work"),
            vec![recording_callback(Arc::clone(&seen))],
            RuntimeVars::new(),
        );
        engine.auto_load(true);
        assert_eq!(engine.state(), ProgramState::Started);
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![ProgramState::Stopped, ProgramState::Started]
        );
    }

    #[test]
    fn auto_load_without_autostart_stays_stopped() {
        let engine =
            PlaceholderEngine::new(Utf8PathBuf::from("/tmp/work"), Vec::new(), RuntimeVars::new());
        engine.auto_load(false);
        assert_eq!(engine.state(), ProgramState::Stopped);
    }

    #[test]
    fn identical_transition_does_not_refire_callbacks() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let engine = PlaceholderEngine::new(
            Utf8PathBuf::from("/tmp/work"),
            vec![Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })],
            RuntimeVars::new(),
        );
        engine.auto_load(false);
        engine.stop_program().expect("stop");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unload_returns_to_empty() {
        let engine =
            PlaceholderEngine::new(Utf8PathBuf::from("/tmp/work"), Vec::new(), RuntimeVars::new());
        engine.auto_load(true);
        engine.stop_program().expect("stop");
        engine.unload_program().expect("unload");
        assert_eq!(engine.state(), ProgramState::Empty);
    }
}
