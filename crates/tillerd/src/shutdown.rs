//! Ordered shutdown sequencing.
//!
//! Teardown follows a fixed order: the RPC listener is told to quit and its
//! thread joined before the controlled program is stopped and unloaded, and
//! the auxiliary reactor, which may still be serving observer or web
//! traffic that references the engine, is stopped last. Engine failures
//! during steps 3–4 are logged and never interrupt the sequence.
//!
//! Known gap, preserved from the modelled behaviour: neither the RPC join
//! nor the reactor stop is bounded by a timeout, so a hung RPC thread hangs
//! shutdown indefinitely.

use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::reactor::ReactorHandle;
use crate::rpc::RpcServer;

const SHUTDOWN_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::shutdown");

/// The five ordered teardown steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    /// Signal the RPC listener to quit.
    RpcQuit,
    /// Join the RPC thread.
    RpcJoin,
    /// Stop the controlled program.
    EngineStop,
    /// Unload the controlled program.
    EngineUnload,
    /// Stop the auxiliary reactor.
    ReactorStop,
}

/// Observer notified as each step begins; used by telemetry and tests.
pub trait ShutdownObserver: Send + Sync {
    /// Invoked immediately before the step runs.
    fn step(&self, step: ShutdownStep);
}

/// Default observer that records steps through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingShutdownObserver;

impl ShutdownObserver for TracingShutdownObserver {
    fn step(&self, step: ShutdownStep) {
        info!(target: SHUTDOWN_TARGET, step = ?step, "shutdown step");
    }
}

/// Auxiliary reactor teardown material: the stop handle and loop thread.
pub struct ReactorTeardown {
    /// Handle used to stop the loop.
    pub handle: ReactorHandle,
    /// The auxiliary thread running the loop.
    pub thread: JoinHandle<()>,
}

impl std::fmt::Debug for ReactorTeardown {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ReactorTeardown").finish_non_exhaustive()
    }
}

/// Executes the fixed teardown order.
pub struct ShutdownSequencer {
    observer: Arc<dyn ShutdownObserver>,
}

impl std::fmt::Debug for ShutdownSequencer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("ShutdownSequencer").finish_non_exhaustive()
    }
}

impl ShutdownSequencer {
    /// Builds a sequencer reporting to `observer`.
    #[must_use]
    pub fn new(observer: Arc<dyn ShutdownObserver>) -> Self {
        Self { observer }
    }

    /// Runs the five steps in order.
    ///
    /// `rpc_thread` is `None` when the RPC thread never started (for example
    /// because the worker loop was interrupted before its first job); the
    /// quit signal is still delivered so a listener mid-bind stops promptly.
    pub fn execute(
        &self,
        rpc: &dyn RpcServer,
        rpc_thread: Option<JoinHandle<()>>,
        engine: &dyn Engine,
        reactor: Option<ReactorTeardown>,
    ) {
        self.observer.step(ShutdownStep::RpcQuit);
        rpc.quit();

        self.observer.step(ShutdownStep::RpcJoin);
        if let Some(thread) = rpc_thread {
            if thread.join().is_err() {
                warn!(target: SHUTDOWN_TARGET, "rpc thread terminated abnormally");
            }
        }

        self.observer.step(ShutdownStep::EngineStop);
        if let Err(source) = engine.stop_program() {
            error!(
                target: SHUTDOWN_TARGET,
                error = %source,
                "failed to stop controlled program during shutdown"
            );
        }

        self.observer.step(ShutdownStep::EngineUnload);
        if let Err(source) = engine.unload_program() {
            error!(
                target: SHUTDOWN_TARGET,
                error = %source,
                "failed to unload controlled program during shutdown"
            );
        }

        if let Some(ReactorTeardown { handle, thread }) = reactor {
            self.observer.step(ShutdownStep::ReactorStop);
            handle.stop();
            if thread.join().is_err() {
                warn!(
                    target: SHUTDOWN_TARGET,
                    "auxiliary thread terminated abnormally"
                );
            }
        }

        info!(target: SHUTDOWN_TARGET, "shutdown sequence completed");
    }
}
