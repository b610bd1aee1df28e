//! Service lifecycle orchestration.
//!
//! [`ServiceOrchestrator`] owns the engine, the RPC listener, and the
//! optional auxiliary reactor thread for the process lifetime. `init` wires
//! everything together without starting any thread; `run` performs the
//! startup rendezvous, parks the calling thread in the primary worker loop,
//! and drives the ordered shutdown sequence when the loop exits.
//!
//! Two ordering guarantees matter to external observers. The auxiliary
//! event loop is dispatching callbacks before the worker loop is entered,
//! and the RPC listener is accepting connections before the stdout
//! readiness line is emitted and the controlled program is auto-loaded.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{error, info, warn};

use tiller_config::{BindEndpoint, ServiceConfig};

use crate::auxiliary::{AuxiliaryBackend, PreparedClient, SystemAuxiliary, WebHandle};
use crate::engine::{Engine, PlaceholderEngine, StatusCallback};
use crate::extensions::{Extension, ExtensionContext, ExtensionError, ExtensionLoader};
use crate::fault::{FaultSink, ThreadFault, TracingFaultSink, spawn_routed};
use crate::psk::{ProvisionError, ensure_shared_secret};
use crate::reactor::Reactor;
use crate::rendezvous::RendezvousLatch;
use crate::rpc::{DrainHandler, LogAnnouncer, RpcServer, TcpRpcServer};
use crate::shutdown::{ReactorTeardown, ShutdownObserver, ShutdownSequencer, TracingShutdownObserver};
use crate::status::{CommandLauncher, DetachedLauncher, build_observers};
use crate::vars::RuntimeVars;
use crate::worker::{MainWorker, WorkerHandle};

const ORCHESTRATOR_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::orchestrator");

/// Stdout prefix the supervising process scans for to detect readiness.
///
/// The full line is this prefix followed by the absolute working directory.
/// Changing the format is a breaking change to the supervision contract.
pub const READY_LINE_PREFIX: &str = "Current working directory :";

/// Everything the engine needs at construction.
pub struct EngineSeed {
    /// Resolved working directory.
    pub workdir: Utf8PathBuf,
    /// Status observers fired on every transition.
    pub callbacks: Vec<StatusCallback>,
    /// Shared runtime variables.
    pub vars: RuntimeVars,
}

/// Everything the RPC listener needs at construction.
pub struct RpcSeed {
    /// Resolved service identity (after extension overrides).
    pub identity: Option<String>,
    /// Endpoint to bind at serve time.
    pub endpoint: BindEndpoint,
    /// Fault sink for connection threads.
    pub sink: Arc<dyn FaultSink>,
}

/// Injected collaborator set; production wiring by default.
pub struct Collaborators {
    /// Process-wide diagnostic sink for routed thread faults.
    pub sink: Arc<dyn FaultSink>,
    /// Launcher for status-observer commands.
    pub launcher: Arc<dyn CommandLauncher>,
    /// Auxiliary web/client backend.
    pub auxiliary: Arc<dyn AuxiliaryBackend>,
    /// Builds the engine singleton during `init`.
    pub engine_factory: Box<dyn FnOnce(EngineSeed) -> Arc<dyn Engine>>,
    /// Builds the RPC listener during `init`; nothing is bound until serve.
    pub rpc_factory: Box<dyn FnOnce(RpcSeed) -> Arc<dyn RpcServer>>,
    /// Observer notified of each shutdown step.
    pub shutdown_observer: Arc<dyn ShutdownObserver>,
    /// In-process extensions appended after the configured hooks.
    pub extra_extensions: Vec<Box<dyn Extension>>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

impl Collaborators {
    /// Production collaborator set.
    #[must_use]
    pub fn production() -> Self {
        Self {
            sink: Arc::new(TracingFaultSink::new()),
            launcher: Arc::new(DetachedLauncher),
            auxiliary: Arc::new(SystemAuxiliary::new()),
            engine_factory: Box::new(|seed| {
                Arc::new(PlaceholderEngine::new(seed.workdir, seed.callbacks, seed.vars))
            }),
            rpc_factory: Box::new(|seed| {
                Arc::new(TcpRpcServer::new(
                    seed.identity,
                    seed.endpoint,
                    Arc::new(DrainHandler),
                    Arc::new(LogAnnouncer),
                    seed.sink,
                ))
            }),
            shutdown_observer: Arc::new(TracingShutdownObserver),
            extra_extensions: Vec::new(),
        }
    }
}

/// Errors that abort startup entirely.
#[derive(Debug, Error)]
pub enum InitError {
    /// The working directory does not exist and could not be created.
    #[error("failed to prepare working directory '{path}': {source}")]
    Workdir {
        /// Configured working directory.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// An extension failed; later steps may depend on its side effects.
    #[error("extension loading failed: {source}")]
    Extension {
        /// Underlying extension error.
        #[from]
        source: ExtensionError,
    },
    /// Secret provisioning failed for the resolved identity.
    #[error("secret provisioning failed: {source}")]
    Provision {
        /// Underlying provisioning error.
        #[from]
        source: ProvisionError,
    },
}

/// Errors that abort `run` before the worker loop is entered.
#[derive(Debug, Error)]
pub enum RunError {
    /// The auxiliary thread could not be created.
    #[error("failed to spawn auxiliary thread: {source}")]
    SpawnAuxiliary {
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },
}

/// The initialised service, ready for [`ServiceOrchestrator::run`].
pub struct ServiceOrchestrator {
    config: ServiceConfig,
    identity: Option<String>,
    vars: RuntimeVars,
    sink: Arc<dyn FaultSink>,
    engine: Arc<dyn Engine>,
    rpc: Arc<dyn RpcServer>,
    web: Option<WebHandle>,
    aux_enabled: bool,
    sequencer: ShutdownSequencer,
    worker: MainWorker,
    worker_handle: WorkerHandle,
}

impl std::fmt::Debug for ServiceOrchestrator {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ServiceOrchestrator")
            .field("identity", &self.identity)
            .field("workdir", &self.config.workdir)
            .field("aux_enabled", &self.aux_enabled)
            .finish_non_exhaustive()
    }
}

impl ServiceOrchestrator {
    /// Initialises the service with production collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] when the working directory cannot be prepared,
    /// an extension fails, or secret provisioning fails.
    pub fn init(config: ServiceConfig) -> Result<Self, InitError> {
        Self::init_with(config, Collaborators::production())
    }

    /// Initialises the service with injected collaborators.
    ///
    /// Construction order is part of the contract: the fault sink exists
    /// before anything else, extensions run before secret provisioning and
    /// engine construction, and the RPC listener is constructed but not
    /// started. Auxiliary failures degrade the affected feature instead of
    /// aborting startup.
    ///
    /// # Errors
    ///
    /// Returns [`InitError`] on the fatal paths listed for [`Self::init`].
    pub fn init_with(
        config: ServiceConfig,
        collaborators: Collaborators,
    ) -> Result<Self, InitError> {
        let Collaborators {
            sink,
            launcher,
            auxiliary,
            engine_factory,
            rpc_factory,
            shutdown_observer,
            extra_extensions,
        } = collaborators;

        ensure_workdir(&config.workdir)?;

        let vars = RuntimeVars::new();
        let mut identity = config.identity.clone();

        let mut aux_enabled = config.web_interface;
        let mut prepared_client: Option<PreparedClient> = None;
        if aux_enabled {
            match auxiliary.prepare_client(&config.workdir, config.client_conf.as_deref()) {
                Ok(client) => prepared_client = Some(client),
                Err(source) => {
                    warn!(
                        target: ORCHESTRATOR_TARGET,
                        error = %source,
                        "auxiliary client preparation failed; auxiliary interface disabled"
                    );
                    aux_enabled = false;
                }
            }
        }

        let mut loader = ExtensionLoader::from_specs(&config.extensions);
        for extension in extra_extensions {
            loader.push(extension);
        }
        {
            let mut context = ExtensionContext::new(&mut identity, &vars);
            loader.load(&mut context)?;
        }

        // The identity is provisioned only now, so an extension-computed
        // identity reaches the secret file instead of the CLI value.
        if let (Some(identity), Some(psk_path)) = (identity.as_deref(), config.psk_path.as_deref())
        {
            ensure_shared_secret(identity, psk_path)?;
        }

        let callbacks = build_observers(&config.observers, launcher);
        let engine = engine_factory(EngineSeed {
            workdir: config.workdir.clone(),
            callbacks,
            vars: vars.clone(),
        });

        let rpc = rpc_factory(RpcSeed {
            identity: identity.clone(),
            endpoint: config.endpoint.clone(),
            sink: Arc::clone(&sink),
        });

        let mut web = None;
        if aux_enabled {
            if let Some(port) = config.web_port {
                let endpoint = BindEndpoint::new(config.endpoint.host.clone(), port);
                match auxiliary.register_web_endpoint(&endpoint) {
                    Ok(handle) => {
                        vars.set("website", handle.address().to_string());
                        web = Some(handle);
                    }
                    Err(source) => {
                        warn!(
                            target: ORCHESTRATOR_TARGET,
                            error = %source,
                            "web endpoint registration failed; continuing without it"
                        );
                    }
                }
            }

            if let Some(client) = prepared_client.as_ref() {
                if let Err(source) =
                    auxiliary.register_client(client, config.psk_path.as_deref(), web.as_ref())
                {
                    warn!(
                        target: ORCHESTRATOR_TARGET,
                        error = %source,
                        "auxiliary client registration failed; continuing without it"
                    );
                }
            }
        }

        let (worker, worker_handle) = MainWorker::new();

        Ok(Self {
            config,
            identity,
            vars,
            sink,
            engine,
            rpc,
            web,
            aux_enabled,
            sequencer: ShutdownSequencer::new(shutdown_observer),
            worker,
            worker_handle,
        })
    }

    /// Resolved service identity, after extension overrides.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Shared runtime variables.
    #[must_use]
    pub fn vars(&self) -> &RuntimeVars {
        &self.vars
    }

    /// Whether the auxiliary interface survived initialisation.
    #[must_use]
    pub fn auxiliary_enabled(&self) -> bool {
        self.aux_enabled
    }

    /// Handle for deferring work to the worker loop or stopping it.
    #[must_use]
    pub fn worker(&self) -> WorkerHandle {
        self.worker_handle.clone()
    }

    /// Runs the service to completion, writing contract output to stdout.
    #[must_use]
    pub fn run(self) -> ExitCode {
        let mut stdout = io::stdout();
        self.run_with_output(&mut stdout)
    }

    /// Runs the service, writing the readiness contract lines to `out`.
    ///
    /// Blocks the calling thread in the primary worker loop until an
    /// interrupt or a [`WorkerHandle::request_stop`], then executes the
    /// shutdown sequence. Interrupts are clean termination, not errors.
    pub fn run_with_output<W: Write>(self, out: &mut W) -> ExitCode {
        match self.run_inner(out) {
            Ok(()) => ExitCode::SUCCESS,
            Err(source) => {
                error!(
                    target: ORCHESTRATOR_TARGET,
                    error = %source,
                    "service run failed"
                );
                ExitCode::FAILURE
            }
        }
    }

    fn run_inner<W: Write>(self, out: &mut W) -> Result<(), RunError> {
        let Self {
            config,
            identity: _,
            vars: _,
            sink,
            engine,
            rpc,
            web,
            aux_enabled,
            sequencer,
            worker,
            worker_handle,
        } = self;

        let reactor = if aux_enabled {
            Some(start_reactor(&sink)?)
        } else {
            None
        };

        if let Err(source) = worker.install_interrupt_handlers() {
            warn!(
                target: ORCHESTRATOR_TARGET,
                error = %source,
                "failed to install interrupt handlers; operator signals may kill the process"
            );
        }

        let mut rpc_thread: Option<JoinHandle<()>> = None;
        let first_job = first_worker_job(
            &config,
            Arc::clone(&rpc),
            Arc::clone(&engine),
            Arc::clone(&sink),
            &mut rpc_thread,
            out,
        );

        worker.run_loop(first_job);
        // Dropping the handle only now: the job channel must stay open for
        // the whole time the loop is dispatching.
        drop(worker_handle);

        sequencer.execute(rpc.as_ref(), rpc_thread, engine.as_ref(), reactor);
        // The web endpoint outlives engine teardown so late observer traffic
        // is not cut off; it is released only now.
        drop(web);
        info!(target: ORCHESTRATOR_TARGET, "service stopped");
        Ok(())
    }
}

fn ensure_workdir(path: &Utf8Path) -> Result<(), InitError> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::create_dir_all(path).map_err(|source| InitError::Workdir {
        path: path.to_owned(),
        source,
    })
}

fn start_reactor(sink: &Arc<dyn FaultSink>) -> Result<ReactorTeardown, RunError> {
    let reactor = Reactor::new();
    let handle = reactor.handle();

    let started = Arc::new(RendezvousLatch::new());
    let release = Arc::clone(&started);
    handle.call_later(Duration::ZERO, move || release.release());

    let thread = spawn_routed("auxiliary", Arc::clone(sink), move || reactor.run())
        .map_err(|source| RunError::SpawnAuxiliary { source })?;

    // The loop has executed a callback once this returns, so anything
    // scheduled later cannot be lost to a not-yet-running reactor.
    started.wait();
    info!(target: ORCHESTRATOR_TARGET, "auxiliary event loop started");

    Ok(ReactorTeardown { handle, thread })
}

/// Builds the job executed exactly once, first, inside the worker loop.
///
/// It starts the RPC thread, waits for the listener to accept connections,
/// emits the server info and the stdout readiness line, and finally
/// auto-loads the controlled program. When the listener fails before
/// signalling ready, the fault is routed, the readiness line is withheld,
/// and the service keeps running with RPC unavailable.
fn first_worker_job<'a, W: Write>(
    config: &'a ServiceConfig,
    rpc: Arc<dyn RpcServer>,
    engine: Arc<dyn Engine>,
    sink: Arc<dyn FaultSink>,
    rpc_thread: &'a mut Option<JoinHandle<()>>,
    out: &'a mut W,
) -> impl FnOnce() + 'a {
    move || {
        let ready = Arc::new(RendezvousLatch::new());
        let accepting = Arc::new(AtomicBool::new(false));

        let serve_rpc = {
            let rpc = Arc::clone(&rpc);
            let ready = Arc::clone(&ready);
            let accepting = Arc::clone(&accepting);
            let sink = Arc::clone(&sink);
            move || {
                let on_ready = {
                    let ready = Arc::clone(&ready);
                    let accepting = Arc::clone(&accepting);
                    Box::new(move || {
                        accepting.store(true, Ordering::SeqCst);
                        ready.release();
                    })
                };
                if let Err(source) = rpc.serve(on_ready) {
                    sink.thread_fault("rpc", &ThreadFault::from_message(source.to_string()));
                    // Unblock the handshake; the worker job inspects
                    // `accepting` to learn the listener never came up.
                    ready.release();
                }
            }
        };

        match spawn_routed("rpc", Arc::clone(&sink), serve_rpc) {
            Ok(handle) => *rpc_thread = Some(handle),
            Err(source) => {
                sink.thread_fault("rpc", &ThreadFault::from_message(source.to_string()));
                ready.release();
            }
        }

        // Wait for the rpc thread to be effective.
        ready.wait();

        if accepting.load(Ordering::SeqCst) {
            if let Err(source) = rpc.print_server_info(out) {
                warn!(
                    target: ORCHESTRATOR_TARGET,
                    error = %source,
                    "failed to write server info"
                );
            }
            // The supervising IDE detects a ready local runtime by scanning
            // stdout for the working directory; the format is a contract.
            if let Err(source) = writeln!(out, "{READY_LINE_PREFIX}{}", config.workdir)
                .and_then(|()| out.flush())
            {
                warn!(
                    target: ORCHESTRATOR_TARGET,
                    error = %source,
                    "failed to write readiness line"
                );
            }
        } else {
            error!(
                target: ORCHESTRATOR_TARGET,
                "rpc listener unavailable; readiness line withheld"
            );
        }

        engine.auto_load(config.autostart);
    }
}
