//! RPC listener for the supervising IDE and remote tooling.
//!
//! The wire protocol itself is an external concern; this module owns the
//! listener lifecycle: bind the endpoint, signal readiness exactly once the
//! socket is accepting, hand connections to an opaque handler, and stop on
//! request. The readiness signal is load-bearing: the orchestrator must not
//! report the runtime ready, nor auto-load the controlled program, before
//! the listener can actually accept a connection.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use tiller_config::BindEndpoint;

use crate::fault::FaultSink;

const RPC_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::rpc");
const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);

/// Callback invoked exactly once when the listener is accepting connections.
pub type ReadyCallback = Box<dyn FnOnce() + Send + 'static>;

/// Listener lifecycle, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// `serve` has not been called.
    Unstarted,
    /// The socket is bound and accepting.
    Listening,
    /// `serve` has returned.
    Stopped,
}

/// Errors raised while bringing the listener up.
#[derive(Debug, Error)]
pub enum RpcServerError {
    /// The configured host failed to resolve.
    #[error("failed to resolve '{endpoint}': {source}")]
    Resolve {
        /// Configured endpoint.
        endpoint: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },
    /// The configured host resolved to no usable address.
    #[error("'{endpoint}' resolved to no address")]
    ResolveEmpty {
        /// Configured endpoint.
        endpoint: String,
    },
    /// Binding the socket failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Resolved socket address.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Switching the socket to non-blocking accept mode failed.
    #[error("failed to configure listener: {source}")]
    NonBlocking {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Contract between the orchestrator and the RPC listener.
pub trait RpcServer: Send + Sync {
    /// Binds and serves until [`RpcServer::quit`]; blocks the calling thread.
    ///
    /// `on_ready` fires exactly once, after the socket is accepting.
    ///
    /// # Errors
    ///
    /// Returns [`RpcServerError`] when the endpoint cannot be bound; in that
    /// case `on_ready` is never invoked.
    fn serve(&self, on_ready: ReadyCallback) -> Result<(), RpcServerError>;

    /// Requests `serve` to return; idempotent, callable from any thread.
    fn quit(&self);

    /// Writes a read-only diagnostic description of the listener to `out`.
    ///
    /// # Errors
    ///
    /// Propagates write failures from `out`.
    fn print_server_info(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// Handles one accepted connection; runs on a dedicated routed thread.
pub trait ConnectionHandler: Send + Sync {
    /// Consumes the connection.
    fn handle(&self, stream: TcpStream);
}

/// Placeholder handler that drains the peer and drops the connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainHandler;

impl ConnectionHandler for DrainHandler {
    fn handle(&self, mut stream: TcpStream) {
        let mut sink = [0u8; 1024];
        while matches!(stream.read(&mut sink), Ok(read) if read > 0) {}
    }
}

/// Announces the service on the local network while it is reachable.
///
/// Name-service integration is out of scope; the default implementation
/// records announcements in the log so operators can see the decision.
pub trait ServiceAnnouncer: Send + Sync {
    /// Publishes `identity` as reachable at `endpoint`.
    fn announce(&self, identity: &str, endpoint: &BindEndpoint);

    /// Withdraws a previous announcement.
    fn revoke(&self);
}

/// Default announcer backed by `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

impl ServiceAnnouncer for LogAnnouncer {
    fn announce(&self, identity: &str, endpoint: &BindEndpoint) {
        info!(
            target: RPC_TARGET,
            identity,
            endpoint = %endpoint,
            "announcing service on local network"
        );
    }

    fn revoke(&self) {
        info!(target: RPC_TARGET, "withdrawing service announcement");
    }
}

/// Production TCP listener.
pub struct TcpRpcServer {
    identity: Option<String>,
    endpoint: BindEndpoint,
    shutdown: AtomicBool,
    state: Mutex<ListenerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    handler: Arc<dyn ConnectionHandler>,
    announcer: Arc<dyn ServiceAnnouncer>,
    sink: Arc<dyn FaultSink>,
    connection_seq: AtomicUsize,
}

impl std::fmt::Debug for TcpRpcServer {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("TcpRpcServer")
            .field("identity", &self.identity)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl TcpRpcServer {
    /// Builds an unstarted listener; nothing is bound until `serve`.
    #[must_use]
    pub fn new(
        identity: Option<String>,
        endpoint: BindEndpoint,
        handler: Arc<dyn ConnectionHandler>,
        announcer: Arc<dyn ServiceAnnouncer>,
        sink: Arc<dyn FaultSink>,
    ) -> Self {
        Self {
            identity,
            endpoint,
            shutdown: AtomicBool::new(false),
            state: Mutex::new(ListenerState::Unstarted),
            local_addr: Mutex::new(None),
            handler,
            announcer,
            sink,
            connection_seq: AtomicUsize::new(0),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ListenerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bound socket address, available once `serve` has bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self
            .local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn should_announce(&self) -> bool {
        self.identity.is_some() && !self.endpoint.is_loopback()
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn bind(&self) -> Result<TcpListener, RpcServerError> {
        let mut addrs = (self.endpoint.host.as_str(), self.endpoint.port)
            .to_socket_addrs()
            .map_err(|source| RpcServerError::Resolve {
                endpoint: self.endpoint.to_string(),
                source,
            })?;
        let addr = addrs.next().ok_or_else(|| RpcServerError::ResolveEmpty {
            endpoint: self.endpoint.to_string(),
        })?;
        TcpListener::bind(addr).map_err(|source| RpcServerError::Bind { addr, source })
    }

    fn accept_loop(&self, listener: &TcpListener) {
        let mut last_error = None::<io::ErrorKind>;
        while !self.shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    last_error = None;
                    debug!(target: RPC_TARGET, peer = %peer, "rpc connection accepted");
                    self.dispatch(stream);
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(
                            target: RPC_TARGET,
                            error = %error,
                            "rpc accept error"
                        );
                    }
                    last_error = Some(kind);
                    thread::sleep(ERROR_BACKOFF);
                }
            }
        }
    }

    fn dispatch(&self, stream: TcpStream) {
        if let Err(error) = stream.set_nonblocking(false) {
            warn!(
                target: RPC_TARGET,
                error = %error,
                "failed to configure accepted connection"
            );
            return;
        }
        let seq = self.connection_seq.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::clone(&self.handler);
        let spawned = crate::fault::spawn_routed(
            &format!("rpc-conn-{seq}"),
            Arc::clone(&self.sink),
            move || handler.handle(stream),
        );
        if let Err(error) = spawned {
            warn!(
                target: RPC_TARGET,
                error = %error,
                "failed to spawn connection thread"
            );
        }
    }
}

impl RpcServer for TcpRpcServer {
    fn serve(&self, on_ready: ReadyCallback) -> Result<(), RpcServerError> {
        let announced = self.should_announce();
        if announced
            && let Some(identity) = self.identity.as_deref()
        {
            self.announcer.announce(identity, &self.endpoint);
        }

        let prepared = self.bind().and_then(|listener| {
            listener
                .set_nonblocking(true)
                .map_err(|source| RpcServerError::NonBlocking { source })?;
            Ok(listener)
        });
        let listener = match prepared {
            Ok(listener) => listener,
            Err(source) => {
                if announced {
                    self.announcer.revoke();
                }
                return Err(source);
            }
        };
        if let Ok(addr) = listener.local_addr() {
            *self
                .local_addr
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(addr);
        }
        self.set_state(ListenerState::Listening);
        info!(
            target: RPC_TARGET,
            endpoint = %self.endpoint,
            "rpc listener accepting connections"
        );

        on_ready();
        self.accept_loop(&listener);

        self.set_state(ListenerState::Stopped);
        if announced {
            self.announcer.revoke();
        }
        info!(target: RPC_TARGET, "rpc listener stopped");
        Ok(())
    }

    fn quit(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn print_server_info(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "RPC port : {}", self.endpoint.port)?;
        if self.should_announce() {
            writeln!(out, "Announcing service on local network")?;
        }
        out.flush()
    }
}
