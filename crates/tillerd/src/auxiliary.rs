//! Auxiliary interface: web endpoint and network client registration.
//!
//! Everything in this module is a degraded-feature path: a failure is
//! reported to the caller, logged, and the service starts without the
//! affected feature. Serving actual web content and the client's pub/sub
//! protocol are external concerns; the daemon's responsibility ends at
//! claiming the endpoint, exposing its address, and wiring the client to
//! the secret material and web handle it needs.

use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};

use tiller_config::BindEndpoint;

const AUX_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::aux");

/// Errors raised by auxiliary registration; always treated as degradation.
#[derive(Debug, Error)]
pub enum AuxError {
    /// The client configuration file is absent or unreadable.
    #[error("client configuration '{path}' is not readable: {source}")]
    ClientConf {
        /// Configured path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The web endpoint host failed to resolve.
    #[error("failed to resolve web endpoint '{endpoint}': {source}")]
    Resolve {
        /// Configured endpoint.
        endpoint: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },
    /// The web endpoint host resolved to no usable address.
    #[error("web endpoint '{endpoint}' resolved to no address")]
    ResolveEmpty {
        /// Configured endpoint.
        endpoint: String,
    },
    /// Binding the web endpoint failed.
    #[error("failed to bind web endpoint {addr}: {source}")]
    Bind {
        /// Resolved socket address.
        addr: SocketAddr,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Claimed web endpoint; dropping the handle releases the socket.
#[derive(Debug, Clone)]
pub struct WebHandle {
    address: SocketAddr,
    _listener: Arc<TcpListener>,
}

impl WebHandle {
    /// Address the endpoint is bound to.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

/// Client component prepared during `init`, before registration.
#[derive(Debug, Clone)]
pub struct PreparedClient {
    workdir: Utf8PathBuf,
    conf: Option<Utf8PathBuf>,
}

impl PreparedClient {
    /// Configuration file the client was prepared with, if any.
    #[must_use]
    pub fn conf(&self) -> Option<&Utf8Path> {
        self.conf.as_deref()
    }
}

/// Auxiliary subsystem operations the orchestrator drives.
pub trait AuxiliaryBackend: Send + Sync {
    /// Makes the working directory visible to the subsystem and prepares
    /// the optional network client component.
    ///
    /// # Errors
    ///
    /// Returns [`AuxError`] when the client configuration is unreadable;
    /// the caller degrades to "client disabled".
    fn prepare_client(
        &self,
        workdir: &Utf8Path,
        conf: Option<&Utf8Path>,
    ) -> Result<PreparedClient, AuxError>;

    /// Claims the web endpoint and returns its handle.
    ///
    /// # Errors
    ///
    /// Returns [`AuxError`] when the endpoint cannot be bound; the caller
    /// degrades to "web endpoint disabled".
    fn register_web_endpoint(&self, endpoint: &BindEndpoint) -> Result<WebHandle, AuxError>;

    /// Wires the prepared client to the secret material and web handle.
    ///
    /// # Errors
    ///
    /// Returns [`AuxError`] when registration fails; the caller degrades to
    /// "client disabled".
    fn register_client(
        &self,
        client: &PreparedClient,
        secret_path: Option<&Utf8Path>,
        web: Option<&WebHandle>,
    ) -> Result<(), AuxError>;
}

/// Production backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAuxiliary;

impl SystemAuxiliary {
    /// Builds the production backend.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AuxiliaryBackend for SystemAuxiliary {
    fn prepare_client(
        &self,
        workdir: &Utf8Path,
        conf: Option<&Utf8Path>,
    ) -> Result<PreparedClient, AuxError> {
        if let Some(path) = conf {
            std::fs::metadata(path).map_err(|source| AuxError::ClientConf {
                path: path.to_owned(),
                source,
            })?;
        }
        debug!(
            target: AUX_TARGET,
            workdir = %workdir,
            conf = ?conf,
            "auxiliary client prepared"
        );
        Ok(PreparedClient {
            workdir: workdir.to_owned(),
            conf: conf.map(Utf8Path::to_owned),
        })
    }

    fn register_web_endpoint(&self, endpoint: &BindEndpoint) -> Result<WebHandle, AuxError> {
        let mut addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|source| AuxError::Resolve {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let addr = addrs.next().ok_or_else(|| AuxError::ResolveEmpty {
            endpoint: endpoint.to_string(),
        })?;
        let listener =
            TcpListener::bind(addr).map_err(|source| AuxError::Bind { addr, source })?;
        let address = listener.local_addr().unwrap_or(addr);
        info!(
            target: AUX_TARGET,
            address = %address,
            "web endpoint registered"
        );
        Ok(WebHandle {
            address,
            _listener: Arc::new(listener),
        })
    }

    fn register_client(
        &self,
        client: &PreparedClient,
        secret_path: Option<&Utf8Path>,
        web: Option<&WebHandle>,
    ) -> Result<(), AuxError> {
        info!(
            target: AUX_TARGET,
            workdir = %client.workdir,
            conf = ?client.conf,
            secret = ?secret_path,
            web = ?web.map(WebHandle::address),
            "auxiliary client registered"
        );
        Ok(())
    }
}
