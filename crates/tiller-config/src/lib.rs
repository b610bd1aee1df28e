//! Configuration surface shared by the tiller runtime daemon and its tests.
//!
//! The crate owns the command-line interface, the immutable [`ServiceConfig`]
//! captured at startup, and the small value types the daemon consumes:
//! bind endpoints, log settings, status-observer specs, and extension specs.
//! The daemon itself never parses arguments; it receives a fully resolved
//! configuration and treats it as read-only for the process lifetime.

mod cli;
mod defaults;
mod endpoint;
mod extension;
mod logging;
mod observer;

use camino::Utf8PathBuf;

pub use cli::{Cli, ConfigError};
pub use defaults::{
    DEFAULT_BIND_ADDRESS, DEFAULT_LOG_FILTER, DEFAULT_RPC_PORT, DEFAULT_WEB_PORT,
};
pub use endpoint::BindEndpoint;
pub use extension::{ExtensionSpec, ExtensionSpecError};
pub use logging::{LogFormat, LogFormatParseError, LogSettings};
pub use observer::{ObserverTrigger, StatusObserverSpec};

/// Immutable runtime configuration captured at construction.
///
/// Field semantics follow the service contract: `identity` is the name the
/// service registers secrets and announcements under (`None` disables both),
/// `workdir` must exist or be creatable before any other startup step runs,
/// and `web_port` being `None` means the web endpoint is disabled even when
/// the auxiliary interface itself is enabled.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service identity used for secret provisioning and announcement.
    pub identity: Option<String>,
    /// Working directory for the controlled program and its artefacts.
    pub workdir: Utf8PathBuf,
    /// Location of the pre-shared-key file; `None` disables provisioning.
    pub psk_path: Option<Utf8PathBuf>,
    /// Load and start the controlled program as soon as the runtime is ready.
    pub autostart: bool,
    /// Address and port the RPC listener binds to.
    pub endpoint: BindEndpoint,
    /// Whether the auxiliary interface (reactor thread, web, client) runs.
    pub web_interface: bool,
    /// Port for the auxiliary web endpoint; `None` means no web endpoint.
    pub web_port: Option<u16>,
    /// Auxiliary network client configuration file, if any.
    pub client_conf: Option<Utf8PathBuf>,
    /// Extension hooks executed during startup, in order.
    pub extensions: Vec<ExtensionSpec>,
    /// External commands fired on controlled-program state transitions.
    pub observers: Vec<StatusObserverSpec>,
    /// Log filter and output format for the telemetry subscriber.
    pub logging: LogSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            identity: None,
            workdir: Utf8PathBuf::from("."),
            psk_path: None,
            autostart: false,
            endpoint: BindEndpoint::new(DEFAULT_BIND_ADDRESS, DEFAULT_RPC_PORT),
            web_interface: true,
            web_port: Some(DEFAULT_WEB_PORT),
            client_conf: None,
            extensions: Vec::new(),
            observers: Vec::new(),
            logging: LogSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Parses the process arguments into a resolved configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when an extension path cannot be split into a
    /// (file, directory) pair or the working directory cannot be resolved.
    pub fn from_args() -> Result<Self, ConfigError> {
        cli::parse(std::env::args_os())
    }
}
