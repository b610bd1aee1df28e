//! Default values shared by the CLI and the daemon.

/// Default TCP port for the RPC listener.
pub const DEFAULT_RPC_PORT: u16 = 3000;

/// Default port for the auxiliary web endpoint.
pub const DEFAULT_WEB_PORT: u16 = 8009;

/// Default interface the listeners bind to.
pub const DEFAULT_BIND_ADDRESS: &str = "localhost";

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";
