//! Bind endpoint for the daemon's network listeners.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address and port a listener binds to.
///
/// The host is kept as text so names such as `localhost` resolve at bind
/// time rather than at configuration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindEndpoint {
    /// Interface address or host name.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl BindEndpoint {
    /// Builds an endpoint from a host and port.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Returns `true` when the endpoint only serves the local machine.
    ///
    /// Announcement on the local network is pointless for loopback binds, so
    /// the RPC listener consults this before publishing the service.
    #[must_use]
    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "" | "localhost" | "127.0.0.1" | "::1")
    }
}

impl fmt::Display for BindEndpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.host, self.port)
    }
}
