//! Pre-shared-key provisioning for the secure transport channel.
//!
//! The transport layer authenticates peers with a pre-shared key filed under
//! the service identity. Provisioning is idempotent: an existing key whose
//! identity matches is left untouched; a missing or mismatched file is
//! (re)written with fresh OS entropy. The orchestrator runs this only after
//! extensions have had their chance to override the identity.

use std::fmt::Write as _;
use std::fs;
use std::io;

use camino::Utf8Path;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;
use tracing::{debug, info};

const PSK_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::psk");
const SECRET_BYTES: usize = 32;

/// Errors raised while provisioning the shared secret.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The key file exists but could not be read.
    #[error("failed to read secret file '{path}': {source}")]
    Read {
        /// Secret file path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The parent directory could not be created.
    #[error("failed to prepare secret directory '{path}': {source}")]
    Directory {
        /// Directory path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing the key file failed.
    #[error("failed to write secret file '{path}': {source}")]
    Write {
        /// Secret file path.
        path: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Ensures a pre-shared key exists for `identity` at `path`.
///
/// The file holds a single `identity:hex-secret` line. A matching file is a
/// no-op; anything else is replaced, which covers both first provisioning
/// and an identity override performed by an extension.
///
/// # Errors
///
/// Returns [`ProvisionError`] when the file or its directory cannot be read
/// or written.
pub fn ensure_shared_secret(identity: &str, path: &Utf8Path) -> Result<(), ProvisionError> {
    match fs::read_to_string(path) {
        Ok(existing) => {
            if stored_identity(&existing) == Some(identity) {
                debug!(
                    target: PSK_TARGET,
                    identity,
                    path = %path,
                    "pre-shared key already provisioned"
                );
                return Ok(());
            }
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(ProvisionError::Read {
                path: path.to_string(),
                source,
            });
        }
    }

    if let Some(parent) = path.parent().filter(|parent| !parent.as_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ProvisionError::Directory {
            path: parent.to_string(),
            source,
        })?;
    }

    let line = format!("{identity}:{}\n", fresh_secret());
    write_restricted(path, line.as_bytes()).map_err(|source| ProvisionError::Write {
        path: path.to_string(),
        source,
    })?;
    info!(
        target: PSK_TARGET,
        identity,
        path = %path,
        "pre-shared key provisioned"
    );
    Ok(())
}

fn stored_identity(contents: &str) -> Option<&str> {
    contents.lines().next()?.split_once(':').map(|(id, _)| id)
}

fn fresh_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    let mut rendered = String::with_capacity(SECRET_BYTES * 2);
    for byte in bytes {
        let _ = write!(rendered, "{byte:02x}");
    }
    rendered
}

#[cfg(unix)]
fn write_restricted(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    use std::io::Write as _;
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_restricted(path: &Utf8Path, contents: &[u8]) -> io::Result<()> {
    fs::write(path, contents)
}
