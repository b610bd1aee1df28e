//! Startup extensions.
//!
//! Extensions run during `init`, before the engine exists, and may override
//! the service identity or populate the shared runtime variables, a device
//! used in the field to derive the identity from a serial number instead of
//! the command line. The capability surface is deliberately narrow: an
//! extension sees an [`ExtensionContext`], nothing else.
//!
//! Two forms exist: in-process [`Extension`] implementations registered by
//! embedders, and hook executables configured as (file, directory) pairs.
//! Hooks run with full trust and no sandboxing; a failing hook aborts
//! startup, because later steps may depend on its side effects.

use std::io;
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

use tiller_config::ExtensionSpec;

use crate::vars::RuntimeVars;

const EXTENSIONS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::extensions");

/// Mutable orchestrator state exposed to extensions.
#[derive(Debug)]
pub struct ExtensionContext<'a> {
    identity: &'a mut Option<String>,
    vars: &'a RuntimeVars,
}

impl<'a> ExtensionContext<'a> {
    /// Builds a context borrowing the orchestrator's state.
    #[must_use]
    pub fn new(identity: &'a mut Option<String>, vars: &'a RuntimeVars) -> Self {
        Self { identity, vars }
    }

    /// Currently configured service identity.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Replaces the service identity seen by all later startup steps.
    pub fn override_identity(&mut self, identity: impl Into<String>) {
        let identity = identity.into();
        info!(
            target: EXTENSIONS_TARGET,
            identity = %identity,
            "service identity overridden by extension"
        );
        *self.identity = Some(identity);
    }

    /// Shared runtime variables.
    #[must_use]
    pub fn vars(&self) -> &RuntimeVars {
        self.vars
    }
}

/// Errors raised while loading extensions; all are fatal to startup.
#[derive(Debug, Error)]
pub enum ExtensionError {
    /// The hook executable could not be started.
    #[error("extension '{name}' failed to run: {source}")]
    Run {
        /// Extension name.
        name: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The hook exited with a failure status.
    #[error("extension '{name}' exited with {status}")]
    Failed {
        /// Extension name.
        name: String,
        /// Rendered exit status.
        status: String,
    },
    /// The hook emitted output that is not valid UTF-8.
    #[error("extension '{name}' produced non-UTF-8 output")]
    Encoding {
        /// Extension name.
        name: String,
    },
    /// The hook emitted a directive the loader does not understand.
    #[error("extension '{name}' emitted unknown directive '{directive}'")]
    Directive {
        /// Extension name.
        name: String,
        /// Offending output line.
        directive: String,
    },
    /// An in-process extension reported a failure.
    #[error("extension '{name}' failed: {reason}")]
    Apply {
        /// Extension name.
        name: String,
        /// Extension-reported reason.
        reason: String,
    },
}

/// A startup extension.
pub trait Extension: Send {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Applies the extension's effects to the orchestrator state.
    ///
    /// # Errors
    ///
    /// Any error aborts startup.
    fn apply(&self, context: &mut ExtensionContext<'_>) -> Result<(), ExtensionError>;
}

/// Extension backed by a hook executable.
///
/// The hook runs to completion with its directory as the working directory.
/// Its stdout is interpreted line by line:
///
/// - `identity <value>` overrides the service identity,
/// - `set <key> <value>` writes a runtime variable,
/// - blank lines and lines starting with `#` are ignored.
///
/// Anything else, a non-zero exit, or a spawn failure aborts startup.
#[derive(Debug)]
pub struct HookExtension {
    spec: ExtensionSpec,
}

impl HookExtension {
    /// Wraps a configured hook spec.
    #[must_use]
    pub fn new(spec: ExtensionSpec) -> Self {
        Self { spec }
    }

    fn parse_output(
        &self,
        output: &str,
        context: &mut ExtensionContext<'_>,
    ) -> Result<(), ExtensionError> {
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(identity) = line.strip_prefix("identity ") {
                context.override_identity(identity.trim());
            } else if let Some(pair) = line.strip_prefix("set ") {
                let Some((key, value)) = pair.trim().split_once(' ') else {
                    return Err(ExtensionError::Directive {
                        name: self.spec.file.clone(),
                        directive: line.to_owned(),
                    });
                };
                context.vars().set(key.trim(), value.trim());
            } else {
                return Err(ExtensionError::Directive {
                    name: self.spec.file.clone(),
                    directive: line.to_owned(),
                });
            }
        }
        Ok(())
    }
}

impl Extension for HookExtension {
    fn name(&self) -> &str {
        &self.spec.file
    }

    fn apply(&self, context: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        let output = Command::new(self.spec.executable().as_std_path())
            .current_dir(self.spec.directory.as_std_path())
            .output()
            .map_err(|source| ExtensionError::Run {
                name: self.spec.file.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ExtensionError::Failed {
                name: self.spec.file.clone(),
                status: output.status.to_string(),
            });
        }
        let stdout = String::from_utf8(output.stdout).map_err(|_| ExtensionError::Encoding {
            name: self.spec.file.clone(),
        })?;
        self.parse_output(&stdout, context)
    }
}

/// Ordered extension loader.
#[derive(Default)]
pub struct ExtensionLoader {
    extensions: Vec<Box<dyn Extension>>,
}

impl std::fmt::Debug for ExtensionLoader {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ExtensionLoader")
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

impl ExtensionLoader {
    /// Builds a loader from configured hook specs.
    #[must_use]
    pub fn from_specs(specs: &[ExtensionSpec]) -> Self {
        Self {
            extensions: specs
                .iter()
                .cloned()
                .map(|spec| Box::new(HookExtension::new(spec)) as Box<dyn Extension>)
                .collect(),
        }
    }

    /// Appends an in-process extension after the configured hooks.
    pub fn push(&mut self, extension: Box<dyn Extension>) {
        self.extensions.push(extension);
    }

    /// Runs every extension in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Propagates the first [`ExtensionError`]; startup must abort.
    pub fn load(&self, context: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        for extension in &self.extensions {
            debug!(
                target: EXTENSIONS_TARGET,
                extension = extension.name(),
                "loading extension"
            );
            extension.apply(context)?;
        }
        Ok(())
    }
}
