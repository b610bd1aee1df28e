//! Status-change dispatch to external observer commands.
//!
//! Each configured observer pairs a transition filter with a shell-style
//! command template. On a matching transition the template's `{}`
//! placeholders are replaced with the new state name, the result is split
//! into an argument vector, and the command is launched as a detached child
//! process. Exit status and output are never collected. Failures to render
//! or launch are logged and must never re-enter engine state reporting,
//! since that would amplify one broken observer into a fault storm.

use std::process::{Command, Stdio};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use tiller_config::{ObserverTrigger, StatusObserverSpec};

use crate::engine::{ProgramState, StatusCallback};

const STATUS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::status");

/// Errors raised while rendering or launching an observer command.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The rendered template is not valid shell-style syntax.
    #[error("observer command {command:?} failed to split: {source}")]
    Split {
        /// Rendered command template.
        command: String,
        /// Underlying parse error.
        #[source]
        source: shell_words::ParseError,
    },
    /// The rendered template produced no program to run.
    #[error("observer command {command:?} is empty after rendering")]
    Empty {
        /// Rendered command template.
        command: String,
    },
    /// Spawning the child process failed.
    #[error("observer command {program:?} failed to launch: {source}")]
    Launch {
        /// Program the launcher attempted to start.
        program: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Launches observer argument vectors as detached children.
pub trait CommandLauncher: Send + Sync {
    /// Starts `argv` without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Launch`] when the child cannot be spawned.
    fn launch(&self, argv: &[String]) -> Result<(), DispatchError>;
}

/// Production launcher backed by [`std::process::Command`].
///
/// The child inherits nothing: stdin, stdout, and stderr are all null, and
/// the handle is dropped immediately, detaching the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedLauncher;

impl CommandLauncher for DetachedLauncher {
    fn launch(&self, argv: &[String]) -> Result<(), DispatchError> {
        let (program, arguments) = argv.split_first().ok_or_else(|| DispatchError::Empty {
            command: String::new(),
        })?;
        Command::new(program)
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(drop)
            .map_err(|source| DispatchError::Launch {
                program: program.clone(),
                source,
            })
    }
}

fn trigger_matches(trigger: ObserverTrigger, state: ProgramState) -> bool {
    match trigger {
        ObserverTrigger::Any => true,
        ObserverTrigger::Started => state == ProgramState::Started,
        ObserverTrigger::Stopped => state == ProgramState::Stopped,
    }
}

fn dispatch(
    spec: &StatusObserverSpec,
    state: ProgramState,
    launcher: &dyn CommandLauncher,
) -> Result<(), DispatchError> {
    let rendered = spec.command.replace("{}", &state.to_string());
    let argv = shell_words::split(&rendered).map_err(|source| DispatchError::Split {
        command: rendered.clone(),
        source,
    })?;
    if argv.is_empty() {
        return Err(DispatchError::Empty { command: rendered });
    }
    debug!(
        target: STATUS_TARGET,
        state = %state,
        command = %rendered,
        "dispatching status observer"
    );
    launcher.launch(&argv)
}

/// Builds one status callback per observer spec.
///
/// The returned callbacks are handed to the engine at construction; each
/// fires independently, so one failing observer never suppresses another.
#[must_use]
pub fn build_observers(
    specs: &[StatusObserverSpec],
    launcher: Arc<dyn CommandLauncher>,
) -> Vec<StatusCallback> {
    specs
        .iter()
        .map(|spec| {
            let spec = spec.clone();
            let launcher = Arc::clone(&launcher);
            let callback: StatusCallback = Box::new(move |state| {
                if !trigger_matches(spec.trigger, state) {
                    return;
                }
                if let Err(error) = dispatch(&spec, state, launcher.as_ref()) {
                    warn!(
                        target: STATUS_TARGET,
                        error = %error,
                        "status observer failed; continuing"
                    );
                }
            });
            callback
        })
        .collect()
}
