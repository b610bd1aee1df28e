//! Status-observer specifications.
//!
//! Observers translate controlled-program state transitions into external
//! command invocations. The configuration layer only records *what* should
//! fire on *which* transition; the daemon builds the actual callbacks.

use serde::{Deserialize, Serialize};

/// Transition filter for a status observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverTrigger {
    /// Fire only when the program enters the started state.
    Started,
    /// Fire only when the program enters the stopped state.
    Stopped,
    /// Fire on every transition.
    Any,
}

/// An external command bound to a transition filter.
///
/// The command is a shell-style template; every `{}` placeholder is replaced
/// with the new state name before the command is split and launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusObserverSpec {
    /// Which transitions fire this observer.
    pub trigger: ObserverTrigger,
    /// Command template launched as a detached child process.
    pub command: String,
}

impl StatusObserverSpec {
    /// Builds a spec from a trigger and command template.
    #[must_use]
    pub fn new(trigger: ObserverTrigger, command: impl Into<String>) -> Self {
        Self {
            trigger,
            command: command.into(),
        }
    }
}
