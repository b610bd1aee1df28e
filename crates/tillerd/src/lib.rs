//! Lifecycle orchestration for the tiller control-runtime service.
//!
//! The daemon brings up three concurrently executing contexts in a strict,
//! deadlock-free order: the primary worker loop on the calling thread, the
//! RPC listener thread, and, when the auxiliary interface is enabled, a
//! reactor thread hosting the web endpoint and network client. Startup uses
//! one-shot rendezvous latches so each dependent thread proceeds only once
//! its dependency has reached a specific milestone, and shutdown follows a
//! fixed sequence so in-flight traffic is never starved of the engine it
//! references.
//!
//! External observers rely on two contracts: every thread fault lands in one
//! diagnostic sink, and a single stdout line carrying the working directory
//! marks the moment the runtime accepts connections.

pub mod auxiliary;
pub mod engine;
pub mod extensions;
pub mod fault;
mod orchestrator;
pub mod psk;
pub mod reactor;
pub mod rendezvous;
pub mod rpc;
pub mod shutdown;
pub mod status;
mod telemetry;
pub mod vars;
pub mod worker;

pub use orchestrator::{
    Collaborators, EngineSeed, InitError, READY_LINE_PREFIX, RpcSeed, RunError,
    ServiceOrchestrator,
};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};

#[cfg(test)]
mod tests;
