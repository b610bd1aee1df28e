//! End-to-end lifecycle behaviour: startup rendezvous, readiness contract,
//! shutdown ordering, degraded auxiliary paths, and fault isolation.

use std::sync::Arc;

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

use tiller_config::ServiceConfig;

use crate::auxiliary::SystemAuxiliary;
use crate::engine::Engine;
use crate::extensions::{Extension, ExtensionContext, ExtensionError};
use crate::rpc::RpcServer;
use crate::shutdown::ShutdownStep;
use crate::status::DetachedLauncher;
use crate::{Collaborators, READY_LINE_PREFIX, ServiceOrchestrator};

use super::support::{
    ContractOutput, Event, EventLog, FakeRpcBehaviour, FakeRpcServer, RecordingEngine,
    RecordingFaultSink, RecordingShutdownObserver,
};

fn utf8_dir(dir: &TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp path")
}

fn test_config(dir: &TempDir) -> ServiceConfig {
    ServiceConfig {
        workdir: utf8_dir(dir).join("runtime"),
        web_interface: false,
        web_port: None,
        ..ServiceConfig::default()
    }
}

fn test_collaborators(
    log: &EventLog,
    rpc_behaviour: FakeRpcBehaviour,
    engine_fails_stop: bool,
) -> Collaborators {
    let engine_log = log.clone();
    let rpc_log = log.clone();
    Collaborators {
        sink: Arc::new(RecordingFaultSink::new(log.clone())),
        launcher: Arc::new(DetachedLauncher),
        auxiliary: Arc::new(SystemAuxiliary::new()),
        engine_factory: Box::new(move |_seed| {
            let engine = if engine_fails_stop {
                RecordingEngine::failing_stop(engine_log)
            } else {
                RecordingEngine::new(engine_log)
            };
            Arc::new(engine) as Arc<dyn Engine>
        }),
        rpc_factory: Box::new(move |_seed| {
            Arc::new(FakeRpcServer::new(rpc_log, rpc_behaviour)) as Arc<dyn RpcServer>
        }),
        shutdown_observer: Arc::new(RecordingShutdownObserver::new(log.clone())),
        extra_extensions: Vec::new(),
    }
}

/// Queues a stop request behind the first worker job, so `run` performs a
/// complete startup immediately followed by a clean shutdown.
fn stop_after_startup(orchestrator: &ServiceOrchestrator) {
    let handle = orchestrator.worker();
    let stopper = handle.clone();
    handle.defer(move || stopper.request_stop());
}

fn run_full_cycle(config: ServiceConfig, log: &EventLog, rpc: FakeRpcBehaviour) -> ContractOutput {
    let orchestrator = ServiceOrchestrator::init_with(config, test_collaborators(log, rpc, false))
        .expect("init should succeed");
    stop_after_startup(&orchestrator);
    let mut output = ContractOutput::new(log.clone());
    let _code = orchestrator.run_with_output(&mut output);
    output
}

#[rstest]
fn readiness_line_is_emitted_once_after_rpc_ready_and_before_autoload() {
    let dir = TempDir::new().expect("temp dir");
    let log = EventLog::default();
    let output = run_full_cycle(test_config(&dir), &log, FakeRpcBehaviour::Normal);

    let ready_lines = output
        .rendered()
        .lines()
        .filter(|line| line.contains(READY_LINE_PREFIX))
        .count();
    assert_eq!(ready_lines, 1, "exactly one readiness line");
    assert_eq!(log.count_of(&Event::ReadyLineWritten), 1);

    assert!(log.index_of(&Event::RpcReady) < log.index_of(&Event::ReadyLineWritten));
    assert!(log.index_of(&Event::ReadyLineWritten) < log.index_of(&Event::AutoLoad(false)));
}

#[rstest]
fn readiness_line_carries_the_working_directory() {
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(&dir);
    let workdir = config.workdir.clone();
    let log = EventLog::default();
    let output = run_full_cycle(config, &log, FakeRpcBehaviour::Normal);

    let rendered = output.rendered();
    assert!(
        rendered.contains(&format!("{READY_LINE_PREFIX}{workdir}")),
        "readiness line must contain the resolved working directory: {rendered}"
    );
}

#[rstest]
#[case::engine_stop_succeeds(false)]
#[case::engine_stop_fails(true)]
fn shutdown_steps_run_in_fixed_order(#[case] engine_fails_stop: bool) {
    let dir = TempDir::new().expect("temp dir");
    let log = EventLog::default();
    let orchestrator = ServiceOrchestrator::init_with(
        test_config(&dir),
        test_collaborators(&log, FakeRpcBehaviour::Normal, engine_fails_stop),
    )
    .expect("init should succeed");
    stop_after_startup(&orchestrator);
    let mut output = ContractOutput::new(log.clone());
    let _code = orchestrator.run_with_output(&mut output);

    let quit = log.index_of(&Event::Step(ShutdownStep::RpcQuit));
    let join = log.index_of(&Event::Step(ShutdownStep::RpcJoin));
    let stop = log.index_of(&Event::Step(ShutdownStep::EngineStop));
    let unload = log.index_of(&Event::Step(ShutdownStep::EngineUnload));
    assert!(quit < join && join < stop && stop < unload);

    // The engine observed the same order, even when the stop step failed.
    assert!(log.index_of(&Event::EngineStop) < log.index_of(&Event::EngineUnload));
}

#[rstest]
fn auxiliary_reactor_stops_last() {
    let dir = TempDir::new().expect("temp dir");
    let config = ServiceConfig {
        web_interface: true,
        web_port: None,
        ..test_config(&dir)
    };
    let log = EventLog::default();
    let orchestrator = ServiceOrchestrator::init_with(
        config,
        test_collaborators(&log, FakeRpcBehaviour::Normal, false),
    )
    .expect("init should succeed");
    assert!(orchestrator.auxiliary_enabled());
    stop_after_startup(&orchestrator);
    let mut output = ContractOutput::new(log.clone());
    let _code = orchestrator.run_with_output(&mut output);

    let unload = log.index_of(&Event::Step(ShutdownStep::EngineUnload));
    let reactor = log.index_of(&Event::Step(ShutdownStep::ReactorStop));
    assert!(unload < reactor, "reactor must stop after engine teardown");
}

#[rstest]
fn failed_client_preparation_degrades_to_auxiliary_disabled() {
    let dir = TempDir::new().expect("temp dir");
    let config = ServiceConfig {
        web_interface: true,
        client_conf: Some(utf8_dir(&dir).join("missing-client.conf")),
        ..test_config(&dir)
    };
    let log = EventLog::default();
    let orchestrator = ServiceOrchestrator::init_with(
        config,
        test_collaborators(&log, FakeRpcBehaviour::Normal, false),
    )
    .expect("degraded auxiliary must not abort init");
    assert!(!orchestrator.auxiliary_enabled());

    stop_after_startup(&orchestrator);
    let mut output = ContractOutput::new(log.clone());
    let _code = orchestrator.run_with_output(&mut output);

    assert_eq!(log.count_of(&Event::ReadyLineWritten), 1);
    assert_eq!(log.count_of(&Event::Step(ShutdownStep::ReactorStop)), 0);
}

#[rstest]
fn web_endpoint_address_is_published_in_runtime_vars() {
    let dir = TempDir::new().expect("temp dir");
    let config = ServiceConfig {
        web_interface: true,
        web_port: Some(0),
        endpoint: tiller_config::BindEndpoint::new("127.0.0.1", 0),
        ..test_config(&dir)
    };
    let log = EventLog::default();
    let orchestrator = ServiceOrchestrator::init_with(
        config,
        test_collaborators(&log, FakeRpcBehaviour::Normal, false),
    )
    .expect("init should succeed");

    let website = orchestrator.vars().get("website");
    assert!(
        website.is_some_and(|address| address.contains("127.0.0.1")),
        "web endpoint address must be exposed to runtime vars"
    );
}

struct SerialNumberExtension;

impl Extension for SerialNumberExtension {
    fn name(&self) -> &str {
        "serial-number"
    }

    fn apply(&self, context: &mut ExtensionContext<'_>) -> Result<(), ExtensionError> {
        context.override_identity("serial-0042");
        Ok(())
    }
}

#[rstest]
fn extension_identity_override_reaches_secret_provisioning() {
    let dir = TempDir::new().expect("temp dir");
    let psk_path = utf8_dir(&dir).join("service.psk");
    let config = ServiceConfig {
        identity: Some("from-cli".to_owned()),
        psk_path: Some(psk_path.clone()),
        ..test_config(&dir)
    };

    let log = EventLog::default();
    let mut collaborators = test_collaborators(&log, FakeRpcBehaviour::Normal, false);
    collaborators.extra_extensions.push(Box::new(SerialNumberExtension));

    let orchestrator = ServiceOrchestrator::init_with(config, collaborators)
        .expect("init should succeed");
    assert_eq!(orchestrator.identity(), Some("serial-0042"));

    let secret = std::fs::read_to_string(&psk_path).expect("secret file");
    assert!(
        secret.starts_with("serial-0042:"),
        "provisioning must use the overridden identity, not the CLI one"
    );
}

#[rstest]
fn rpc_bind_failure_withholds_readiness_and_keeps_the_service_alive() {
    let dir = TempDir::new().expect("temp dir");
    let log = EventLog::default();
    let output = run_full_cycle(test_config(&dir), &log, FakeRpcBehaviour::FailBeforeReady);

    assert!(!output.rendered().contains(READY_LINE_PREFIX));
    assert_eq!(log.count_of(&Event::ReadyLineWritten), 0);

    let events = log.events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Fault(fault) if fault.starts_with("rpc:"))),
        "serve failure must reach the fault sink: {events:?}"
    );
    // The worker loop keeps running: the program still auto-loads and the
    // shutdown sequence still completes.
    assert_eq!(log.count_of(&Event::AutoLoad(false)), 1);
    assert!(log.index_of(&Event::Step(ShutdownStep::EngineUnload)) > 0);
}

#[rstest]
fn panic_in_serve_loop_is_isolated_from_the_worker_loop() {
    let dir = TempDir::new().expect("temp dir");
    let log = EventLog::default();
    let output = run_full_cycle(test_config(&dir), &log, FakeRpcBehaviour::PanicAfterReady);

    // Readiness was reached before the fault, so the contract line exists.
    assert!(output.rendered().contains(READY_LINE_PREFIX));

    let events = log.events();
    assert!(
        events
            .iter()
            .any(|event| matches!(event, Event::Fault(fault) if fault.contains("serve loop exploded"))),
        "panic must be routed to the fault sink: {events:?}"
    );
    // The calling thread survived and completed the full shutdown sequence.
    assert_eq!(log.count_of(&Event::AutoLoad(false)), 1);
    assert_eq!(log.count_of(&Event::Step(ShutdownStep::EngineUnload)), 1);
}

#[rstest]
fn workdir_is_created_when_absent() {
    let dir = TempDir::new().expect("temp dir");
    let config = test_config(&dir);
    let workdir = config.workdir.clone();
    assert!(!workdir.as_std_path().exists());

    let log = EventLog::default();
    let _orchestrator = ServiceOrchestrator::init_with(
        config,
        test_collaborators(&log, FakeRpcBehaviour::Normal, false),
    )
    .expect("init should succeed");
    assert!(workdir.as_std_path().is_dir());
}
