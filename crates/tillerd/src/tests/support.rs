//! Recording doubles shared by the lifecycle behaviour tests.

use std::io::{self, Write};
use std::sync::{Arc, Condvar, Mutex};

use crate::engine::{Engine, EngineError};
use crate::fault::{FaultSink, ThreadFault};
use crate::rpc::{ReadyCallback, RpcServer, RpcServerError};
use crate::shutdown::{ShutdownObserver, ShutdownStep};

/// Observable lifecycle events, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The fake RPC server entered `serve`.
    RpcServe,
    /// The fake RPC server reached the accepting milestone.
    RpcReady,
    /// `quit` was requested on the fake RPC server.
    RpcQuitRequested,
    /// The readiness line reached the output writer.
    ReadyLineWritten,
    /// The engine was asked to auto-load.
    AutoLoad(bool),
    /// The engine was asked to stop the program.
    EngineStop,
    /// The engine was asked to unload the program.
    EngineUnload,
    /// A shutdown step began.
    Step(ShutdownStep),
    /// A thread fault reached the sink.
    Fault(String),
}

/// Shared, thread-safe event journal.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn push(&self, event: Event) {
        self.events.lock().expect("event log lock").push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log lock").clone()
    }

    /// Index of the first occurrence of `event`, panicking when absent.
    pub fn index_of(&self, event: &Event) -> usize {
        let events = self.events();
        events
            .iter()
            .position(|candidate| candidate == event)
            .unwrap_or_else(|| panic!("event {event:?} not recorded in {events:?}"))
    }

    pub fn count_of(&self, event: &Event) -> usize {
        self.events()
            .iter()
            .filter(|candidate| *candidate == event)
            .count()
    }
}

/// Engine double recording calls; `fail_stop` makes `stop_program` fail.
#[derive(Debug)]
pub struct RecordingEngine {
    log: EventLog,
    fail_stop: bool,
}

impl RecordingEngine {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            fail_stop: false,
        }
    }

    pub fn failing_stop(log: EventLog) -> Self {
        Self {
            log,
            fail_stop: true,
        }
    }
}

impl Engine for RecordingEngine {
    fn auto_load(&self, autostart: bool) {
        self.log.push(Event::AutoLoad(autostart));
    }

    fn stop_program(&self) -> Result<(), EngineError> {
        self.log.push(Event::EngineStop);
        if self.fail_stop {
            return Err(EngineError::Stop {
                reason: "deliberate test failure".to_owned(),
            });
        }
        Ok(())
    }

    fn unload_program(&self) -> Result<(), EngineError> {
        self.log.push(Event::EngineUnload);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeRpcBehaviour {
    /// Signal ready, then serve until `quit`.
    Normal,
    /// Fail before ever signalling ready.
    FailBeforeReady,
    /// Signal ready, then panic inside the serve loop.
    PanicAfterReady,
}

/// RPC server double: no sockets, real blocking semantics.
#[derive(Debug)]
pub struct FakeRpcServer {
    log: EventLog,
    behaviour: FakeRpcBehaviour,
    quit: Mutex<bool>,
    condvar: Condvar,
}

impl FakeRpcServer {
    pub fn new(log: EventLog, behaviour: FakeRpcBehaviour) -> Self {
        Self {
            log,
            behaviour,
            quit: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl RpcServer for FakeRpcServer {
    fn serve(&self, on_ready: ReadyCallback) -> Result<(), RpcServerError> {
        self.log.push(Event::RpcServe);
        if self.behaviour == FakeRpcBehaviour::FailBeforeReady {
            return Err(RpcServerError::ResolveEmpty {
                endpoint: "fake:0".to_owned(),
            });
        }

        self.log.push(Event::RpcReady);
        on_ready();

        if self.behaviour == FakeRpcBehaviour::PanicAfterReady {
            panic!("serve loop exploded");
        }

        let mut quit = self.quit.lock().expect("quit lock");
        while !*quit {
            quit = self.condvar.wait(quit).expect("quit wait");
        }
        Ok(())
    }

    fn quit(&self) {
        self.log.push(Event::RpcQuitRequested);
        *self.quit.lock().expect("quit lock") = true;
        self.condvar.notify_all();
    }

    fn print_server_info(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(out, "RPC port : 0")
    }
}

/// Shutdown observer double.
#[derive(Debug)]
pub struct RecordingShutdownObserver {
    log: EventLog,
}

impl RecordingShutdownObserver {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl ShutdownObserver for RecordingShutdownObserver {
    fn step(&self, step: ShutdownStep) {
        self.log.push(Event::Step(step));
    }
}

/// Fault sink double.
#[derive(Debug)]
pub struct RecordingFaultSink {
    log: EventLog,
}

impl RecordingFaultSink {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }
}

impl FaultSink for RecordingFaultSink {
    fn thread_fault(&self, thread: &str, fault: &ThreadFault) {
        self.log
            .push(Event::Fault(format!("{thread}: {}", fault.description())));
    }
}

/// Output writer that journals the readiness line as it is written.
#[derive(Debug)]
pub struct ContractOutput {
    log: EventLog,
    buffer: Vec<u8>,
}

impl ContractOutput {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            buffer: Vec::new(),
        }
    }

    pub fn rendered(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }
}

impl Write for ContractOutput {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if String::from_utf8_lossy(bytes).contains(crate::READY_LINE_PREFIX) {
            self.log.push(Event::ReadyLineWritten);
        }
        self.buffer.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
