mod common;

mod breakpoints;
mod modules;

use crate::common::{MockServer, MockState, PID};
use dbgsrv_client::{ClientConfig, Error, RemoteDebugger};
use serial_test::serial;
use std::mem;
use std::net::TcpListener;

#[test]
#[serial]
fn test_connect_timeout() {
    // take a free port and release it, nobody listens there
    let addr = TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let config = ClientConfig {
        connect_timeout_ms: 300,
        connect_retry_ms: 50,
        ..ClientConfig::with_address(addr)
    };

    let err = RemoteDebugger::connect(config).err().unwrap();
    assert!(matches!(err, Error::ConnectionTimeout { .. }));
    assert!(err.is_fatal());
    assert!(err.to_string().contains("start the debug server"));
}

#[test]
fn test_process_list_without_attach() {
    let server = MockServer::start(MockState::default());
    let debugger = server.connect();

    let processes = debugger.process_list().unwrap();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[0].pid, PID);
    assert_eq!(processes[0].name, "app.exe");
    assert_eq!(processes[1].name, "System");
    assert!(!debugger.is_attached());
}

#[test]
fn test_attach_suspend_resume() {
    let server = MockServer::start(MockState::default());
    let debugger = server.connect();
    assert!(!debugger.is_suspended());

    debugger.attach(PID).unwrap();
    assert!(debugger.is_attached());
    assert!(debugger.is_suspended());
    assert_eq!(debugger.pid(), Some(PID));

    assert!(matches!(debugger.suspend(), Err(Error::AlreadySuspended)));
    assert!(matches!(debugger.attach(PID), Err(Error::AlreadyAttached)));

    debugger.resume().unwrap();
    assert!(!debugger.is_suspended());
    assert!(matches!(debugger.resume(), Err(Error::NotSuspended)));

    debugger.suspend().unwrap();
    assert!(debugger.is_suspended());

    debugger.process_list().unwrap();
    assert_eq!(
        server.commands(),
        vec!["attach", "resume", "suspend", "proclist"]
    );
}

#[test]
fn test_attach_failed() {
    let server = MockServer::start(MockState {
        attach_ok: false,
        ..Default::default()
    });
    let debugger = server.connect();

    assert!(matches!(debugger.attach(PID), Err(Error::AttachFailed(PID))));
    assert!(!debugger.is_attached());
    assert!(matches!(debugger.suspend(), Err(Error::NotAttached)));
}

#[test]
fn test_detach_when_detached_is_local() {
    let server = MockServer::start(MockState::default());
    let debugger = server.connect();

    assert!(!debugger.detach().unwrap());
    debugger.process_list().unwrap();
    assert_eq!(server.commands(), vec!["proclist"]);
}

#[test]
fn test_detach_and_reattach() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();
    debugger.set_breakpoint(0x1010).unwrap();

    assert!(debugger.detach().unwrap());
    assert!(!debugger.is_attached());
    assert!(!debugger.is_suspended());
    assert_eq!(debugger.pid(), None);
    assert!(debugger.breakpoints().is_empty());
    assert!(matches!(debugger.read_memory(0x1000, 1), Err(Error::NotAttached)));

    debugger.attach(PID).unwrap();
    assert!(!debugger.is_breakpoint_set(0x1010));
    assert!(debugger.is_suspended());
}

#[test]
fn test_drop_detaches() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();
    mem::drop(debugger);

    assert!(server.wait_for("detach"));
}
