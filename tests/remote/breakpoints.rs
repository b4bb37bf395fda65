use crate::common::{MockServer, MockState};
use dbgsrv_client::debugger::TRAP_OPCODE;
use dbgsrv_client::Error;

#[test]
fn test_set_and_clear_breakpoint() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();

    debugger.set_breakpoint(0x1010).unwrap();
    assert!(debugger.is_breakpoint_set(0x1010));
    assert_eq!(server.state().memory[&0x1010], TRAP_OPCODE);
    assert_eq!(debugger.read_memory(0x1010, 1).unwrap(), vec![TRAP_OPCODE]);

    debugger.clear_breakpoint(0x1010).unwrap();
    assert!(!debugger.is_breakpoint_set(0x1010));
    assert_eq!(server.state().memory[&0x1010], 0x10);
    assert_eq!(server.count("poke"), 2);
}

#[test]
fn test_duplicate_breakpoint() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();
    debugger.set_breakpoint(0x1010).unwrap();

    assert!(matches!(
        debugger.set_breakpoint(0x1010),
        Err(Error::DuplicateBreakpoint(0x1010))
    ));
    assert_eq!(server.count("poke"), 1);
    assert_eq!(debugger.breakpoints(), vec![0x1010]);
}

#[test]
fn test_clear_unknown_breakpoint() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();

    assert!(matches!(
        debugger.clear_breakpoint(0x1010),
        Err(Error::UnknownBreakpoint(0x1010))
    ));
    debugger.process_list().unwrap();
    assert_eq!(server.commands(), vec!["attach", "proclist"]);
}

#[test]
fn test_breakpoint_on_unmapped_address() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();

    assert!(matches!(
        debugger.set_breakpoint(0x8000),
        Err(Error::UnmappedAddress(0x8000))
    ));
    assert!(!debugger.is_breakpoint_set(0x8000));
    assert_eq!(server.count("poke"), 0);
}

#[test]
fn test_breakpoint_list() {
    let server = MockServer::start(MockState::default());
    let debugger = server.attach();
    for addr in [0x1030, 0x1010, 0x2000] {
        debugger.set_breakpoint(addr).unwrap();
    }
    assert_eq!(debugger.breakpoints(), vec![0x1010, 0x1030, 0x2000]);

    debugger.clear_breakpoint(0x1030).unwrap();
    assert_eq!(debugger.breakpoints(), vec![0x1010, 0x2000]);
}
