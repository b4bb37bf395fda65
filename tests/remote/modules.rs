use crate::common::{MockServer, MockState, PID};
use dbgsrv_client::Error;
use std::sync::Arc;

fn server_with_libs() -> MockServer {
    let mut state = MockState::default();
    state.libs = vec![
        ("C:\\app\\App.exe".to_string(), 0x40_0000),
        ("C:\\WINNT\\system32\\ntdll.dll".to_string(), 0x7780_0000),
        ("C:\\app\\plugin.dll".to_string(), 0x1000_0000),
    ];
    MockServer::start(state)
}

#[test]
fn test_modules_are_resolved_lazily() {
    let server = server_with_libs();
    let debugger = server.attach();
    debugger.resume().unwrap();
    debugger.suspend().unwrap();
    debugger.process_list().unwrap();
    assert_eq!(server.count("libinfo"), 0);

    let modules = debugger.modules().unwrap();
    assert_eq!(modules.len(), 3);
    assert_eq!(modules[0].name(), "app.exe");
    assert_eq!(modules[1].path(), "c:\\winnt\\system32\\ntdll.dll");
    assert_eq!(modules[2].base(), 0x1000_0000);

    debugger.modules().unwrap();
    assert_eq!(server.count("libinfo"), 1);
}

#[test]
fn test_module_identity_across_suspension() {
    let server = server_with_libs();
    let debugger = server.attach();

    let app = debugger.module("APP.EXE").unwrap().unwrap();
    let ntdll = debugger.module("ntdll.dll").unwrap().unwrap();
    let plugin = debugger.module("plugin.dll").unwrap().unwrap();

    debugger.resume().unwrap();
    {
        let mut state = server.state();
        state.libs.retain(|(path, _)| !path.ends_with("plugin.dll"));
        state.libs[1].1 = 0x7790_0000;
        state.libs.push(("C:\\app\\other.dll".to_string(), 0x2000_0000));
    }
    debugger.suspend().unwrap();
    debugger.process_list().unwrap();
    assert_eq!(server.count("libinfo"), 2);

    assert!(Arc::ptr_eq(&app, &debugger.module("app.exe").unwrap().unwrap()));
    let new_ntdll = debugger.module("ntdll.dll").unwrap().unwrap();
    assert!(!Arc::ptr_eq(&ntdll, &new_ntdll));
    assert_eq!(new_ntdll.base(), 0x7790_0000);
    assert!(debugger.module("plugin.dll").unwrap().is_none());
    assert!(plugin.is_closed());
    assert_eq!(plugin.lookup("DllMain"), None);
    assert!(debugger.module("other.dll").unwrap().is_some());
    assert_eq!(debugger.modules().unwrap().len(), 3);
}

#[test]
fn test_symbol_lookup_misses() {
    let server = server_with_libs();
    let debugger = server.attach();

    assert_eq!(
        debugger.lookup_symbol("missing.dll", "DllMain").unwrap(),
        None
    );
    // image files are not present on this machine
    assert_eq!(
        debugger.lookup_symbol("ntdll.dll", "NtClose").unwrap(),
        None
    );
}

#[test]
fn test_modules_require_attach() {
    let server = server_with_libs();
    let debugger = server.connect();
    assert!(matches!(debugger.modules(), Err(Error::NotAttached)));
    assert!(matches!(
        debugger.lookup_symbol("ntdll.dll", "NtClose"),
        Err(Error::NotAttached)
    ));

    debugger.attach(PID).unwrap();
    assert_eq!(debugger.modules().unwrap().len(), 3);
    debugger.detach().unwrap();
    assert!(matches!(debugger.modules(), Err(Error::NotAttached)));

    debugger.attach(PID).unwrap();
    assert_eq!(debugger.modules().unwrap().len(), 3);
    assert_eq!(server.count("libinfo"), 2);
}
