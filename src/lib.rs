//! Client for a socket-based remote debug server.
//!
//! [`RemoteDebugger`] attaches to a process running on the server side, installs software
//! breakpoints, reads and writes memory through a page cache, accesses thread registers
//! and delivers debug events.

pub mod debugger;

pub use debugger::{ClientConfig, DebugEvent, Error, RemoteDebugger};
