use crate::debugger::thread::ThreadRef;
use crate::debugger::wire::codec::Decoder;
use std::io::{self, BufRead};

/// Debug event codes as reported by `pollevent`.
pub mod code {
    pub const EXCEPTION_DEBUG_EVENT: i64 = 1;
    pub const LOAD_DLL_DEBUG_EVENT: i64 = 6;
    pub const UNLOAD_DLL_DEBUG_EVENT: i64 = 7;

    pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
    pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
    pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
}

/// Asynchronous occurrence in the target process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Shared library loaded at `base`.
    LoadObjectLoad { thread: ThreadRef, base: u64 },
    /// Shared library previously loaded at `base` is unloaded.
    LoadObjectUnload { thread: ThreadRef, base: u64 },
    /// Memory access at `address` failed.
    AccessViolation {
        thread: ThreadRef,
        pc: u64,
        address: u64,
        was_write: bool,
    },
    /// Software breakpoint trap.
    Breakpoint { thread: ThreadRef, pc: u64 },
    /// Single step trap.
    SingleStep { thread: ThreadRef, pc: u64 },
    Unknown { thread: ThreadRef, detail: String },
}

impl DebugEvent {
    /// Decode event body following the positive `pollevent` flag.
    pub fn decode<R: BufRead>(decoder: &mut Decoder<R>) -> io::Result<Self> {
        let thread = ThreadRef::direct(decoder.address()?);
        let event_code = decoder.int()?;

        let event = match event_code {
            code::LOAD_DLL_DEBUG_EVENT => DebugEvent::LoadObjectLoad {
                thread,
                base: decoder.address()?,
            },
            code::UNLOAD_DLL_DEBUG_EVENT => DebugEvent::LoadObjectUnload {
                thread,
                base: decoder.address()?,
            },
            code::EXCEPTION_DEBUG_EVENT => {
                let exception = decoder.int()?;
                // signed 32-bit codes are accepted too
                let exception = u32::try_from(exception)
                    .or_else(|_| i32::try_from(exception).map(|code| code as u32))
                    .map_err(|_| {
                        io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("exception code {exception:#x} out of range"),
                        )
                    })?;
                let pc = decoder.address()?;
                match exception {
                    code::EXCEPTION_ACCESS_VIOLATION => {
                        let was_write = decoder.boolean()?;
                        let address = decoder.address()?;
                        DebugEvent::AccessViolation {
                            thread,
                            pc,
                            address,
                            was_write,
                        }
                    }
                    code::EXCEPTION_BREAKPOINT => DebugEvent::Breakpoint { thread, pc },
                    code::EXCEPTION_SINGLE_STEP => DebugEvent::SingleStep { thread, pc },
                    _ => DebugEvent::Unknown {
                        thread,
                        detail: format!("Exception {exception:#x} at PC {pc:#x}"),
                    },
                }
            }
            _ => DebugEvent::Unknown {
                thread,
                detail: format!("Debug event {event_code} occurred"),
            },
        };
        Ok(event)
    }

    /// Thread that caused the event.
    pub fn thread(&self) -> &ThreadRef {
        match self {
            DebugEvent::LoadObjectLoad { thread, .. }
            | DebugEvent::LoadObjectUnload { thread, .. }
            | DebugEvent::AccessViolation { thread, .. }
            | DebugEvent::Breakpoint { thread, .. }
            | DebugEvent::SingleStep { thread, .. }
            | DebugEvent::Unknown { thread, .. } => thread,
        }
    }

    /// Program counter at the moment of event, if the event has one.
    pub fn pc(&self) -> Option<u64> {
        match self {
            DebugEvent::AccessViolation { pc, .. }
            | DebugEvent::Breakpoint { pc, .. }
            | DebugEvent::SingleStep { pc, .. } => Some(*pc),
            _ => None,
        }
    }

    /// True if the event should be forwarded to the target's own exception handling.
    /// Breakpoint and single step traps are owned by the debugger.
    pub fn pass_on(&self) -> bool {
        !matches!(
            self,
            DebugEvent::Breakpoint { .. } | DebugEvent::SingleStep { .. }
        )
    }

    /// True if the event changes the set of loaded modules.
    pub fn is_module_event(&self) -> bool {
        matches!(
            self,
            DebugEvent::LoadObjectLoad { .. } | DebugEvent::LoadObjectUnload { .. }
        )
    }
}
