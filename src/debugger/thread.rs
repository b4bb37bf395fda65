use crate::debugger::error::Error;
use crate::debugger::register::RegisterMap;
use crate::debugger::wire::transport::Connection;
use crate::weak_error;
use log::debug;
use once_cell::sync::OnceCell;
use std::fmt::{Display, Formatter};

/// Offset of the thread id inside the thread information block.
pub const TIB_THREAD_ID_OFFSET: u64 = 0x24;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ThreadHandle {
    /// Handle value read from target memory, it belongs to the target process
    /// and must be duplicated by the server before use.
    Duplicated { handle_addr: u64, handle: u64 },
    /// Handle from `threadlist` or a debug event, usable as is.
    Direct { handle: u64 },
}

/// Reference to a thread of the attached process.
#[derive(Clone, Debug)]
pub struct ThreadRef {
    handle: ThreadHandle,
    native_id: OnceCell<u32>,
}

impl PartialEq for ThreadRef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for ThreadRef {}

impl ThreadRef {
    pub fn direct(handle: u64) -> Self {
        Self {
            handle: ThreadHandle::Direct { handle },
            native_id: OnceCell::new(),
        }
    }

    pub fn duplicated(handle_addr: u64, handle: u64) -> Self {
        Self {
            handle: ThreadHandle::Duplicated {
                handle_addr,
                handle,
            },
            native_id: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> ThreadHandle {
        self.handle
    }

    /// Handle value as known by the target process.
    pub fn handle(&self) -> u64 {
        match self.handle {
            ThreadHandle::Duplicated { handle, .. } => handle,
            ThreadHandle::Direct { handle } => handle,
        }
    }

    pub fn needs_duplication(&self) -> bool {
        matches!(self.handle, ThreadHandle::Duplicated { .. })
    }

    /// Native thread id if it was already fetched.
    pub fn cached_native_id(&self) -> Option<u32> {
        self.native_id.get().copied()
    }

    pub(crate) fn cache_native_id(&self, id: u32) -> u32 {
        *self.native_id.get_or_init(|| id)
    }
}

impl Display for ThreadRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.handle {
            ThreadHandle::Duplicated {
                handle_addr,
                handle,
            } => write!(f, "thread {handle:#x} (from {handle_addr:#x})"),
            ThreadHandle::Direct { handle } => write!(f, "thread {handle:#x}"),
        }
    }
}

/// Segment descriptor table entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct LdtEntry {
    pub limit_low: u16,
    pub base_low: u16,
    pub base_mid: u8,
    pub flags1: u8,
    pub flags2: u8,
    pub base_hi: u8,
}

impl LdtEntry {
    /// Build entry from `selectorentry` response fields, in wire order:
    /// limit low, base low, base mid, flags1, flags2, base high.
    pub fn from_fields(fields: [u64; 6]) -> Self {
        Self {
            limit_low: fields[0] as u16,
            base_low: fields[1] as u16,
            base_mid: fields[2] as u8,
            flags1: fields[3] as u8,
            flags2: fields[4] as u8,
            base_hi: fields[5] as u8,
        }
    }

    pub fn base(&self) -> u32 {
        self.base_low as u32 | (self.base_mid as u32) << 16 | (self.base_hi as u32) << 24
    }

    /// Segment limit, granularity bit is not applied.
    pub fn limit(&self) -> u32 {
        self.limit_low as u32 | ((self.flags2 & 0x0f) as u32) << 16
    }
}

/// Run `op` with a handle usable by the server. Duplicates the handle first if needed
/// and closes the duplicate afterward, whatever `op` returns.
/// `Ok(None)` from `op` means the server rejects the operation.
fn with_effective_handle<T>(
    conn: &mut Connection,
    thread: &ThreadRef,
    what: &str,
    op: impl FnOnce(&mut Connection, u64) -> Result<Option<T>, Error>,
) -> Result<T, Error> {
    let original = thread.handle();
    let effective = if thread.needs_duplication() {
        conn.duplicate_handle(original)?.ok_or_else(|| {
            Error::RemoteOperationFailed(format!("duplicate thread handle {original:#x}"))
        })?
    } else {
        original
    };

    let result = op(conn, effective);

    // a broken stream gets no more commands
    if thread.needs_duplication() && !matches!(result, Err(Error::Protocol(_))) {
        weak_error!(conn.close_handle(effective), "close duplicated handle:");
    }

    match result? {
        Some(value) => Ok(value),
        None if thread.needs_duplication() => Err(Error::RemoteOperationFailed(format!(
            "{what} for thread handle {effective:#x} (duplicate of {original:#x})"
        ))),
        None => Err(Error::RemoteOperationFailed(format!(
            "{what} for thread handle {effective:#x}"
        ))),
    }
}

/// Fetch integer registers of a thread.
pub(crate) fn get_registers(conn: &mut Connection, thread: &ThreadRef) -> Result<RegisterMap, Error> {
    with_effective_handle(conn, thread, "get thread context", |conn, handle| {
        Ok(conn.get_context(handle)?.map(|words| RegisterMap::from_native(&words)))
    })
}

/// Replace integer registers of a thread.
pub(crate) fn set_registers(
    conn: &mut Connection,
    thread: &ThreadRef,
    registers: &RegisterMap,
) -> Result<(), Error> {
    let words = registers.to_native();
    with_effective_handle(conn, thread, "set thread context", |conn, handle| {
        Ok(conn.set_context(handle, &words)?.then_some(()))
    })
}

pub(crate) fn selector_entry(
    conn: &mut Connection,
    thread: &ThreadRef,
    selector: u16,
) -> Result<LdtEntry, Error> {
    let entry = with_effective_handle(conn, thread, "get selector entry", |conn, handle| {
        conn.selector_entry(handle, selector)
    })?;
    debug!(target: "debugger", "{thread}: selector {selector:#x} base {:#x}", entry.base());
    Ok(entry)
}
