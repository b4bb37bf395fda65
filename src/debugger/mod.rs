pub mod breakpoint;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod register;
pub mod registry;
pub mod thread;
pub mod wire;

pub use breakpoint::{TRAP_OPCODE, TRAP_WIDTH};
pub use config::{CacheConfig, ClientConfig};
pub use error::Error;
pub use event::DebugEvent;
pub use register::{Register, RegisterMap};
pub use registry::Module;
pub use thread::{LdtEntry, ThreadRef};
pub use wire::machine::MachineDescription;
pub use wire::proto::ProcessInfo;
pub use wire::transport::Connection;

use crate::debugger::breakpoint::{BreakpointTable, TargetMemory};
use crate::debugger::cache::PageCache;
use crate::debugger::registry::ModuleRegistry;
use crate::debugger::thread::TIB_THREAD_ID_OFFSET;
use crate::debugger::wire::proto::ReadResult;
use crate::weak_error;
use log::{debug, info};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Memory of an attached process, reads go through the page cache.
struct RemoteMemory<'a> {
    conn: &'a mut Connection,
    cache: &'a mut PageCache,
}

impl TargetMemory for RemoteMemory<'_> {
    fn read_bytes(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        let conn = &mut *self.conn;
        match self.cache.read(addr, len, |addr, len| conn.peek(addr, len))? {
            ReadResult::Data(data) => Ok(data),
            ReadResult::Failed { address } => Err(Error::UnmappedAddress(address)),
        }
    }

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        if !self.conn.poke(addr, data)? {
            return Err(Error::UnmappedAddress(addr));
        }
        self.cache.write_through(addr, data);
        Ok(())
    }
}

/// Debug event waiting for acknowledgment.
struct PendingEvent {
    event: DebugEvent,
    /// Program counter of a breakpoint hit is already moved back to the breakpoint address.
    pc_restored: bool,
}

/// State of an attached process.
struct Session {
    pid: u32,
    suspended: bool,
    cache: PageCache,
    modules: ModuleRegistry,
    pending_event: Option<PendingEvent>,
    breakpoints: BreakpointTable,
}

impl Session {
    /// Freshly attached process is suspended.
    fn new(pid: u32, cache_config: CacheConfig) -> Self {
        let mut cache = PageCache::new(cache_config.page_size, cache_config.max_pages);
        cache.enable();
        Self {
            pid,
            suspended: true,
            cache,
            modules: ModuleRegistry::default(),
            pending_event: None,
            breakpoints: BreakpointTable::default(),
        }
    }

    fn memory<'a>(&'a mut self, conn: &'a mut Connection) -> RemoteMemory<'a> {
        RemoteMemory {
            conn,
            cache: &mut self.cache,
        }
    }

    fn ensure_suspended(&self) -> Result<(), Error> {
        if !self.suspended {
            return Err(Error::NotSuspended);
        }
        Ok(())
    }

    fn resolve_modules(&mut self, conn: &mut Connection) -> Result<(), Error> {
        let libs = conn.lib_info()?;
        self.modules.resolve(libs);
        Ok(())
    }

    /// Module registry, resolved if needed.
    fn modules(&mut self, conn: &mut Connection) -> Result<&ModuleRegistry, Error> {
        if self.modules.needs_resolution() {
            self.resolve_modules(conn)?;
        }
        Ok(&self.modules)
    }

    /// Release all local resources of the session.
    fn close(mut self) {
        self.modules.close_all();
        self.cache.disable();
        if let Some(pending) = self.pending_event.take() {
            debug!(target: "debugger", "discard unacknowledged event {:?}", pending.event);
        }
    }
}

enum SessionState {
    Detached,
    Attached(Session),
}

struct Inner {
    conn: Connection,
    cache_config: CacheConfig,
    state: SessionState,
}

impl Inner {
    fn attached(&mut self) -> Result<(&mut Connection, &mut Session), Error> {
        match &mut self.state {
            SessionState::Attached(session) => Ok((&mut self.conn, session)),
            SessionState::Detached => Err(Error::NotAttached),
        }
    }

    fn session(&self) -> Option<&Session> {
        match &self.state {
            SessionState::Attached(session) => Some(session),
            SessionState::Detached => None,
        }
    }
}

/// Debugger for a process controlled by a remote debug server.
///
/// All operations are serialized by a single lock, so wire exchanges never interleave
/// and are seen by the server in the order of invocation.
pub struct RemoteDebugger {
    inner: Mutex<Inner>,
    machine: MachineDescription,
}

impl RemoteDebugger {
    /// Connect to a debug server.
    pub fn connect(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let conn = Connection::connect(&config)?;
        Ok(Self::from_connection(conn, config.cache))
    }

    /// Create debugger over established connection.
    ///
    /// # Arguments
    ///
    /// * `conn`: debug server connection
    /// * `cache_config`: memory cache settings used by every attached session
    pub fn from_connection(conn: Connection, cache_config: CacheConfig) -> Self {
        Self {
            machine: conn.machine(),
            inner: Mutex::new(Inner {
                conn,
                cache_config,
                state: SessionState::Detached,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn machine(&self) -> MachineDescription {
        self.machine
    }

    pub fn is_attached(&self) -> bool {
        self.lock().session().is_some()
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().session().map(|s| s.suspended).unwrap_or(false)
    }

    /// Pid of attached process.
    pub fn pid(&self) -> Option<u32> {
        self.lock().session().map(|s| s.pid)
    }

    /// List processes visible to the debug server.
    pub fn process_list(&self) -> Result<Vec<ProcessInfo>, Error> {
        self.lock().conn.process_list()
    }

    /// Attach to a process. Process is suspended after attach.
    pub fn attach(&self, pid: u32) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.session().is_some() {
            return Err(Error::AlreadyAttached);
        }
        if !inner.conn.attach(pid)? {
            return Err(Error::AttachFailed(pid));
        }
        inner.state = SessionState::Attached(Session::new(pid, inner.cache_config));
        info!(target: "debugger", "attached to process {pid}");
        Ok(())
    }

    /// Detach from the process. Return `false` without any server interaction if not attached,
    /// otherwise drops local session state and returns the server answer.
    pub fn detach(&self) -> Result<bool, Error> {
        let mut inner = self.lock();
        let session = match mem::replace(&mut inner.state, SessionState::Detached) {
            SessionState::Detached => return Ok(false),
            SessionState::Attached(session) => session,
        };
        let pid = session.pid;
        session.close();

        let detached = inner.conn.detach()?;
        info!(target: "debugger", "detached from process {pid}, server confirms: {detached}");
        Ok(detached)
    }

    pub fn suspend(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        if session.suspended {
            return Err(Error::AlreadySuspended);
        }
        conn.suspend()?;
        session.suspended = true;
        session.cache.enable();
        if session.modules.is_resolved() {
            weak_error!(session.resolve_modules(conn), "re-resolve modules:");
        }
        debug!(target: "debugger", "process {} suspended", session.pid);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        session.ensure_suspended()?;
        session.cache.disable();
        conn.resume()?;
        session.suspended = false;
        debug!(target: "debugger", "process {} resumed", session.pid);
        Ok(())
    }

    /// Read target memory.
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        session.memory(conn).read_bytes(addr, len)
    }

    /// Write target memory.
    pub fn write_memory(&self, addr: u64, data: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        session.memory(conn).write_bytes(addr, data)
    }

    /// Read a 32-bit integer in target byte order.
    pub fn read_u32(&self, addr: u64) -> Result<u32, Error> {
        let raw = self.read_memory(addr, 4)?;
        Ok(self.machine.decode_u32(&raw))
    }

    /// Read a pointer sized integer in target byte order.
    pub fn read_address(&self, addr: u64) -> Result<u64, Error> {
        let raw = self.read_memory(addr, self.machine.address_size)?;
        Ok(self.machine.decode_address(&raw))
    }

    pub fn set_breakpoint(&self, addr: u64) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        let Session {
            cache, breakpoints, ..
        } = session;
        breakpoints.set(&mut RemoteMemory { conn, cache }, addr)
    }

    pub fn clear_breakpoint(&self, addr: u64) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        let Session {
            cache, breakpoints, ..
        } = session;
        breakpoints.clear(&mut RemoteMemory { conn, cache }, addr)
    }

    pub fn is_breakpoint_set(&self, addr: u64) -> bool {
        self.lock()
            .session()
            .map(|s| s.breakpoints.is_set(addr))
            .unwrap_or(false)
    }

    /// Addresses of armed breakpoints.
    pub fn breakpoints(&self) -> Vec<u64> {
        self.lock()
            .session()
            .map(|s| s.breakpoints.addresses())
            .unwrap_or_default()
    }

    /// Return pending debug event, or ask the server for a new one.
    /// The same event is returned until it is acknowledged.
    pub fn poll_event(&self) -> Result<Option<DebugEvent>, Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        if let Some(pending) = &session.pending_event {
            return Ok(Some(pending.event.clone()));
        }

        let event = conn.poll_event()?;
        if let Some(event) = &event {
            debug!(target: "debugger", "debug event: {event:?}");
            session.pending_event = Some(PendingEvent {
                event: event.clone(),
                pc_restored: false,
            });
        }
        Ok(event)
    }

    /// Acknowledge pending debug event and let the target continue.
    ///
    /// A hit of a known breakpoint moves the thread program counter back to the breakpoint
    /// address. Breakpoint and single step traps are consumed by the debugger, other
    /// events are passed on to the target. If the server refuses to continue, the event
    /// stays pending.
    pub fn acknowledge_event(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        let pending = session
            .pending_event
            .as_mut()
            .ok_or(Error::NoPendingEvent)?;

        if let DebugEvent::Breakpoint { thread, pc } = &pending.event {
            if !pending.pc_restored && session.breakpoints.is_set(*pc) {
                let mut registers = thread::get_registers(conn, thread)?;
                let trap_pc = registers.pc();
                registers.set_pc(trap_pc.wrapping_sub(TRAP_WIDTH));
                thread::set_registers(conn, thread, &registers)?;
                pending.pc_restored = true;
                debug!(target: "debugger", "{thread} hit breakpoint at {pc:#x}");
            }
        }

        let pass_on = pending.event.pass_on();
        if !conn.continue_event(pass_on)? {
            return Err(Error::RemoteOperationFailed(
                "continue debug event".to_string(),
            ));
        }
        if pending.event.is_module_event() {
            session.modules.mark_stale();
        }
        session.pending_event = None;
        Ok(())
    }

    /// Threads of the attached process.
    pub fn threads(&self) -> Result<Vec<ThreadRef>, Error> {
        let mut inner = self.lock();
        let (conn, _) = inner.attached()?;
        Ok(conn
            .thread_list()?
            .into_iter()
            .map(ThreadRef::direct)
            .collect())
    }

    /// Thread which handle value is stored in target memory at `addr`.
    pub fn thread_for_handle_address(&self, addr: u64) -> Result<ThreadRef, Error> {
        let handle = self.read_address(addr)?;
        Ok(ThreadRef::duplicated(addr, handle))
    }

    pub fn get_registers(&self, thread: &ThreadRef) -> Result<RegisterMap, Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        session.ensure_suspended()?;
        thread::get_registers(conn, thread)
    }

    pub fn set_registers(&self, thread: &ThreadRef, registers: &RegisterMap) -> Result<(), Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        session.ensure_suspended()?;
        thread::set_registers(conn, thread, registers)
    }

    /// Segment descriptor of `selector` in the context of `thread`.
    pub fn selector_entry(&self, thread: &ThreadRef, selector: u16) -> Result<LdtEntry, Error> {
        let mut inner = self.lock();
        let (conn, _) = inner.attached()?;
        thread::selector_entry(conn, thread, selector)
    }

    /// Operating system thread id. Fetched from the thread information block
    /// addressed by FS segment once, then cached in `thread`.
    pub fn thread_native_id(&self, thread: &ThreadRef) -> Result<u32, Error> {
        if let Some(id) = thread.cached_native_id() {
            return Ok(id);
        }

        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        session.ensure_suspended()?;

        let registers = thread::get_registers(conn, thread)?;
        let fs = registers.value(Register::Fs) as u16;
        let tib = thread::selector_entry(conn, thread, fs)?.base() as u64;
        let raw = session
            .memory(conn)
            .read_bytes(tib + TIB_THREAD_ID_OFFSET, 4)?;
        let id = self.machine.decode_u32(&raw);
        debug!(target: "debugger", "{thread}: native id {id}");
        Ok(thread.cache_native_id(id))
    }

    /// Loaded modules of the attached process.
    pub fn modules(&self) -> Result<Vec<Arc<Module>>, Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        Ok(session.modules(conn)?.modules().to_vec())
    }

    /// Find loaded module by file name, case insensitive.
    pub fn module(&self, name: &str) -> Result<Option<Arc<Module>>, Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        Ok(session.modules(conn)?.find(name))
    }

    /// Find address of a symbol exported by a module.
    /// Return `None` if there is no such module or the module has no such symbol.
    pub fn lookup_symbol(&self, module: &str, symbol: &str) -> Result<Option<u64>, Error> {
        let mut inner = self.lock();
        let (conn, session) = inner.attached()?;
        Ok(session.modules(conn)?.lookup_symbol(module, symbol))
    }
}

impl Drop for RemoteDebugger {
    fn drop(&mut self) {
        if self.is_attached() {
            weak_error!(self.detach(), "detach on drop:");
        }
    }
}
