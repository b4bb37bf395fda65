use crate::debugger::error::Error;
use log::debug;
use std::collections::HashMap;

/// x86 `int3` instruction.
pub const TRAP_OPCODE: u8 = 0xCC;

/// Trap instruction width, program counter points this far past a hit breakpoint.
pub const TRAP_WIDTH: u64 = 1;

/// Target memory used for installing trap instructions.
pub trait TargetMemory {
    fn read_bytes(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error>;

    fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), Error>;
}

/// Breakpoint representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u64,
    saved_data: u8,
}

impl Breakpoint {
    /// Byte that the trap instruction replaced.
    pub fn saved_data(&self) -> u8 {
        self.saved_data
    }

    fn enable(addr: u64, mem: &mut impl TargetMemory) -> Result<Self, Error> {
        let original = mem.read_bytes(addr, 1)?;
        let saved_data = *original.first().ok_or(Error::UnmappedAddress(addr))?;
        mem.write_bytes(addr, &[TRAP_OPCODE])?;
        Ok(Self { addr, saved_data })
    }

    fn disable(&self, mem: &mut impl TargetMemory) -> Result<(), Error> {
        mem.write_bytes(self.addr, &[self.saved_data])
    }
}

/// Armed breakpoints of an attached process.
#[derive(Default)]
pub struct BreakpointTable {
    breakpoints: HashMap<u64, Breakpoint>,
}

impl BreakpointTable {
    /// Install a trap instruction at `addr`.
    /// Breakpoint is recorded only if the trap instruction is written.
    pub fn set(&mut self, mem: &mut impl TargetMemory, addr: u64) -> Result<(), Error> {
        if self.breakpoints.contains_key(&addr) {
            return Err(Error::DuplicateBreakpoint(addr));
        }
        let brkpt = Breakpoint::enable(addr, mem)?;
        debug!(
            target: "debugger",
            "breakpoint set at {addr:#x}, saved byte {:#04x}",
            brkpt.saved_data
        );
        self.breakpoints.insert(addr, brkpt);
        Ok(())
    }

    /// Restore the original byte at `addr`.
    /// If the restore write fails the breakpoint stays recorded, so the call may be retried.
    pub fn clear(&mut self, mem: &mut impl TargetMemory, addr: u64) -> Result<(), Error> {
        let brkpt = self
            .breakpoints
            .get(&addr)
            .ok_or(Error::UnknownBreakpoint(addr))?;
        brkpt.disable(mem)?;
        self.breakpoints.remove(&addr);
        debug!(target: "debugger", "breakpoint at {addr:#x} removed");
        Ok(())
    }

    pub fn is_set(&self, addr: u64) -> bool {
        self.breakpoints.contains_key(&addr)
    }

    pub fn get(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    /// Armed breakpoint addresses in ascending order.
    pub fn addresses(&self) -> Vec<u64> {
        let mut addresses: Vec<_> = self.breakpoints.keys().copied().collect();
        addresses.sort_unstable();
        addresses
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}
