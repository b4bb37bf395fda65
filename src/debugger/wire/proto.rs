//! Typed debug server commands.
//! Every command has its own response shape, negative answers are decoded as `false`/`None`.

use crate::debugger::error::Error;
use crate::debugger::event::DebugEvent;
use crate::debugger::register::NATIVE_CONTEXT_WORDS;
use crate::debugger::thread::LdtEntry;
use crate::debugger::wire::codec::MAX_PREALLOC;
use crate::debugger::wire::transport::Connection;
use itertools::Itertools;
use log::debug;
use std::io;

/// Result of a raw memory read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    Data(Vec<u8>),
    /// Some part of the requested range is not mapped in the target.
    Failed { address: u64 },
}

/// Process visible to the debug server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

/// Shared library reported by `libinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibInfo {
    pub path: String,
    pub base: u64,
}

fn protocol_violation(msg: impl Into<String>) -> Error {
    Error::Protocol(io::Error::new(io::ErrorKind::InvalidData, msg.into()))
}

fn count(value: i64, what: &str) -> Result<usize, Error> {
    usize::try_from(value).map_err(|_| protocol_violation(format!("negative {what} count {value}")))
}

impl Connection {
    pub fn attach(&mut self, pid: u32) -> Result<bool, Error> {
        self.send(&format!("attach {pid}"))?;
        Ok(self.decoder.boolean()?)
    }

    pub fn detach(&mut self) -> Result<bool, Error> {
        self.send("detach")?;
        Ok(self.decoder.boolean()?)
    }

    pub fn process_list(&mut self) -> Result<Vec<ProcessInfo>, Error> {
        self.send("proclist")?;
        let n = count(self.decoder.int()?, "process")?;
        let mut processes = Vec::with_capacity(n.min(MAX_PREALLOC));
        for _ in 0..n {
            let pid = self.decoder.int()?;
            let pid = u32::try_from(pid)
                .map_err(|_| protocol_violation(format!("invalid pid {pid}")))?;
            let name = self.decoder.string()?;
            processes.push(ProcessInfo { pid, name });
        }
        Ok(processes)
    }

    pub fn suspend(&mut self) -> Result<(), Error> {
        Ok(self.send("suspend")?)
    }

    pub fn resume(&mut self) -> Result<(), Error> {
        Ok(self.send("resume")?)
    }

    /// Read `len` bytes of target memory starting at `addr`.
    ///
    /// The server answers with a `B` marker, a success byte and then a sequence of
    /// (length, mapped flag, data) segments. All segments are consumed even
    /// when some of them are unmapped, so the stream stays in sync.
    pub fn peek(&mut self, addr: u64, len: usize) -> Result<ReadResult, Error> {
        self.send(&format!("peek 0x{addr:x} {len}"))?;

        self.decoder.skip_whitespace()?;
        let marker = self.decoder.byte()?;
        if marker != b'B' {
            return Err(protocol_violation(format!(
                "expect binary marker, got {marker:#x}"
            )));
        }
        if self.decoder.byte()? == 0 {
            return Ok(ReadResult::Failed { address: addr });
        }

        let mut data = vec![0u8; len];
        let mut offset = 0;
        let mut first_unmapped = None;
        while offset < len {
            let segment_len = self.decoder.u32()? as usize;
            let mapped = self.decoder.byte()? != 0;
            if segment_len == 0 || segment_len > len - offset {
                return Err(protocol_violation(format!(
                    "peek segment of {segment_len} bytes at offset {offset} overruns {len} bytes"
                )));
            }
            if mapped {
                self.decoder
                    .bytes_exact(&mut data[offset..offset + segment_len])?;
            } else if first_unmapped.is_none() {
                first_unmapped = Some(offset);
            }
            offset += segment_len;
        }

        match first_unmapped {
            None => Ok(ReadResult::Data(data)),
            Some(offset) => {
                debug!(
                    target: "wire",
                    "read {len} bytes at {addr:#x}: unmapped from {:#x}",
                    addr + offset as u64
                );
                Ok(ReadResult::Failed { address: addr })
            }
        }
    }

    /// Write `data` into target memory. Return false if the server rejects the write.
    pub fn poke(&mut self, addr: u64, data: &[u8]) -> Result<bool, Error> {
        self.send_with_payload(&format!("poke 0x{addr:x} |"), data)?;
        Ok(self.decoder.boolean()?)
    }

    pub fn duplicate_handle(&mut self, handle: u64) -> Result<Option<u64>, Error> {
        self.send(&format!("duphandle 0x{handle:x}"))?;
        if !self.decoder.boolean()? {
            return Ok(None);
        }
        Ok(Some(self.decoder.address()?))
    }

    pub fn close_handle(&mut self, handle: u64) -> Result<(), Error> {
        Ok(self.send(&format!("closehandle 0x{handle:x}"))?)
    }

    /// Fetch thread context words in the server native order.
    pub fn get_context(
        &mut self,
        handle: u64,
    ) -> Result<Option<[u64; NATIVE_CONTEXT_WORDS]>, Error> {
        self.send(&format!("getcontext 0x{handle:x}"))?;
        if !self.decoder.boolean()? {
            return Ok(None);
        }
        let mut words = [0u64; NATIVE_CONTEXT_WORDS];
        for word in words.iter_mut() {
            *word = self.decoder.address()?;
        }
        Ok(Some(words))
    }

    pub fn set_context(
        &mut self,
        handle: u64,
        words: &[u64; NATIVE_CONTEXT_WORDS],
    ) -> Result<bool, Error> {
        let words = words.iter().map(|w| format!("0x{w:x}")).join(" ");
        self.send(&format!("setcontext 0x{handle:x} {words}"))?;
        Ok(self.decoder.boolean()?)
    }

    pub fn selector_entry(&mut self, handle: u64, selector: u16) -> Result<Option<LdtEntry>, Error> {
        self.send(&format!("selectorentry 0x{handle:x} {selector}"))?;
        if !self.decoder.boolean()? {
            return Ok(None);
        }
        let mut fields = [0u64; 6];
        for field in fields.iter_mut() {
            *field = self.decoder.address()?;
        }
        Ok(Some(LdtEntry::from_fields(fields)))
    }

    pub fn thread_list(&mut self) -> Result<Vec<u64>, Error> {
        self.send("threadlist")?;
        let n = count(self.decoder.int()?, "thread")?;
        let mut threads = Vec::with_capacity(n.min(MAX_PREALLOC));
        for _ in 0..n {
            threads.push(self.decoder.address()?);
        }
        Ok(threads)
    }

    pub fn lib_info(&mut self) -> Result<Vec<LibInfo>, Error> {
        self.send("libinfo")?;
        let n = count(self.decoder.int()?, "library")?;
        let mut libs = Vec::with_capacity(n.min(MAX_PREALLOC));
        for _ in 0..n {
            let path = self.decoder.string()?;
            let base = self.decoder.address()?;
            libs.push(LibInfo { path, base });
        }
        Ok(libs)
    }

    pub fn poll_event(&mut self) -> Result<Option<DebugEvent>, Error> {
        self.send("pollevent")?;
        if !self.decoder.boolean()? {
            return Ok(None);
        }
        Ok(Some(DebugEvent::decode(&mut self.decoder)?))
    }

    pub fn continue_event(&mut self, pass_on: bool) -> Result<bool, Error> {
        self.send(&format!("continueevent {}", u8::from(pass_on)))?;
        Ok(self.decoder.boolean()?)
    }
}
