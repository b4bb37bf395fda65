//! Token grammar of the debug server protocol.
//!
//! Requests are ASCII command lines, optionally followed by a binary payload.
//! Responses are whitespace separated tokens (booleans, integers, hex addresses),
//! length-prefixed strings and raw binary blocks.

use crate::debugger::wire::machine::MachineDescription;
use std::io::{self, BufRead, BufWriter, ErrorKind, Read, Write};

/// Upper bound of buffer preallocation for server declared lengths and counts.
pub(crate) const MAX_PREALLOC: usize = 1024;

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidData, msg.into())
}

/// Writer for command lines.
pub struct CommandWriter<W: Write> {
    inner: BufWriter<W>,
}

impl<W: Write> CommandWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
        }
    }

    /// Write a newline terminated command and flush it.
    pub fn line(&mut self, command: &str) -> io::Result<()> {
        self.inner.write_all(command.as_bytes())?;
        self.inner.write_all(b"\n")?;
        self.inner.flush()
    }

    /// Write a command prefix that is continued by a binary payload.
    pub fn partial(&mut self, text: &str) -> io::Result<()> {
        self.inner.write_all(text.as_bytes())?;
        self.inner.flush()
    }
}

/// Writer for binary payloads, every write is flushed immediately.
pub struct RawWriter<W: Write> {
    inner: W,
    machine: MachineDescription,
}

impl<W: Write> RawWriter<W> {
    pub fn new(inner: W, machine: MachineDescription) -> Self {
        Self { inner, machine }
    }

    pub fn u32(&mut self, value: u32) -> io::Result<()> {
        let buf = self.machine.encode_u32(value);
        self.bytes(&buf)
    }

    pub fn bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)?;
        self.inner.flush()
    }
}

/// Reader of response tokens.
pub struct Decoder<R: BufRead> {
    inner: R,
    machine: MachineDescription,
}

impl<R: BufRead> Decoder<R> {
    pub fn new(inner: R, machine: MachineDescription) -> Self {
        Self { inner, machine }
    }

    pub fn machine(&self) -> MachineDescription {
        self.machine
    }

    fn peek_byte(&mut self) -> io::Result<Option<u8>> {
        loop {
            match self.inner.fill_buf() {
                Ok(buf) => return Ok(buf.first().copied()),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume whitespace until the next significant byte.
    pub fn skip_whitespace(&mut self) -> io::Result<()> {
        while let Some(b) = self.peek_byte()? {
            if !b.is_ascii_whitespace() {
                break;
            }
            self.inner.consume(1);
        }
        Ok(())
    }

    /// Read the next whitespace delimited token. The delimiter itself stays in the stream.
    pub fn token(&mut self) -> io::Result<String> {
        self.skip_whitespace()?;
        let mut token = Vec::new();
        while let Some(b) = self.peek_byte()? {
            if b.is_ascii_whitespace() {
                break;
            }
            token.push(b);
            self.inner.consume(1);
        }
        if token.is_empty() {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "connection closed while waiting for a token",
            ));
        }
        String::from_utf8(token).map_err(|_| invalid_data("non ascii token"))
    }

    pub fn boolean(&mut self) -> io::Result<bool> {
        let token = self.token()?;
        match token.as_str() {
            "true" | "yes" | "1" => Ok(true),
            "false" | "no" | "0" => Ok(false),
            _ => Err(invalid_data(format!("expect boolean, got `{token}`"))),
        }
    }

    /// Signed integer, decimal or `0x` prefixed hex.
    pub fn int(&mut self) -> io::Result<i64> {
        let token = self.token()?;
        parse_int(&token).ok_or_else(|| invalid_data(format!("expect integer, got `{token}`")))
    }

    /// Hex address, `0x` prefix is optional. Must fit the machine address width.
    pub fn address(&mut self) -> io::Result<u64> {
        let token = self.token()?;
        let digits = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(&token);
        let value = u64::from_str_radix(digits, 16)
            .map_err(|_| invalid_data(format!("expect address, got `{token}`")))?;
        if value > self.machine.address_mask() {
            return Err(invalid_data(format!(
                "address `{token}` exceeds target pointer width"
            )));
        }
        Ok(value)
    }

    /// Length-prefixed string: char width, char count, one separator byte, then raw chars.
    /// Declared characters are consumed in full even if they turn out to be malformed.
    pub fn string(&mut self) -> io::Result<String> {
        let width = self.int()?;
        let count = self.int()?;
        if width != 1 && width != 2 {
            return Err(invalid_data(format!("unsupported char width {width}")));
        }
        if count < 0 {
            return Err(invalid_data(format!("negative string length {count}")));
        }
        let len = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(width as usize))
            .ok_or_else(|| invalid_data(format!("string length {count} overflows")))?;
        self.byte()?;

        let mut raw = Vec::with_capacity(len.min(MAX_PREALLOC));
        let read = self.inner.by_ref().take(len as u64).read_to_end(&mut raw)?;
        if read != len {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("string ended after {read} of {len} bytes"),
            ));
        }

        if width == 1 {
            return Ok(raw.iter().map(|&b| b as char).collect());
        }
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|unit| self.machine.decode_u16(unit))
            .collect();
        String::from_utf16(&units).map_err(|_| invalid_data("malformed utf-16 string"))
    }

    pub fn byte(&mut self) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.inner.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Binary u32 in machine byte order.
    pub fn u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.inner.read_exact(&mut buf)?;
        Ok(self.machine.decode_u32(&buf))
    }

    pub fn bytes_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf)
    }

    /// Consume exactly `n` bytes.
    pub fn skip(&mut self, n: usize) -> io::Result<()> {
        let copied = io::copy(&mut self.inner.by_ref().take(n as u64), &mut io::sink())?;
        if copied as usize != n {
            return Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                format!("stream ended after {copied} of {n} bytes"),
            ));
        }
        Ok(())
    }
}

fn parse_int(token: &str) -> Option<i64> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let value = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };
    Some(if negative { -value } else { value })
}
