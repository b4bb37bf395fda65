//! Debug server connection.
//! One duplex stream, split into a command writer, a raw binary writer and a buffered reader.

use crate::debugger::config::ClientConfig;
use crate::debugger::error::Error;
use crate::debugger::wire::codec::{CommandWriter, Decoder, RawWriter};
use crate::debugger::wire::machine::MachineDescription;
use log::{debug, info, trace, warn};
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Instant;

type BoxedReader = Box<dyn Read + Send>;
type BoxedWriter = Box<dyn Write + Send>;

pub struct Connection {
    commands: CommandWriter<BoxedWriter>,
    raw: RawWriter<BoxedWriter>,
    pub(super) decoder: Decoder<BufReader<BoxedReader>>,
    machine: MachineDescription,
}

impl Connection {
    /// Connect to the debug server. Connection attempts are repeated until
    /// `config.connect_timeout` elapses.
    pub fn connect(config: &ClientConfig) -> Result<Self, Error> {
        let timeout = config.connect_timeout();
        let retry_delay = config.connect_retry_interval();
        let start = Instant::now();

        let stream = loop {
            match TcpStream::connect_timeout(&config.address, retry_delay) {
                Ok(stream) => break stream,
                Err(err) => {
                    if start.elapsed() >= timeout {
                        warn!(target: "wire", "debug server {} unreachable: {err}", config.address);
                        return Err(Error::ConnectionTimeout {
                            addr: config.address,
                            timeout,
                        });
                    }
                    trace!(target: "wire", "connect to {}: {err}, retry", config.address);
                    thread::sleep(retry_delay);
                }
            }
        };

        info!(target: "wire", "connected to debug server at {}", config.address);
        Ok(Self::from_stream(stream, config.machine)?)
    }

    /// Create connection from an already established stream.
    pub fn from_stream(stream: TcpStream, machine: MachineDescription) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let raw = stream.try_clone()?;
        Ok(Self::from_channels(reader, stream, raw, machine))
    }

    /// Create connection from separate channels.
    ///
    /// # Arguments
    ///
    /// * `reader`: response stream
    /// * `commands`: command line stream
    /// * `raw`: binary payload stream, must write to the same destination as `commands`
    /// * `machine`: target machine description
    pub fn from_channels(
        reader: impl Read + Send + 'static,
        commands: impl Write + Send + 'static,
        raw: impl Write + Send + 'static,
        machine: MachineDescription,
    ) -> Self {
        let reader: BoxedReader = Box::new(reader);
        let commands: BoxedWriter = Box::new(commands);
        let raw: BoxedWriter = Box::new(raw);
        Self {
            commands: CommandWriter::new(commands),
            raw: RawWriter::new(raw, machine),
            decoder: Decoder::new(BufReader::new(reader), machine),
            machine,
        }
    }

    pub fn machine(&self) -> MachineDescription {
        self.machine
    }

    /// Send a single command line.
    pub(super) fn send(&mut self, command: &str) -> io::Result<()> {
        debug!(target: "wire", "> {command}");
        self.commands.line(command)
    }

    /// Send a command line followed by a length prefixed binary payload.
    pub(super) fn send_with_payload(&mut self, prefix: &str, payload: &[u8]) -> io::Result<()> {
        debug!(target: "wire", "> {prefix} [{} bytes]", payload.len());
        let len = u32::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "payload larger than 4GiB")
        })?;
        self.commands.partial(prefix)?;
        self.raw.u32(len)?;
        self.raw.bytes(payload)?;
        self.commands.line("")
    }
}
