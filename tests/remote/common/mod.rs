use dbgsrv_client::{ClientConfig, RemoteDebugger};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{self, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

pub const PID: u32 = 1234;
pub const MAIN_THREAD: u64 = 0x44;
pub const FS_SELECTOR: u64 = 0x3b;

/// Native context word indexes.
pub const CTX_EAX: usize = 0;
pub const CTX_EIP: usize = 8;
pub const CTX_FS: usize = 11;

/// Scripted state of the fake debug server.
pub struct MockState {
    pub processes: Vec<(u32, String)>,
    pub attach_ok: bool,
    pub memory: BTreeMap<u64, u8>,
    pub read_only: HashSet<u64>,
    pub duplicates: HashMap<u64, u64>,
    pub contexts: HashMap<u64, [u64; 22]>,
    pub ldt: HashMap<(u64, u16), [u64; 6]>,
    pub threads: Vec<u64>,
    pub libs: Vec<(String, u64)>,
    pub events: VecDeque<String>,
    pub continue_ok: bool,
    /// Every command line received, poke payloads are not included.
    pub log: Vec<String>,
}

impl Default for MockState {
    fn default() -> Self {
        let mut state = Self {
            processes: vec![(PID, "app.exe".to_string()), (4, "System".to_string())],
            attach_ok: true,
            memory: BTreeMap::new(),
            read_only: HashSet::new(),
            duplicates: HashMap::new(),
            contexts: HashMap::new(),
            ldt: HashMap::new(),
            threads: vec![MAIN_THREAD],
            libs: vec![],
            events: VecDeque::new(),
            continue_ok: true,
            log: vec![],
        };
        state.map(0x1000..0x3000);
        state
            .contexts
            .insert(MAIN_THREAD, context(0x1011, FS_SELECTOR));
        state
    }
}

/// Native context with all words set to their index except EIP and FS.
pub fn context(eip: u64, fs: u64) -> [u64; 22] {
    let mut words: [u64; 22] = std::array::from_fn(|i| 0x100 + i as u64);
    words[CTX_EIP] = eip;
    words[CTX_FS] = fs;
    words
}

impl MockState {
    /// Map a memory range, every byte is initialized with the low byte of its address.
    pub fn map(&mut self, range: Range<u64>) {
        for addr in range {
            self.memory.insert(addr, addr as u8);
        }
    }

    pub fn store(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(addr + i as u64, *b);
        }
    }

    fn execute(&mut self, line: &str, payload: Option<Vec<u8>>) -> Vec<u8> {
        self.log.push(line.to_string());
        let mut args = line.split_whitespace();
        let cmd = args.next().unwrap_or_default();
        let args: Vec<&str> = args.collect();

        match cmd {
            "attach" => {
                let pid: u32 = args[0].parse().unwrap();
                let ok = self.attach_ok && self.processes.iter().any(|(p, _)| *p == pid);
                boolean(ok)
            }
            "detach" => boolean(true),
            "proclist" => {
                let mut out = format!("{} ", self.processes.len()).into_bytes();
                for (pid, name) in &self.processes {
                    out.extend(format!("{pid} ").bytes());
                    out.extend(string(name));
                    out.push(b' ');
                }
                out.push(b'\n');
                out
            }
            "suspend" | "resume" | "closehandle" => vec![],
            "peek" => self.peek(hex(args[0]), args[1].parse().unwrap()),
            "poke" => {
                let addr = hex(args[0]);
                let data = payload.unwrap();
                let writable = (addr..addr + data.len() as u64)
                    .all(|a| self.memory.contains_key(&a) && !self.read_only.contains(&a));
                if writable {
                    self.store(addr, &data);
                }
                boolean(writable)
            }
            "duphandle" => match self.duplicates.get(&hex(args[0])) {
                Some(dup) => format!("true 0x{dup:x}\n").into_bytes(),
                None => boolean(false),
            },
            "getcontext" => match self.contexts.get(&hex(args[0])) {
                Some(words) => words_response(words),
                None => boolean(false),
            },
            "setcontext" => {
                let handle = hex(args[0]);
                if !self.contexts.contains_key(&handle) {
                    return boolean(false);
                }
                let mut words = [0u64; 22];
                for (w, arg) in words.iter_mut().zip(&args[1..]) {
                    *w = hex(arg);
                }
                self.contexts.insert(handle, words);
                boolean(true)
            }
            "selectorentry" => {
                let key = (hex(args[0]), args[1].parse::<u16>().unwrap());
                match self.ldt.get(&key) {
                    Some(fields) => words_response(fields),
                    None => boolean(false),
                }
            }
            "threadlist" => {
                let mut out = format!("{}", self.threads.len());
                for t in &self.threads {
                    out.push_str(&format!(" 0x{t:x}"));
                }
                out.push('\n');
                out.into_bytes()
            }
            "libinfo" => {
                let mut out = format!("{} ", self.libs.len()).into_bytes();
                for (path, base) in &self.libs {
                    out.extend(string(path));
                    out.extend(format!(" 0x{base:x} ").bytes());
                }
                out.push(b'\n');
                out
            }
            "pollevent" => match self.events.pop_front() {
                Some(event) => format!("true {event}\n").into_bytes(),
                None => boolean(false),
            },
            "continueevent" => boolean(self.continue_ok),
            _ => panic!("unexpected command: {line}"),
        }
    }

    fn peek(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut out = vec![b'B', 1];
        let mut offset = 0u64;
        while offset < len as u64 {
            let mapped = self.memory.contains_key(&(addr + offset));
            let start = offset;
            while offset < len as u64 && self.memory.contains_key(&(addr + offset)) == mapped {
                offset += 1;
            }
            out.extend_from_slice(&((offset - start) as u32).to_le_bytes());
            out.push(mapped as u8);
            if mapped {
                out.extend((addr + start..addr + offset).map(|a| self.memory[&a]));
            }
        }
        out
    }
}

fn hex(token: &str) -> u64 {
    u64::from_str_radix(token.trim_start_matches("0x"), 16).unwrap()
}

fn boolean(value: bool) -> Vec<u8> {
    format!("{value}\n").into_bytes()
}

fn string(s: &str) -> Vec<u8> {
    let mut out = format!("1 {} ", s.len()).into_bytes();
    out.extend(s.bytes());
    out
}

fn words_response(words: &[u64]) -> Vec<u8> {
    let mut out = String::from("true");
    for w in words {
        out.push_str(&format!(" 0x{w:x}"));
    }
    out.push('\n');
    out.into_bytes()
}

/// Read a command line. A line ending with `|` is followed by a length prefixed payload.
fn read_command(reader: &mut impl Read) -> io::Result<Option<(String, Option<Vec<u8>>)>> {
    let mut line = vec![];
    let mut byte = [0u8; 1];
    loop {
        if reader.read(&mut byte)? == 0 {
            return Ok(None);
        }
        match byte[0] {
            b'\n' => break,
            b'|' => {
                let mut len = [0u8; 4];
                reader.read_exact(&mut len)?;
                let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
                reader.read_exact(&mut payload)?;
                reader.read_exact(&mut byte)?;
                assert_eq!(byte[0], b'\n');
                let line = String::from_utf8(line).unwrap();
                return Ok(Some((line.trim_end().to_string(), Some(payload))));
            }
            b => line.push(b),
        }
    }
    Ok(Some((String::from_utf8(line).unwrap(), None)))
}

fn serve(stream: TcpStream, state: Arc<Mutex<MockState>>) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    while let Some((line, payload)) = read_command(&mut reader)? {
        let response = state.lock().unwrap().execute(&line, payload);
        writer.write_all(&response)?;
        writer.flush()?;
    }
    Ok(())
}

/// Fake debug server serving a single connection on a loopback port.
pub struct MockServer {
    state: Arc<Mutex<MockState>>,
    addr: SocketAddr,
}

impl MockServer {
    pub fn start(state: MockState) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(state));
        let server_state = state.clone();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = serve(stream, server_state);
            }
        });
        Self { state, addr }
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Connect a debugger to this server.
    pub fn connect(&self) -> RemoteDebugger {
        RemoteDebugger::connect(ClientConfig::with_address(self.addr)).unwrap()
    }

    /// Connect and attach to [`PID`].
    pub fn attach(&self) -> RemoteDebugger {
        let debugger = self.connect();
        debugger.attach(PID).unwrap();
        debugger
    }

    /// Names of received commands.
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .log
            .iter()
            .map(|line| line.split_whitespace().next().unwrap_or_default().to_string())
            .collect()
    }

    /// Number of received commands with this name.
    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    /// Wait until the server receives a command, commands without response are
    /// not synchronized with the client.
    pub fn wait_for(&self, command: &str) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if self.count(command) > 0 {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }
}
