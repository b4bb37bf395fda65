use crate::debugger::error::Error;
use crate::debugger::wire::machine::MachineDescription;
use serde::Deserialize;
use std::fs::read_to_string;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Port the debug server listens on by default.
pub const DEFAULT_PORT: u16 = 27000;

/// Memory cache settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Page size in bytes, power of two.
    pub page_size: usize,
    /// Maximum number of resident pages.
    pub max_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            max_pages: 4096,
        }
    }
}

/// Debug server client configuration.
///
/// Example:
/// ```toml
/// address = "127.0.0.1:27000"
/// connect_timeout_ms = 2000
///
/// [cache]
/// page_size = 4096
///
/// [machine]
/// address_size = 4
/// byte_order = "little"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Debug server address.
    pub address: SocketAddr,
    /// Give up connecting after this many milliseconds.
    pub connect_timeout_ms: u64,
    /// Pause between connection attempts in milliseconds.
    pub connect_retry_ms: u64,
    pub cache: CacheConfig,
    pub machine: MachineDescription,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            connect_timeout_ms: 2000,
            connect_retry_ms: 100,
            cache: CacheConfig::default(),
            machine: MachineDescription::X86,
        }
    }
}

impl ClientConfig {
    /// Config with default settings for a server at `address`.
    pub fn with_address(address: SocketAddr) -> Self {
        Self {
            address,
            ..Default::default()
        }
    }

    pub fn from_toml_str(data: &str) -> Result<Self, Error> {
        let config: ClientConfig = toml::de::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let data = read_to_string(path).map_err(Error::ConfigRead)?;
        Self::from_toml_str(&data)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.cache.page_size.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "cache page size {} is not a power of two",
                self.cache.page_size
            )));
        }
        if self.cache.max_pages == 0 {
            return Err(Error::InvalidConfig("cache must hold at least one page".into()));
        }
        if !self.machine.is_valid() {
            return Err(Error::InvalidConfig(format!(
                "unsupported address size {}",
                self.machine.address_size
            )));
        }
        if self.connect_retry_ms == 0 {
            return Err(Error::InvalidConfig("connect retry interval is zero".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn connect_retry_interval(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }
}
