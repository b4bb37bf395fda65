use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- connection errors -----------------------------------------
    #[error(
        "debug server not reachable at {addr} after {timeout:?}, \
        start the debug server process on the target machine and try again"
    )]
    ConnectionTimeout { addr: SocketAddr, timeout: Duration },
    #[error("debug server protocol error: {0}")]
    Protocol(#[from] std::io::Error),

    // --------------------------------- session state errors --------------------------------------
    #[error("not attached to a process")]
    NotAttached,
    #[error("already attached to a process")]
    AlreadyAttached,
    #[error("process not suspended")]
    NotSuspended,
    #[error("process already suspended")]
    AlreadySuspended,
    #[error("attach to process {0} failed")]
    AttachFailed(u32),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("unmapped address {0:#x}")]
    UnmappedAddress(u64),

    // --------------------------------- breakpoint errors -----------------------------------------
    #[error("breakpoint already set at {0:#x}")]
    DuplicateBreakpoint(u64),
    #[error("no breakpoint set at {0:#x}")]
    UnknownBreakpoint(u64),

    // --------------------------------- debug event errors ----------------------------------------
    #[error("no pending debug event")]
    NoPendingEvent,

    // --------------------------------- remote side failures --------------------------------------
    #[error("remote operation failed: {0}")]
    RemoteOperationFailed(String),

    // --------------------------------- configuration errors --------------------------------------
    #[error("read configuration file: {0}")]
    ConfigRead(std::io::Error),
    #[error("parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Return a hint to a caller - keep using the session after error or drop whole connection.
    /// Protocol errors may leave the stream desynchronized, so they are fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::NotAttached => false,
            Error::AlreadyAttached => false,
            Error::NotSuspended => false,
            Error::AlreadySuspended => false,
            Error::AttachFailed(_) => false,
            Error::UnmappedAddress(_) => false,
            Error::DuplicateBreakpoint(_) => false,
            Error::UnknownBreakpoint(_) => false,
            Error::NoPendingEvent => false,
            Error::RemoteOperationFailed(_) => false,
            Error::InvalidConfig(_) => false,
            Error::ConfigRead(_) => false,
            Error::ConfigParse(_) => false,

            // currently fatal errors
            Error::ConnectionTimeout { .. } => true,
            Error::Protocol(_) => true,
        }
    }

    /// True for errors raised by a lifecycle check before any wire traffic.
    pub fn is_illegal_state(&self) -> bool {
        matches!(
            self,
            Error::NotAttached
                | Error::AlreadyAttached
                | Error::NotSuspended
                | Error::AlreadySuspended
        )
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
