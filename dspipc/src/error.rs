//! Error types for the proxy channel.

use std::fmt;
use std::io;

/// Error type for proxy operations.
#[derive(Debug)]
pub enum Error {
    /// No free message descriptors (non-blocking path only; blocking
    /// callers wait instead).
    PoolExhausted,
    /// No response arrived within the deadline. The command is not
    /// retracted; the late response is reclaimed when it arrives.
    Timeout,
    /// No client is registered for this session id.
    UnknownSession(u32),
    /// The session id is already registered (id 0 is reserved for the
    /// proxy's own control plane).
    SessionInUse(u32),
    /// The peer reset; all in-flight work was discarded.
    ChannelReset,
    /// A blocking wait was aborted by channel teardown.
    Interrupted,
    /// The peer refused a control-plane buffer allocation.
    AllocFailed,
    /// A control-plane response carried the wrong opcode.
    UnexpectedOpcode { expected: u32, got: u32 },
    /// Invalid configuration.
    InvalidConfig(String),
    /// The shared memory region cannot hold the configured rings.
    RegionTooSmall { required: usize, provided: usize },
    /// IO error from shared memory setup.
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PoolExhausted => write!(f, "message pool exhausted"),
            Error::Timeout => write!(f, "timed out waiting for the peer"),
            Error::UnknownSession(id) => write!(f, "no client registered for session {}", id),
            Error::SessionInUse(id) => write!(f, "session {} is already in use", id),
            Error::ChannelReset => write!(f, "channel was reset"),
            Error::Interrupted => write!(f, "wait interrupted by channel teardown"),
            Error::AllocFailed => write!(f, "peer refused buffer allocation"),
            Error::UnexpectedOpcode { expected, got } => {
                write!(
                    f,
                    "unexpected response opcode: expected {:#x}, got {:#x}",
                    expected, got
                )
            }
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            Error::RegionTooSmall { required, provided } => {
                write!(
                    f,
                    "region too small: need {} bytes, got {}",
                    required, provided
                )
            }
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, Error>;
