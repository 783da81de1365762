use std::net::SocketAddr;
use std::time::Duration;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An operation was attempted before `init()` or after `disconnect()`.
    #[error("transport not initialized")]
    NotInitialized,

    /// `init()` was called on a transport that is already open.
    #[error("transport already initialized")]
    AlreadyInit,

    /// The caller passed an empty buffer or otherwise unusable argument.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// No data arrived within the requested timeout.
    #[error("receive timed out after {0:?}")]
    Timeout(Duration),

    /// The remote end went away.
    #[error("transport disconnected")]
    Disconnected,

    /// Failed to bind a listening socket.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to connect to the remote address.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// A low-level I/O error occurred on the stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors that a receive loop should treat as "nothing yet".
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    pub(crate) fn connect(addr: SocketAddr, source: std::io::Error) -> Self {
        TransportError::Connect {
            addr: addr.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
