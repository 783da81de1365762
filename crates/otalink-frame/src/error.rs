use std::time::Duration;

use otalink_transport::TransportError;

/// Errors that can occur during frame encoding, decoding and framed I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the protocol maximum.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The destination buffer cannot hold the encoded frame.
    #[error("buffer too small ({available} bytes, need {needed})")]
    BufferTooSmall { needed: usize, available: usize },

    /// No complete frame arrived before the deadline.
    #[error("no frame received within {0:?}")]
    Timeout(Duration),

    /// The underlying byte stream failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl FrameError {
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            FrameError::Timeout(_) | FrameError::Transport(TransportError::Timeout(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
