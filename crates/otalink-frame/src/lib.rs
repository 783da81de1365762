//! Integrity framing for firmware transfer links.
//!
//! Every message travels in one frame:
//! - Two start markers (`0xAA 0x55`) for resynchronization
//! - A 2-byte little-endian length covering the type byte and payload
//! - A 1-byte message type and up to 1024 payload bytes
//! - A CRC32 over type and payload
//!
//! The decoder is a byte-at-a-time state machine that skips noise and
//! rejects corrupt frames without help from the caller.

use std::time::Duration;

pub mod codec;
#[cfg(feature = "async")]
pub mod codec_async;
pub mod crc32;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    encode_frame, encode_frame_into, DecodeFault, DecodeState, Frame, FrameDecoder,
    FRAME_OVERHEAD, MAX_FRAME_SIZE, MAX_LENGTH, MAX_PAYLOAD, START0, START1,
};
#[cfg(feature = "async")]
pub use codec_async::OtaFrameCodec;
pub use error::{FrameError, Result};
pub use reader::{FrameReader, READY_POLL};
pub use writer::FrameWriter;

/// Default wait for one frame in [`FrameReader::read_frame`].
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for framed reads.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Deadline used by [`FrameReader::read_frame`]. Default: 5 s.
    pub read_timeout: Duration,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

impl FrameConfig {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}
