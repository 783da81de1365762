//! `tokio_util` codec over the same frame state machine.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::codec::{encode_frame, DecodeState, Frame, FrameDecoder};
use crate::error::FrameError;

/// Frame codec for `tokio_util::codec::Framed`.
///
/// Corrupt frames are skipped, as with the blocking reader.
#[derive(Debug, Default)]
pub struct OtaFrameCodec {
    decoder: FrameDecoder,
}

impl OtaFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of corrupt frames dropped so far.
    pub fn error_count(&self) -> u64 {
        self.decoder.error_count()
    }
}

impl Decoder for OtaFrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        while !src.is_empty() {
            let (used, state) = self.decoder.feed_slice(src);
            src.advance(used);
            match state {
                DecodeState::Complete => {
                    let frame = self.decoder.frame();
                    self.decoder.reset();
                    return Ok(frame);
                }
                DecodeState::Error => {
                    debug!(fault = ?self.decoder.fault(), "dropping corrupt frame");
                    self.decoder.reset();
                }
                _ => {}
            }
        }
        Ok(None)
    }
}

impl Encoder<Frame> for OtaFrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(item.msg_type, &item.payload, dst)
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        FrameError::Transport(err.into())
    }
}
