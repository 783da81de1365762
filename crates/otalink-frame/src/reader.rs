use std::time::{Duration, Instant};

use otalink_transport::ByteStream;
use tracing::{debug, trace};

use crate::codec::{DecodeState, Frame, FrameDecoder, MAX_FRAME_SIZE};
use crate::error::{FrameError, Result};
use crate::FrameConfig;

const READ_CHUNK_SIZE: usize = MAX_FRAME_SIZE;

/// How long [`FrameReader::poll_frame`] looks for a frame that is already in flight.
pub const READY_POLL: Duration = Duration::from_millis(1);

/// Reads complete, CRC-checked frames from a [`ByteStream`].
///
/// Corrupt frames are dropped and the decoder resynchronizes on its own;
/// callers only ever see valid frames or a timeout.
pub struct FrameReader<S> {
    inner: S,
    decoder: FrameDecoder,
    chunk: Box<[u8; READ_CHUNK_SIZE]>,
    pending_start: usize,
    pending_end: usize,
    config: FrameConfig,
}

impl<S: ByteStream> FrameReader<S> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: S, config: FrameConfig) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: Box::new([0u8; READ_CHUNK_SIZE]),
            pending_start: 0,
            pending_end: 0,
            config,
        }
    }

    /// Read the next frame using the configured read timeout.
    pub fn read_frame(&mut self) -> Result<Frame> {
        self.read_frame_timeout(self.config.read_timeout)
    }

    /// Read the next frame, waiting at most `timeout` overall.
    ///
    /// Returns `FrameError::Timeout` when the deadline passes. A partially
    /// received frame is kept and completed by the next call.
    pub fn read_frame_timeout(&mut self, timeout: Duration) -> Result<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.drain_pending() {
                return Ok(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FrameError::Timeout(timeout));
            }

            match self.inner.receive(&mut self.chunk[..], remaining) {
                Ok(n) => {
                    trace!(bytes = n, "received");
                    self.pending_start = 0;
                    self.pending_end = n;
                }
                Err(err) if err.is_timeout() => return Err(FrameError::Timeout(timeout)),
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn drain_pending(&mut self) -> Option<Frame> {
        while self.pending_start < self.pending_end {
            let (used, state) = self
                .decoder
                .feed_slice(&self.chunk[self.pending_start..self.pending_end]);
            self.pending_start += used;

            match state {
                DecodeState::Complete => {
                    let frame = self.decoder.frame();
                    self.decoder.reset();
                    return frame;
                }
                DecodeState::Error => {
                    debug!(
                        fault = ?self.decoder.fault(),
                        errors = self.decoder.error_count(),
                        "dropping corrupt frame, resynchronizing"
                    );
                    self.decoder.reset();
                }
                _ => {}
            }
        }
        None
    }

    /// Return a frame that is already buffered or arrives within
    /// [`READY_POLL`], without blocking longer. `Ok(None)` when nothing is ready.
    pub fn poll_frame(&mut self) -> Result<Option<Frame>> {
        match self.read_frame_timeout(READY_POLL) {
            Ok(frame) => Ok(Some(frame)),
            Err(err) if err.is_timeout() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Number of corrupt frames dropped so far.
    pub fn error_count(&self) -> u64 {
        self.decoder.error_count()
    }

    /// Discard buffered bytes and any partial frame.
    pub fn clear(&mut self) {
        self.decoder.reset();
        self.pending_start = 0;
        self.pending_end = 0;
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}
