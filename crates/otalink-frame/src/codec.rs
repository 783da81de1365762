use bytes::{BufMut, Bytes, BytesMut};

use crate::crc32;
use crate::error::{FrameError, Result};

/// First start marker.
pub const START0: u8 = 0xAA;

/// Second start marker.
pub const START1: u8 = 0x55;

/// Largest payload a frame may carry.
pub const MAX_PAYLOAD: usize = 1024;

/// Largest value of the length field (type byte + max payload).
pub const MAX_LENGTH: usize = MAX_PAYLOAD + 1;

/// Markers (2) + length (2) + type (1).
pub const HEADER_SIZE: usize = 5;

/// Trailing CRC32.
pub const CRC_SIZE: usize = 4;

/// Bytes a frame adds around its payload.
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + CRC_SIZE;

/// Largest possible encoded frame.
pub const MAX_FRAME_SIZE: usize = MAX_PAYLOAD + FRAME_OVERHEAD;

/// A decoded frame: message type plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type byte.
    pub msg_type: u8,
    /// The message payload (may be empty).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(msg_type: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }
}

fn frame_crc(msg_type: u8, payload: &[u8]) -> u32 {
    crc32::crc32(payload, crc32::update(&[msg_type], crc32::CRC32_INIT))
}

fn check_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }
    Ok(())
}

/// Encode a frame, appending it to `dst`.
///
/// Wire format:
/// ```text
/// ┌──────┬──────┬────────────┬──────┬───────────────┬──────────────┐
/// │ 0xAA │ 0x55 │ Length     │ Type │ Payload       │ CRC32        │
/// │      │      │ (2B LE)    │ (1B) │ (Length-1 B)  │ (4B LE)      │
/// └──────┴──────┴────────────┴──────┴───────────────┴──────────────┘
/// ```
/// `Length` counts the type byte and the payload. The CRC covers the same
/// bytes.
pub fn encode_frame(msg_type: u8, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    check_payload(payload)?;
    dst.reserve(FRAME_OVERHEAD + payload.len());
    dst.put_u8(START0);
    dst.put_u8(START1);
    dst.put_u16_le((payload.len() + 1) as u16);
    dst.put_u8(msg_type);
    dst.put_slice(payload);
    dst.put_u32_le(frame_crc(msg_type, payload));
    Ok(())
}

/// Encode a frame into a caller-provided buffer, returning the bytes written.
pub fn encode_frame_into(msg_type: u8, payload: &[u8], dst: &mut [u8]) -> Result<usize> {
    check_payload(payload)?;
    let total = FRAME_OVERHEAD + payload.len();
    if dst.len() < total {
        return Err(FrameError::BufferTooSmall {
            needed: total,
            available: dst.len(),
        });
    }

    let mut out = &mut dst[..total];
    out.put_u8(START0);
    out.put_u8(START1);
    out.put_u16_le((payload.len() + 1) as u16);
    out.put_u8(msg_type);
    out.put_slice(payload);
    out.put_u32_le(frame_crc(msg_type, payload));
    Ok(total)
}

/// Decoder state after the most recent byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    WaitStart0,
    WaitStart1,
    WaitLenLow,
    WaitLenHigh,
    ReceiveData,
    WaitCrc,
    /// A valid frame is available. Terminal until [`FrameDecoder::reset`].
    Complete,
    /// The frame was rejected. Terminal until [`FrameDecoder::reset`].
    Error,
}

/// Why the decoder entered [`DecodeState::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeFault {
    /// Length field outside `1..=MAX_LENGTH`.
    BadLength(u16),
    /// CRC trailer did not match the received bytes.
    BadCrc { expected: u32, actual: u32 },
}

/// Byte-at-a-time frame parser.
///
/// One decoder per stream. The receive buffer is part of the value, so
/// feeding bytes never allocates.
#[derive(Clone)]
pub struct FrameDecoder {
    state: DecodeState,
    length: u16,
    received: usize,
    data: [u8; MAX_LENGTH],
    crc: [u8; CRC_SIZE],
    crc_received: usize,
    fault: Option<DecodeFault>,
    errors: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("state", &self.state)
            .field("length", &self.length)
            .field("received", &self.received)
            .field("fault", &self.fault)
            .field("errors", &self.errors)
            .finish()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::WaitStart0,
            length: 0,
            received: 0,
            data: [0; MAX_LENGTH],
            crc: [0; CRC_SIZE],
            crc_received: 0,
            fault: None,
            errors: 0,
        }
    }

    /// Return to `WaitStart0`, dropping any partial or completed frame.
    ///
    /// The error counter is kept.
    pub fn reset(&mut self) {
        self.state = DecodeState::WaitStart0;
        self.length = 0;
        self.received = 0;
        self.crc_received = 0;
        self.fault = None;
    }

    /// Advance the state machine by one byte.
    pub fn feed(&mut self, byte: u8) -> DecodeState {
        self.state = match self.state {
            DecodeState::WaitStart0 => {
                if byte == START0 {
                    DecodeState::WaitStart1
                } else {
                    DecodeState::WaitStart0
                }
            }
            DecodeState::WaitStart1 => match byte {
                START1 => DecodeState::WaitLenLow,
                // A repeated first marker may be the real start.
                START0 => DecodeState::WaitStart1,
                _ => DecodeState::WaitStart0,
            },
            DecodeState::WaitLenLow => {
                self.length = u16::from(byte);
                DecodeState::WaitLenHigh
            }
            DecodeState::WaitLenHigh => {
                self.length |= u16::from(byte) << 8;
                if self.length == 0 || usize::from(self.length) > MAX_LENGTH {
                    self.fail(DecodeFault::BadLength(self.length))
                } else {
                    self.received = 0;
                    DecodeState::ReceiveData
                }
            }
            DecodeState::ReceiveData => {
                self.data[self.received] = byte;
                self.received += 1;
                if self.received == usize::from(self.length) {
                    self.crc_received = 0;
                    DecodeState::WaitCrc
                } else {
                    DecodeState::ReceiveData
                }
            }
            DecodeState::WaitCrc => {
                self.crc[self.crc_received] = byte;
                self.crc_received += 1;
                if self.crc_received == CRC_SIZE {
                    self.check_crc()
                } else {
                    DecodeState::WaitCrc
                }
            }
            terminal @ (DecodeState::Complete | DecodeState::Error) => terminal,
        };
        self.state
    }

    /// Feed bytes until a frame completes or fails, or `bytes` runs out.
    ///
    /// Returns how many bytes were consumed and the resulting state. Bytes
    /// after a terminal state are left for the caller.
    pub fn feed_slice(&mut self, bytes: &[u8]) -> (usize, DecodeState) {
        for (i, &b) in bytes.iter().enumerate() {
            if matches!(self.feed(b), DecodeState::Complete | DecodeState::Error) {
                return (i + 1, self.state);
            }
        }
        (bytes.len(), self.state)
    }

    fn check_crc(&mut self) -> DecodeState {
        let expected = u32::from_le_bytes(self.crc);
        let actual = crc32::crc32(&self.data[..usize::from(self.length)], crc32::CRC32_INIT);
        if expected == actual {
            DecodeState::Complete
        } else {
            self.fail(DecodeFault::BadCrc { expected, actual })
        }
    }

    fn fail(&mut self, fault: DecodeFault) -> DecodeState {
        self.fault = Some(fault);
        self.errors += 1;
        DecodeState::Error
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == DecodeState::Complete
    }

    pub fn is_error(&self) -> bool {
        self.state == DecodeState::Error
    }

    /// True when no frame is partially buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::WaitStart0
    }

    /// Message type of the completed frame.
    pub fn msg_type(&self) -> Option<u8> {
        self.is_complete().then_some(self.data[0])
    }

    /// Payload of the completed frame, borrowed from the decoder.
    pub fn payload(&self) -> Option<&[u8]> {
        self.is_complete()
            .then(|| &self.data[1..usize::from(self.length)])
    }

    /// Payload length of the completed frame, 0 otherwise.
    pub fn payload_len(&self) -> usize {
        if self.is_complete() {
            usize::from(self.length) - 1
        } else {
            0
        }
    }

    /// Copy the completed frame out of the decoder.
    pub fn frame(&self) -> Option<Frame> {
        let msg_type = self.msg_type()?;
        let payload = self.payload()?;
        Some(Frame::new(msg_type, Bytes::copy_from_slice(payload)))
    }

    /// Reason for the current `Error` state.
    pub fn fault(&self) -> Option<DecodeFault> {
        self.fault
    }

    /// Number of frames rejected since creation.
    pub fn error_count(&self) -> u64 {
        self.errors
    }
}
