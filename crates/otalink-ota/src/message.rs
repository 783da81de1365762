//! Transfer messages carried in frame payloads.
//!
//! All multi-byte fields are little-endian and read field by field.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use otalink_frame::MAX_PAYLOAD;
use serde::Serialize;

use crate::error::{OtaError, Result};

/// SHA-256 digest length.
pub const SHA256_SIZE: usize = 32;

/// Width of the null-padded version field in Begin.
pub const VERSION_FIELD_SIZE: usize = 32;

/// Longest version string a sender may put in Begin.
pub const MAX_VERSION_LEN: usize = VERSION_FIELD_SIZE - 1;

/// Begin payload: size (4) + digest (32) + version (32).
pub const BEGIN_SIZE: usize = 4 + SHA256_SIZE + VERSION_FIELD_SIZE;

/// Data header: offset (4) + length (2).
pub const DATA_HEADER_SIZE: usize = 6;

/// Ack payload: status (1) + next offset (4).
pub const ACK_SIZE: usize = 5;

/// Abort payload: reason (1).
pub const ABORT_SIZE: usize = 1;

/// Largest chunk a Data message can carry in one frame.
pub const MAX_DATA_LEN: usize = MAX_PAYLOAD - DATA_HEADER_SIZE;

/// Nominal chunk size: the largest 8-byte aligned chunk that fits.
pub const MAX_CHUNK: usize = MAX_DATA_LEN & !7;

/// Message type IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Start a transfer (host to device).
    Begin = 0x01,
    /// One firmware chunk (host to device).
    Data = 0x02,
    /// All chunks sent (host to device).
    End = 0x03,
    /// Acknowledgement (device to host).
    Ack = 0x04,
    /// Session termination (either direction).
    Abort = 0x05,
}

impl MsgType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(MsgType::Begin),
            0x02 => Some(MsgType::Data),
            0x03 => Some(MsgType::End),
            0x04 => Some(MsgType::Ack),
            0x05 => Some(MsgType::Abort),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MsgType::Begin => "begin",
            MsgType::Data => "data",
            MsgType::End => "end",
            MsgType::Ack => "ack",
            MsgType::Abort => "abort",
        }
    }
}

/// Status carried in Ack and Abort payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Ok,
    Busy,
    FlashError,
    VerifyFailed,
    SizeMismatch,
    OffsetMismatch,
    VersionError,
    PartitionError,
    Aborted,
    /// A code this implementation does not know.
    Unknown(u8),
}

impl TransferStatus {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TransferStatus::Ok,
            1 => TransferStatus::Busy,
            2 => TransferStatus::FlashError,
            3 => TransferStatus::VerifyFailed,
            4 => TransferStatus::SizeMismatch,
            5 => TransferStatus::OffsetMismatch,
            6 => TransferStatus::VersionError,
            7 => TransferStatus::PartitionError,
            8 => TransferStatus::Aborted,
            other => TransferStatus::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            TransferStatus::Ok => 0,
            TransferStatus::Busy => 1,
            TransferStatus::FlashError => 2,
            TransferStatus::VerifyFailed => 3,
            TransferStatus::SizeMismatch => 4,
            TransferStatus::OffsetMismatch => 5,
            TransferStatus::VersionError => 6,
            TransferStatus::PartitionError => 7,
            TransferStatus::Aborted => 8,
            TransferStatus::Unknown(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == TransferStatus::Ok
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferStatus::Ok => f.write_str("ok"),
            TransferStatus::Busy => f.write_str("busy"),
            TransferStatus::FlashError => f.write_str("flash error"),
            TransferStatus::VerifyFailed => f.write_str("verify failed"),
            TransferStatus::SizeMismatch => f.write_str("size mismatch"),
            TransferStatus::OffsetMismatch => f.write_str("offset mismatch"),
            TransferStatus::VersionError => f.write_str("version error"),
            TransferStatus::PartitionError => f.write_str("partition error"),
            TransferStatus::Aborted => f.write_str("aborted"),
            TransferStatus::Unknown(code) => write!(f, "unknown status {code}"),
        }
    }
}

/// Begin: announces an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Begin {
    pub firmware_size: u32,
    pub sha256: [u8; SHA256_SIZE],
    pub version: String,
}

impl Begin {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let version = self.version.as_bytes();
        if version.len() > MAX_VERSION_LEN {
            return Err(OtaError::InvalidArg(format!(
                "version string is {} bytes, max {MAX_VERSION_LEN}",
                version.len()
            )));
        }
        dst.reserve(BEGIN_SIZE);
        dst.put_u32_le(self.firmware_size);
        dst.put_slice(&self.sha256);
        dst.put_slice(version);
        dst.put_bytes(0, VERSION_FIELD_SIZE - version.len());
        Ok(())
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() < BEGIN_SIZE {
            return Err(OtaError::protocol("begin", "payload shorter than header"));
        }
        let firmware_size = payload.get_u32_le();
        let mut sha256 = [0u8; SHA256_SIZE];
        payload.copy_to_slice(&mut sha256);
        // The field is not null-terminated when the version fills it.
        let field = &payload[..VERSION_FIELD_SIZE];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        let version = std::str::from_utf8(&field[..end])
            .map_err(|_| OtaError::protocol("begin", "version is not utf-8"))?
            .to_owned();
        Ok(Self {
            firmware_size,
            sha256,
            version,
        })
    }
}

/// Data: one chunk of the image, borrowed from the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunk<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> DataChunk<'a> {
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.data.len() > MAX_DATA_LEN {
            return Err(OtaError::InvalidArg(format!(
                "chunk is {} bytes, max {MAX_DATA_LEN}",
                self.data.len()
            )));
        }
        dst.reserve(DATA_HEADER_SIZE + self.data.len());
        dst.put_u32_le(self.offset);
        dst.put_u16_le(self.data.len() as u16);
        dst.put_slice(self.data);
        Ok(())
    }

    pub fn decode(payload: &'a [u8]) -> Result<Self> {
        if payload.len() < DATA_HEADER_SIZE {
            return Err(OtaError::protocol("data", "payload shorter than header"));
        }
        let mut header = &payload[..DATA_HEADER_SIZE];
        let offset = header.get_u32_le();
        let len = usize::from(header.get_u16_le());
        if payload.len() < DATA_HEADER_SIZE + len {
            return Err(OtaError::protocol("data", "chunk length exceeds payload"));
        }
        Ok(Self {
            offset,
            data: &payload[DATA_HEADER_SIZE..DATA_HEADER_SIZE + len],
        })
    }
}

/// Ack: receiver status and the offset it expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub status: TransferStatus,
    pub next_offset: u32,
}

impl Ack {
    pub fn ok(next_offset: u32) -> Self {
        Self {
            status: TransferStatus::Ok,
            next_offset,
        }
    }

    pub fn status(status: TransferStatus, next_offset: u32) -> Self {
        Self {
            status,
            next_offset,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(ACK_SIZE);
        dst.put_u8(self.status.as_u8());
        dst.put_u32_le(self.next_offset);
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        if payload.len() < ACK_SIZE {
            return Err(OtaError::protocol("ack", "payload shorter than header"));
        }
        let status = TransferStatus::from_u8(payload.get_u8());
        let next_offset = payload.get_u32_le();
        Ok(Self {
            status,
            next_offset,
        })
    }
}

/// A decoded transfer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message<'a> {
    Begin(Begin),
    Data(DataChunk<'a>),
    End,
    Ack(Ack),
    Abort(TransferStatus),
}

impl<'a> Message<'a> {
    /// Interpret a frame's type byte and payload.
    pub fn decode(msg_type: u8, payload: &'a [u8]) -> Result<Self> {
        match MsgType::from_u8(msg_type) {
            Some(MsgType::Begin) => Begin::decode(payload).map(Message::Begin),
            Some(MsgType::Data) => DataChunk::decode(payload).map(Message::Data),
            Some(MsgType::End) => Ok(Message::End),
            Some(MsgType::Ack) => Ack::decode(payload).map(Message::Ack),
            Some(MsgType::Abort) => match payload.first() {
                Some(&reason) => Ok(Message::Abort(TransferStatus::from_u8(reason))),
                None => Err(OtaError::protocol("abort", "empty payload")),
            },
            None => Err(OtaError::UnknownMessage(msg_type)),
        }
    }

    pub fn msg_type(&self) -> MsgType {
        match self {
            Message::Begin(_) => MsgType::Begin,
            Message::Data(_) => MsgType::Data,
            Message::End => MsgType::End,
            Message::Ack(_) => MsgType::Ack,
            Message::Abort(_) => MsgType::Abort,
        }
    }

    /// Serialize the payload (without framing) into `dst`.
    pub fn encode_payload(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Message::Begin(begin) => begin.encode(dst),
            Message::Data(chunk) => chunk.encode(dst),
            Message::End => Ok(()),
            Message::Ack(ack) => {
                ack.encode(dst);
                Ok(())
            }
            Message::Abort(reason) => {
                dst.put_u8(reason.as_u8());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(msg: &Message<'_>) -> Vec<u8> {
        let mut buf = BytesMut::new();
        msg.encode_payload(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_chunk_constants() {
        assert_eq!(BEGIN_SIZE, 68);
        assert_eq!(MAX_DATA_LEN, 1018);
        assert_eq!(MAX_CHUNK, 1016);
    }

    #[test]
    fn test_begin_layout() {
        let begin = Begin {
            firmware_size: 2048,
            sha256: [0x11; 32],
            version: "v1.2.3".into(),
        };
        let bytes = payload_of(&Message::Begin(begin.clone()));
        assert_eq!(bytes.len(), BEGIN_SIZE);
        assert_eq!(&bytes[..4], &[0x00, 0x08, 0x00, 0x00]);
        assert_eq!(&bytes[36..42], b"v1.2.3");
        assert!(bytes[42..].iter().all(|&b| b == 0));
        assert_eq!(Begin::decode(&bytes).unwrap(), begin);
    }

    #[test]
    fn test_begin_full_width_version_field() {
        let mut bytes = vec![0u8; BEGIN_SIZE];
        bytes[36..].copy_from_slice(&[b'x'; VERSION_FIELD_SIZE]);
        let begin = Begin::decode(&bytes).unwrap();
        assert_eq!(begin.version.len(), VERSION_FIELD_SIZE);
    }

    #[test]
    fn test_begin_rejects_long_version() {
        let begin = Begin {
            firmware_size: 1,
            sha256: [0; 32],
            version: "v".repeat(32),
        };
        let mut buf = BytesMut::new();
        assert!(matches!(begin.encode(&mut buf), Err(OtaError::InvalidArg(_))));
    }

    #[test]
    fn test_begin_short_payload() {
        assert!(matches!(
            Begin::decode(&[0u8; BEGIN_SIZE - 1]),
            Err(OtaError::Protocol { kind: "begin", .. })
        ));
    }

    #[test]
    fn test_data_layout() {
        let chunk = DataChunk {
            offset: 1024,
            data: &[1, 2, 3],
        };
        let bytes = payload_of(&Message::Data(chunk));
        assert_eq!(bytes, vec![0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 1, 2, 3]);
        assert_eq!(DataChunk::decode(&bytes).unwrap(), chunk);
    }

    #[test]
    fn test_data_inner_length_must_fit_payload() {
        // Advertises 10 bytes but carries 3.
        let bytes = [0, 0, 0, 0, 10, 0, 1, 2, 3];
        assert!(matches!(
            DataChunk::decode(&bytes),
            Err(OtaError::Protocol { kind: "data", .. })
        ));
    }

    #[test]
    fn test_data_ignores_trailing_padding() {
        let bytes = [0, 0, 0, 0, 2, 0, 9, 8, 0xFF, 0xFF];
        assert_eq!(DataChunk::decode(&bytes).unwrap().data, &[9, 8]);
    }

    #[test]
    fn test_ack_layout() {
        let bytes = payload_of(&Message::Ack(Ack::ok(2048)));
        assert_eq!(bytes, vec![0x00, 0x00, 0x08, 0x00, 0x00]);
        assert_eq!(Ack::decode(&bytes).unwrap(), Ack::ok(2048));
    }

    #[test]
    fn test_status_codes_are_lossless() {
        for code in 0..=u8::MAX {
            assert_eq!(TransferStatus::from_u8(code).as_u8(), code);
        }
        assert_eq!(TransferStatus::from_u8(3), TransferStatus::VerifyFailed);
        assert_eq!(TransferStatus::from_u8(42), TransferStatus::Unknown(42));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&TransferStatus::VerifyFailed).unwrap();
        assert_eq!(json, "\"verify_failed\"");
    }

    #[test]
    fn test_message_dispatch() {
        assert_eq!(Message::decode(0x03, &[]).unwrap(), Message::End);
        assert_eq!(
            Message::decode(0x05, &[8]).unwrap(),
            Message::Abort(TransferStatus::Aborted)
        );
        assert!(matches!(
            Message::decode(0x05, &[]),
            Err(OtaError::Protocol { kind: "abort", .. })
        ));
        assert!(matches!(
            Message::decode(0x20, &[]),
            Err(OtaError::UnknownMessage(0x20))
        ));
    }
}
