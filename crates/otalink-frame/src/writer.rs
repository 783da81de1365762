use bytes::BytesMut;
use otalink_transport::ByteStream;
use tracing::trace;

use crate::codec::{encode_frame, Frame, MAX_FRAME_SIZE};
use crate::error::Result;

/// Encodes frames into a reusable buffer and sends them on a [`ByteStream`].
///
/// The writer does not own the stream, so it can share one with a
/// [`FrameReader`](crate::FrameReader):
///
/// ```ignore
/// writer.send(reader.get_mut(), msg_type, &payload)?;
/// ```
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Write a complete frame.
    pub fn write_frame<S>(&mut self, stream: &mut S, frame: &Frame) -> Result<()>
    where
        S: ByteStream + ?Sized,
    {
        self.send(stream, frame.msg_type, frame.payload.as_ref())
    }

    /// Encode and send one frame.
    pub fn send<S>(&mut self, stream: &mut S, msg_type: u8, payload: &[u8]) -> Result<()>
    where
        S: ByteStream + ?Sized,
    {
        self.buf.clear();
        encode_frame(msg_type, payload, &mut self.buf)?;
        trace!(msg_type, bytes = self.buf.len(), "sending frame");
        stream.send(&self.buf)?;
        stream.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FrameError;
    use crate::reader::FrameReader;
    use otalink_transport::MemoryStream;
    use std::time::Duration;

    #[test]
    fn test_writer_reader_pair() {
        let (mut host, device) = MemoryStream::pair();
        let mut writer = FrameWriter::new();
        let mut reader = FrameReader::new(device);

        writer.send(&mut host, 0x01, &[7u8; 68]).unwrap();
        writer
            .write_frame(&mut host, &Frame::new(0x03, Vec::new()))
            .unwrap();

        let timeout = Duration::from_secs(1);
        let begin = reader.read_frame_timeout(timeout).unwrap();
        assert_eq!(begin.msg_type, 0x01);
        assert_eq!(begin.payload.len(), 68);
        let end = reader.read_frame_timeout(timeout).unwrap();
        assert_eq!(end, Frame::new(0x03, Vec::new()));
    }

    #[test]
    fn test_shared_stream_round_trip() {
        let (host, device) = MemoryStream::pair();
        let mut host = FrameReader::new(host);
        let mut device = FrameReader::new(device);
        let mut writer = FrameWriter::new();
        let timeout = Duration::from_secs(1);

        writer.send(host.get_mut(), 0x03, &[]).unwrap();
        assert_eq!(device.read_frame_timeout(timeout).unwrap().msg_type, 0x03);
        writer.send(device.get_mut(), 0x04, &[0; 5]).unwrap();
        assert_eq!(host.read_frame_timeout(timeout).unwrap().msg_type, 0x04);
    }

    #[test]
    fn test_oversized_payload_sends_nothing() {
        let (mut host, device) = MemoryStream::pair();
        let mut writer = FrameWriter::new();
        let err = writer.send(&mut host, 0x02, &vec![0u8; 2000]).unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));

        let mut reader = FrameReader::new(device);
        assert!(reader
            .read_frame_timeout(Duration::from_millis(20))
            .unwrap_err()
            .is_timeout());
    }

    #[test]
    fn test_send_on_disconnected_stream() {
        let (mut host, _device) = MemoryStream::pair();
        host.disconnect();
        let mut writer = FrameWriter::new();
        assert!(matches!(
            writer.send(&mut host, 0x03, &[]),
            Err(FrameError::Transport(_))
        ));
    }
}
