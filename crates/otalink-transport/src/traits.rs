use std::time::Duration;

use crate::error::Result;

/// A bidirectional byte stream to a device or host.
///
/// Implementations must preserve byte order but need not preserve write
/// boundaries: a single `send` may arrive as several `receive` results and
/// several sends may be coalesced into one. Framing is layered on top.
pub trait ByteStream {
    /// Open the underlying channel.
    ///
    /// Returns [`TransportError::AlreadyInit`](crate::TransportError::AlreadyInit)
    /// when the stream is already open.
    fn init(&mut self) -> Result<()>;

    /// Transmit all of `data`, blocking until it has been handed to the link.
    fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive up to `buf.len()` bytes, waiting at most `timeout`.
    ///
    /// Returns the number of bytes written into `buf` (always non-zero on
    /// success) or [`TransportError::Timeout`](crate::TransportError::Timeout)
    /// when nothing arrived in time.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Whether the stream is open and the remote end is still attached.
    fn is_connected(&self) -> bool;

    /// Close the stream. Safe to call more than once.
    fn disconnect(&mut self);

    /// Flush buffered output. Transports without buffering need not override.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<S: ByteStream + ?Sized> ByteStream for &mut S {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).receive(buf, timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn init(&mut self) -> Result<()> {
        (**self).init()
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        (**self).send(data)
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).receive(buf, timeout)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}
