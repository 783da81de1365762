use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::ByteStream;

/// One end of an in-memory, channel-backed byte stream.
///
/// Created in connected pairs by [`MemoryStream::pair`]. Each `send` becomes a
/// single message on the peer's queue; `receive` may hand it out across
/// several calls when the caller's buffer is smaller.
#[derive(Debug)]
pub struct MemoryStream {
    tx: Option<Sender<Bytes>>,
    rx: Receiver<Bytes>,
    pending: Bytes,
    open: bool,
    peer_gone: bool,
}

impl MemoryStream {
    /// Create two connected, already-open endpoints.
    pub fn pair() -> (Self, Self) {
        let (left_tx, right_rx) = mpsc::channel();
        let (right_tx, left_rx) = mpsc::channel();
        (Self::new(left_tx, left_rx), Self::new(right_tx, right_rx))
    }

    fn new(tx: Sender<Bytes>, rx: Receiver<Bytes>) -> Self {
        Self {
            tx: Some(tx),
            rx,
            pending: Bytes::new(),
            open: true,
            peer_gone: false,
        }
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

impl ByteStream for MemoryStream {
    fn init(&mut self) -> Result<()> {
        if self.open {
            return Err(TransportError::AlreadyInit);
        }
        // A closed in-memory endpoint cannot be re-attached to its peer.
        Err(TransportError::Disconnected)
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.open {
            return Err(TransportError::NotInitialized);
        }
        if data.is_empty() {
            return Err(TransportError::InvalidArg("empty send"));
        }
        let tx = self.tx.as_ref().ok_or(TransportError::NotInitialized)?;
        tx.send(Bytes::copy_from_slice(data)).map_err(|_| {
            self.peer_gone = true;
            TransportError::Disconnected
        })
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.open {
            return Err(TransportError::NotInitialized);
        }
        if buf.is_empty() {
            return Err(TransportError::InvalidArg("empty receive buffer"));
        }
        if !self.pending.is_empty() {
            return Ok(self.drain_pending(buf));
        }

        match self.rx.recv_timeout(timeout) {
            Ok(chunk) => {
                self.pending = chunk;
                Ok(self.drain_pending(buf))
            }
            Err(RecvTimeoutError::Timeout) => Err(TransportError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                self.peer_gone = true;
                Err(TransportError::Disconnected)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.open && !self.peer_gone
    }

    fn disconnect(&mut self) {
        if self.open {
            debug!("closing in-memory stream");
        }
        self.open = false;
        self.tx = None;
        self.pending = Bytes::new();
    }
}
