use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::ByteStream;

/// Smallest read timeout handed to the OS; a zero timeout means "block forever".
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);

/// TCP transport to a networked device.
///
/// Created unopened with [`TcpTransport::new`] (connects on `init`), or
/// already open from an accepted socket via [`TcpTransport::from_stream`].
#[derive(Debug)]
pub struct TcpTransport {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    peer_gone: bool,
}

impl TcpTransport {
    /// Resolve `addr` without connecting yet.
    pub fn new(addr: impl ToSocketAddrs) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(TransportError::InvalidArg("address resolved to nothing"))?;
        Ok(Self {
            addr,
            stream: None,
            peer_gone: false,
        })
    }

    /// Resolve and connect in one step.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut transport = Self::new(addr)?;
        transport.init()?;
        Ok(transport)
    }

    /// Wrap an already-connected socket (e.g. from [`TcpServer::accept`]).
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        Ok(Self {
            addr,
            stream: Some(stream),
            peer_gone: false,
        })
    }

    /// Remote address of this transport.
    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    fn stream_mut(&mut self) -> Result<&mut TcpStream> {
        self.stream.as_mut().ok_or(TransportError::NotInitialized)
    }
}

impl ByteStream for TcpTransport {
    fn init(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(TransportError::AlreadyInit);
        }
        let stream =
            TcpStream::connect(self.addr).map_err(|e| TransportError::connect(self.addr, e))?;
        // Frames are small and strictly request/response; Nagle only adds latency.
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "connected tcp transport");
        self.stream = Some(stream);
        self.peer_gone = false;
        Ok(())
    }

    fn send(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(TransportError::InvalidArg("empty send"));
        }
        let stream = self.stream_mut()?;
        match stream.write_all(data) {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::BrokenPipe
                        | ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                ) =>
            {
                self.peer_gone = true;
                Err(TransportError::Disconnected)
            }
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if buf.is_empty() {
            return Err(TransportError::InvalidArg("empty receive buffer"));
        }
        let stream = self.stream_mut()?;
        stream.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;

        loop {
            match stream.read(buf) {
                Ok(0) => {
                    self.peer_gone = true;
                    return Err(TransportError::Disconnected);
                }
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    return Err(TransportError::Timeout(timeout));
                }
                Err(err) if err.kind() == ErrorKind::ConnectionReset => {
                    self.peer_gone = true;
                    return Err(TransportError::Disconnected);
                }
                Err(err) => return Err(TransportError::Io(err)),
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some() && !self.peer_gone
    }

    fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            debug!(addr = %self.addr, "closing tcp transport");
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    fn flush(&mut self) -> Result<()> {
        self.stream_mut()?.flush().map_err(Into::into)
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Listening TCP socket handing out [`TcpTransport`]s.
pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Bind and listen on `addr`. Use port 0 to let the OS pick one.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or(TransportError::InvalidArg("address resolved to nothing"))?;
        let listener = TcpListener::bind(addr).map_err(|e| TransportError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "listening for firmware transfers");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<TcpTransport> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        TcpTransport::from_stream(stream)
    }

    /// Address the server is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
