//! TCP networking layer
//!
//! Wraps one stream together with its peer address and the per-operation
//! timeout, so every wire step a session takes is bounded the same way.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use courier_core::codec::{self, deadline, write_all_timed};
use courier_core::{Direction, FrameError, FrameHeader, FrameLimits, ReplyStatus};

/// One connection, owned by exactly one session
///
/// Generic over the stream so sessions can be driven over in-memory pipes.
pub struct Connection<S = TcpStream> {
    stream: S,
    peer: Option<SocketAddr>,
    io_timeout: Option<Duration>,
}

impl Connection<TcpStream> {
    pub fn from_tcp(stream: TcpStream, io_timeout: Option<Duration>) -> Self {
        let peer = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Self::new(stream, peer, io_timeout)
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, peer: Option<SocketAddr>, io_timeout: Option<Duration>) -> Self {
        Self {
            stream,
            peer,
            io_timeout,
        }
    }

    /// Get remote address
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        write_all_timed(&mut self.stream, buf, self.io_timeout).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        deadline(self.io_timeout, self.stream.flush()).await
    }

    pub async fn read_command(&mut self) -> Result<Direction, FrameError> {
        deadline(self.io_timeout, codec::read_command(&mut self.stream)).await
    }

    pub async fn read_status(&mut self) -> Result<ReplyStatus, FrameError> {
        deadline(self.io_timeout, codec::read_status(&mut self.stream)).await
    }

    /// Read one frame header; the whole header shares a single timeout
    pub async fn read_header(&mut self, limits: &FrameLimits) -> Result<FrameHeader, FrameError> {
        deadline(self.io_timeout, codec::read_header(&mut self.stream, limits)).await
    }

    /// Close the connection
    ///
    /// Consumes the connection so it cannot be reused. Shutdown errors only
    /// mean the peer is already gone.
    pub async fn close(mut self) {
        if let Err(e) = deadline(self.io_timeout, self.stream.shutdown()).await {
            debug!("Shutdown of connection to {:?} failed: {}", self.peer, e);
        }
    }
}

/// Connect to a server, bounded by `connect_timeout`
pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> io::Result<TcpStream> {
    let stream = deadline(Some(connect_timeout), TcpStream::connect((host, port))).await?;
    info!("Connected to {}:{}", host, port);
    Ok(stream)
}
