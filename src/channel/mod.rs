//! Channel abstraction
//!
//! A [`Channel`] is one live bidirectional byte stream to a peer. It hides
//! whether the bytes travel over a plain TCP socket, a pair of split-port
//! sockets, a TLS session or any other negotiated stream, so the protocol
//! handlers and the relay only ever see `AsyncRead + AsyncWrite`.
//!
//! A channel owns its transport exclusively. [`Channel::close`] shuts the
//! transport down and releases it exactly once; later calls are no-ops and
//! any read or write after close fails with `NotConnected`.

mod split;

pub use split::SplitPortStream;

use crate::transport::StreamDyn;
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tracing::trace;

/// Upper bound on a graceful shutdown during close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + ?Sized> Io for T {}

enum Transport {
    Tcp(TcpStream),
    Split(SplitPortStream),
    Tls(Box<TlsStream<Channel>>),
    Stream(Box<dyn StreamDyn>),
}

impl Transport {
    fn io(&mut self) -> &mut dyn Io {
        match self {
            Transport::Tcp(stream) => stream,
            Transport::Split(stream) => stream,
            Transport::Tls(stream) => stream,
            Transport::Stream(stream) => stream,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Transport::Tcp(_) => "tcp",
            Transport::Split(_) => "split",
            Transport::Tls(_) => "tls",
            Transport::Stream(_) => "stream",
        }
    }
}

/// A bidirectional byte stream to one peer
pub struct Channel {
    transport: Option<Transport>,
    remote_addr: SocketAddr,
    local_addr: Option<SocketAddr>,
    pushback: BytesMut,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field(
                "transport",
                &self.transport.as_ref().map(Transport::kind).unwrap_or("closed"),
            )
            .field("remote_addr", &self.remote_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Channel {
    fn with_transport(
        transport: Transport,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Channel {
            transport: Some(transport),
            remote_addr,
            local_addr,
            pushback: BytesMut::new(),
        }
    }

    /// Wrap an accepted or dialed TCP socket
    pub fn tcp(stream: TcpStream) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr().ok();
        Ok(Channel::with_transport(
            Transport::Tcp(stream),
            remote_addr,
            local_addr,
        ))
    }

    /// Wrap a paired read/write socket couple; the remote endpoint is the read socket's
    pub fn split(stream: SplitPortStream) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr().ok();
        Ok(Channel::with_transport(
            Transport::Split(stream),
            remote_addr,
            local_addr,
        ))
    }

    /// Wrap a server-side TLS session established over another channel
    pub fn tls(stream: TlsStream<Channel>) -> Self {
        let (inner, _) = stream.get_ref();
        let remote_addr = inner.remote_addr();
        let local_addr = inner.local_addr();
        Channel::with_transport(Transport::Tls(Box::new(stream)), remote_addr, local_addr)
    }

    /// Wrap any other stream, such as a negotiated security layer
    pub fn from_stream<S>(stream: S, remote_addr: SocketAddr) -> Self
    where
        S: StreamDyn + 'static,
    {
        Channel::with_transport(Transport::Stream(Box::new(stream)), remote_addr, None)
    }

    /// Move the transport out, leaving a closed channel behind
    pub fn take_transport(&mut self) -> Channel {
        let closed = Channel {
            transport: None,
            remote_addr: self.remote_addr,
            local_addr: self.local_addr,
            pushback: BytesMut::new(),
        };
        std::mem::replace(self, closed)
    }

    /// Remote endpoint
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Local endpoint, when the transport is socket-backed
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Whether the channel still owns an open transport
    pub fn is_connected(&self) -> bool {
        self.transport.is_some()
    }

    /// Push bytes back so the next reads return them before transport data
    pub fn unread(&mut self, data: &[u8]) {
        if data.is_empty() || self.transport.is_none() {
            return;
        }
        let mut buf = BytesMut::with_capacity(data.len() + self.pushback.len());
        buf.extend_from_slice(data);
        buf.extend_from_slice(&self.pushback);
        self.pushback = buf;
    }

    /// Shut down and release the transport
    ///
    /// Safe to call any number of times; only the first call touches the
    /// transport.
    pub async fn close(&mut self) {
        self.pushback.clear();
        if let Some(mut transport) = self.transport.take() {
            let kind = transport.kind();
            match tokio::time::timeout(CLOSE_TIMEOUT, transport.io().shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => trace!("Shutdown of {} channel {} failed: {}", kind, self.remote_addr, e),
                Err(_) => trace!("Shutdown of {} channel {} timed out", kind, self.remote_addr),
            }
            drop(transport);
            trace!("Closed {} channel to {}", kind, self.remote_addr);
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is closed")
}

impl AsyncRead for Channel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.pushback.is_empty() {
            let n = this.pushback.len().min(buf.remaining());
            let chunk = this.pushback.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }

        match this.transport.as_mut() {
            Some(transport) => Pin::new(transport.io()).poll_read(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport.io()).poll_write(cx, buf),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport.io()).poll_flush(cx),
            None => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().transport.as_mut() {
            Some(transport) => Pin::new(transport.io()).poll_shutdown(cx),
            None => Poll::Ready(Ok(())),
        }
    }
}
