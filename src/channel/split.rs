//! Split-port stream
//!
//! A client in split channel mode opens two TCP connections: one it writes
//! its upstream bytes into (accepted on the listener's read port) and one it
//! reads downstream bytes from (accepted on the write port). This stream
//! reads from the first and writes to the second.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Read half and write half carried by two sockets
#[derive(Debug)]
pub struct SplitPortStream {
    reader: TcpStream,
    writer: TcpStream,
}

impl SplitPortStream {
    /// Compose a stream from the socket to read from and the socket to write to
    pub fn new(reader: TcpStream, writer: TcpStream) -> Self {
        SplitPortStream { reader, writer }
    }

    /// Remote endpoint of the read socket
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.reader.peer_addr()
    }

    /// Local endpoint of the read socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.reader.local_addr()
    }
}

impl AsyncRead for SplitPortStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for SplitPortStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().writer).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().writer).poll_shutdown(cx)
    }
}
