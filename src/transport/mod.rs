//! Sockets and streams
//!
//! Listener binding, the outbound dialer and TLS acceptor loading, plus
//! the per-socket tuning applied to every client and upstream connection.

mod tcp;
mod tls;

pub use tcp::{bind_listener, connect_tcp};
pub use tls::load_tls_acceptor;

use crate::config::TcpConfig;
use socket2::{SockRef, TcpKeepalive};
use std::fmt::Debug;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Per-socket tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOpts {
    /// `TCP_NODELAY`
    pub nodelay: bool,
    /// Keepalive probing; `None` leaves the OS default
    pub keepalive: Option<Keepalive>,
}

/// TCP keepalive timers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    /// Idle time before the first probe
    pub idle: Duration,
    /// Gap between probes
    pub interval: Duration,
}

impl Default for SocketOpts {
    fn default() -> Self {
        Self::from_tcp_config(&TcpConfig::default())
    }
}

impl SocketOpts {
    /// Options described by the `[server.tcp]` table
    ///
    /// A zero keepalive time disables keepalive tuning.
    pub fn from_tcp_config(config: &TcpConfig) -> Self {
        let keepalive = (config.keepalive_secs > 0).then(|| Keepalive {
            idle: Duration::from_secs(config.keepalive_secs),
            interval: Duration::from_secs(config.keepalive_interval.max(1)),
        });
        SocketOpts {
            nodelay: config.nodelay,
            keepalive,
        }
    }

    /// Apply to a connected stream
    pub fn apply(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if let Some(keepalive) = self.keepalive {
            let params = TcpKeepalive::new()
                .with_time(keepalive.idle)
                .with_interval(keepalive.interval);
            SockRef::from(stream).set_tcp_keepalive(&params)?;
        }
        Ok(())
    }

    /// [`apply`](Self::apply), but a failure is only logged
    pub fn hint(&self, stream: &TcpStream) {
        if let Err(e) = self.apply(stream) {
            tracing::warn!("Failed to tune socket: {}", e);
        }
    }
}

/// Object-safe bound for streams a [`Channel`](crate::channel::Channel) can own
pub trait StreamDyn: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}

impl<T> StreamDyn for T where T: AsyncRead + AsyncWrite + Unpin + Send + Sync + Debug {}
