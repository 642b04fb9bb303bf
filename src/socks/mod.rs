//! SOCKS protocol handling
//!
//! This module implements the SOCKS4/4a and SOCKS5 state machines on top of
//! a [`Channel`](crate::channel::Channel): protocol detection, SOCKS5 method
//! negotiation and authentication, the command chain, the relay engine and
//! the UDP relay session.

pub mod auth;
pub mod command;
pub mod consts;
mod dispatcher;
mod relay;
mod socks4;
mod socks5;
pub mod types;
pub mod udp;

pub use dispatcher::{ProtocolDispatcher, ProtocolHandler};
pub use relay::relay;
pub use socks4::Socks4Handler;
pub use socks5::Socks5Handler;
pub use types::{SocksCommand, TargetAddr};

use crate::config::ServerConfig;
use crate::error::ProxyError;
use crate::transport::{connect_tcp, SocketOpts};
use anyhow::Result;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Outbound connection settings shared by the protocol handlers
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Upper bound on an outbound TCP connect
    pub connect_timeout: Duration,
    /// Report the outbound socket's local endpoint in CONNECT replies
    pub report_bound_address: bool,
    /// Options applied to outbound sockets
    pub socket_opts: SocketOpts,
}

impl Default for ProxySettings {
    fn default() -> Self {
        ProxySettings {
            connect_timeout: Duration::from_secs(10),
            report_bound_address: false,
            socket_opts: SocketOpts::default(),
        }
    }
}

impl ProxySettings {
    /// Settings from the `[server]` section
    pub fn from_server_config(config: &ServerConfig) -> Self {
        ProxySettings {
            connect_timeout: config.connect_timeout(),
            report_bound_address: config.report_bound_address,
            socket_opts: SocketOpts::from_tcp_config(&config.tcp),
        }
    }

    /// Dial `addr`, giving up early when `cancel` fires
    pub async fn dial(&self, addr: SocketAddr, cancel: &CancellationToken) -> Result<TcpStream> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProxyError::Cancelled.into()),
            stream = connect_tcp(addr, self.connect_timeout, &self.socket_opts) => stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TcpConfig;

    #[test]
    fn test_settings_from_server_config() {
        let config = ServerConfig {
            connect_timeout: 3,
            report_bound_address: true,
            tcp: TcpConfig {
                nodelay: false,
                keepalive_secs: 30,
                keepalive_interval: 10,
            },
            ..ServerConfig::default()
        };

        let settings = ProxySettings::from_server_config(&config);
        assert_eq!(settings.connect_timeout, Duration::from_secs(3));
        assert!(settings.report_bound_address);
        assert!(!settings.socket_opts.nodelay);
    }

    #[tokio::test]
    async fn test_dial_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        // TEST-NET-1, never answers
        let err = ProxySettings::default()
            .dial("192.0.2.1:9".parse().unwrap(), &cancel)
            .await
            .unwrap_err();
        assert!(crate::error::is_cancelled(&err));
    }
}
