//! Protocol detection
//!
//! Reads the first bytes of a connection, pushes them back onto the channel
//! and hands the channel to the first protocol handler that recognises them.

use super::consts::PROTOCOL_PEEK_LEN;
use super::{Socks4Handler, Socks5Handler};
use crate::channel::Channel;
use crate::error::is_cancelled;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A protocol the dispatcher can hand connections to
#[derive(Debug, Clone)]
pub enum ProtocolHandler {
    /// SOCKS4/4a
    Socks4(Socks4Handler),
    /// SOCKS5
    Socks5(Socks5Handler),
}

impl ProtocolHandler {
    /// Whether the connection's initial bytes belong to this protocol
    pub fn can_handle(&self, initial: &[u8]) -> bool {
        match self {
            ProtocolHandler::Socks4(handler) => handler.can_handle(initial),
            ProtocolHandler::Socks5(handler) => handler.can_handle(initial),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ProtocolHandler::Socks4(_) => "SOCKS4",
            ProtocolHandler::Socks5(_) => "SOCKS5",
        }
    }

    async fn handle(
        &self,
        channel: Channel,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        match self {
            ProtocolHandler::Socks4(handler) => handler.handle(channel, idle_timeout, cancel).await,
            ProtocolHandler::Socks5(handler) => handler.handle(channel, idle_timeout, cancel).await,
        }
    }
}

/// Selects the protocol handler for each accepted connection
#[derive(Debug, Clone)]
pub struct ProtocolDispatcher {
    handlers: Vec<ProtocolHandler>,
}

impl ProtocolDispatcher {
    /// Create a dispatcher trying `handlers` in order
    pub fn new(handlers: Vec<ProtocolHandler>) -> Self {
        ProtocolDispatcher { handlers }
    }

    /// Detect the protocol and run its handler to completion
    ///
    /// Failures are logged here and never returned; the channel is always
    /// closed by the time this returns.
    pub async fn dispatch(
        &self,
        mut channel: Channel,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) {
        let peer = channel.remote_addr();
        let mut initial = [0u8; PROTOCOL_PEEK_LEN];

        let read = tokio::select! {
            read = channel.read(&mut initial) => read,
            _ = cancel.cancelled() => {
                channel.close().await;
                return;
            }
        };

        let n = match read {
            Ok(0) => {
                debug!("{} closed before sending anything", peer);
                channel.close().await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                debug!("Failed to read from {}: {}", peer, e);
                channel.close().await;
                return;
            }
        };

        let initial = &initial[..n];
        let handler = match self.handlers.iter().find(|h| h.can_handle(initial)) {
            Some(handler) => handler,
            None => {
                warn!("Unrecognised protocol from {} (first byte {:#04x})", peer, initial[0]);
                channel.close().await;
                return;
            }
        };

        channel.unread(initial);
        debug!("{} speaks {}", peer, handler.name());

        match handler.handle(channel, idle_timeout, cancel).await {
            Ok(()) => debug!("{} session with {} finished", handler.name(), peer),
            Err(e) if is_cancelled(&e) => info!("{} session with {} cancelled", handler.name(), peer),
            Err(e) => debug!("{} session with {} ended: {:#}", handler.name(), peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutePolicy;
    use crate::socks::auth::NoAuth;
    use crate::socks::command::CommandChain;
    use crate::socks::ProxySettings;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncWriteExt};

    fn dispatcher(with_socks4: bool) -> ProtocolDispatcher {
        let policy = RoutePolicy::permissive();
        let settings = ProxySettings::default();
        let chain = Arc::new(CommandChain::new(policy.clone(), settings.clone()));

        let mut handlers = Vec::new();
        if with_socks4 {
            handlers.push(ProtocolHandler::Socks4(Socks4Handler::new(policy, settings)));
        }
        handlers.push(ProtocolHandler::Socks5(Socks5Handler::new(
            vec![NoAuth.into()],
            &[0x00],
            chain,
        )));
        ProtocolDispatcher::new(handlers)
    }

    fn channel() -> (Channel, tokio::io::DuplexStream) {
        let (client, server) = duplex(1024);
        (
            Channel::from_stream(server, "127.0.0.1:5000".parse().unwrap()),
            client,
        )
    }

    #[tokio::test]
    async fn test_dispatch_socks5() {
        let (channel, mut client) = channel();
        client.write_all(&[5, 1, 0]).await.unwrap();

        let dispatcher = dispatcher(true);
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch(channel, Duration::from_secs(30), &CancellationToken::new())
                .await
        });

        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_socks4_disabled() {
        let (channel, mut client) = channel();
        client.write_all(&[4, 1, 0, 80, 1, 2, 3, 4, 0]).await.unwrap();

        dispatcher(false)
            .dispatch(channel, Duration::from_secs(30), &CancellationToken::new())
            .await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_empty_connection() {
        let (channel, client) = channel();
        drop(client);

        dispatcher(true)
            .dispatch(channel, Duration::from_secs(30), &CancellationToken::new())
            .await;
    }

    #[tokio::test]
    async fn test_dispatch_unknown_protocol() {
        let (channel, mut client) = channel();
        client.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        dispatcher(true)
            .dispatch(channel, Duration::from_secs(30), &CancellationToken::new())
            .await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
