//! Per-connection handling
//!
//! Every admitted connection runs through the same steps on its own task:
//! the source address is checked against the access rules, TLS is
//! terminated when the listener asks for it, and the resulting channel is
//! handed to the protocol dispatcher.

use crate::channel::Channel;
use crate::error::ProxyError;
use crate::routing::AccessControl;
use crate::socks::ProtocolDispatcher;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Shared state for all connections of one listener
#[derive(Clone)]
pub struct ConnectionHandler {
    name: Arc<str>,
    access: Arc<AccessControl>,
    dispatcher: ProtocolDispatcher,
    tls: Option<TlsAcceptor>,
    idle_timeout: Duration,
    handshake_timeout: Duration,
}

impl std::fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("name", &self.name)
            .field("tls", &self.tls.is_some())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl ConnectionHandler {
    /// Create a handler for the listener called `name`
    pub fn new(
        name: &str,
        access: Arc<AccessControl>,
        dispatcher: ProtocolDispatcher,
        idle_timeout: Duration,
    ) -> Self {
        ConnectionHandler {
            name: Arc::from(name),
            access,
            dispatcher,
            tls: None,
            idle_timeout,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    /// Terminate TLS on accepted connections
    pub fn with_tls(mut self, acceptor: TlsAcceptor, handshake_timeout: Duration) -> Self {
        self.tls = Some(acceptor);
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Listener name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve one connection until it ends or `cancel` fires
    pub async fn handle(&self, mut channel: Channel, cancel: CancellationToken) {
        let peer = channel.remote_addr();

        if !self.access.is_source_allowed(peer.ip()) {
            debug!("[{}] Source {} denied by access rules", self.name, peer);
            channel.close().await;
            return;
        }

        let channel = match &self.tls {
            Some(acceptor) => match self.accept_tls(acceptor, channel, &cancel).await {
                Ok(channel) => channel,
                Err(e) => {
                    if crate::error::is_cancelled(&e) {
                        info!("[{}] TLS handshake with {} cancelled", self.name, peer);
                    } else {
                        debug!("[{}] TLS handshake with {} failed: {:#}", self.name, peer, e);
                    }
                    return;
                }
            },
            None => channel,
        };

        debug!("[{}] Accepted connection from {}", self.name, peer);
        self.dispatcher
            .dispatch(channel, self.idle_timeout, &cancel)
            .await;
    }

    async fn accept_tls(
        &self,
        acceptor: &TlsAcceptor,
        channel: Channel,
        cancel: &CancellationToken,
    ) -> Result<Channel> {
        let handshake = tokio::time::timeout(self.handshake_timeout, acceptor.accept(channel));

        tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::Cancelled.into()),
            result = handshake => {
                let stream = result
                    .map_err(|_| ProxyError::Tls("handshake timed out".to_string()))?
                    .map_err(|e| ProxyError::Tls(e.to_string()))?;
                Ok(Channel::tls(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{AccessRule, RoutePolicy, RuleTarget, RuleType};
    use crate::socks::auth::NoAuth;
    use crate::socks::command::CommandChain;
    use crate::socks::{ProtocolHandler, ProxySettings, Socks5Handler};
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    fn handler(rules: Vec<AccessRule>) -> ConnectionHandler {
        let policy = RoutePolicy::permissive();
        let chain = Arc::new(CommandChain::new(policy, ProxySettings::default()));
        let dispatcher = ProtocolDispatcher::new(vec![ProtocolHandler::Socks5(
            Socks5Handler::new(vec![NoAuth.into()], &[0x00], chain),
        )]);
        ConnectionHandler::new(
            "test",
            Arc::new(AccessControl::new(rules)),
            dispatcher,
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_allowed_source_is_dispatched() {
        let (mut client, server) = duplex(1024);
        let channel = Channel::from_stream(server, "10.0.0.7:4000".parse().unwrap());
        let handler = handler(vec![AccessRule::new(
            RuleType::Allow,
            RuleTarget::SourceIp,
            "10.0.*",
        )]);

        let task = tokio::spawn(async move { handler.handle(channel, CancellationToken::new()).await });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_denied_source_closed_silently() {
        let (mut client, server) = duplex(1024);
        let channel = Channel::from_stream(server, "192.0.2.1:4000".parse().unwrap());
        let handler = handler(vec![AccessRule::new(
            RuleType::Deny,
            RuleTarget::SourceIp,
            "192.0.2.*",
        )]);

        client.write_all(&[5, 1, 0]).await.unwrap();
        handler.handle(channel, CancellationToken::new()).await;

        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_tls_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

        let acceptor = crate::transport::load_tls_acceptor(&crate::config::TlsConfig {
            enabled: true,
            cert_path: Some(cert_path),
            key_path: Some(key_path),
            password: None,
        })
        .unwrap();

        let handler = handler(Vec::new()).with_tls(acceptor, Duration::from_millis(100));
        let (_client, server) = duplex(1024);
        let channel = Channel::from_stream(server, "127.0.0.1:4000".parse().unwrap());

        // A client that never sends a ClientHello is dropped after the timeout
        tokio::time::timeout(
            Duration::from_secs(5),
            handler.handle(channel, CancellationToken::new()),
        )
        .await
        .unwrap();
    }
}
