//! UDP relay session for one UDP ASSOCIATE
//!
//! A session owns one UDP socket. Datagrams from the client endpoint are
//! unwrapped and forwarded to their destination; datagrams from a remote
//! endpoint the client has sent to are wrapped and returned to the client.
//! Everything else is dropped.

use super::packet::{encode_udp_packet, parse_udp_packet, UdpPacket};
use crate::routing::RoutePolicy;
use crate::socks::types::TargetAddr;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65535;

/// Which source endpoint counts as the association's client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientEndpoint {
    ip: IpAddr,
    port: Option<u16>,
}

impl ClientEndpoint {
    /// A fully known client endpoint
    pub fn fixed(addr: SocketAddr) -> Self {
        ClientEndpoint {
            ip: addr.ip().to_canonical(),
            port: Some(addr.port()),
        }
    }

    /// Client IP known, port learned from its first datagram
    pub fn learn(ip: IpAddr) -> Self {
        ClientEndpoint {
            ip: ip.to_canonical(),
            port: None,
        }
    }

    /// Derive the endpoint from the address declared in the request
    ///
    /// Unspecified parts fall back to the control connection's peer IP and a
    /// port learned from traffic.
    pub fn from_declared(declared: &TargetAddr, control_peer: IpAddr) -> Self {
        match declared {
            TargetAddr::Ip(addr) => {
                let ip = if addr.ip().is_unspecified() {
                    control_peer
                } else {
                    addr.ip()
                };
                match addr.port() {
                    0 => ClientEndpoint::learn(ip),
                    port => ClientEndpoint::fixed(SocketAddr::new(ip, port)),
                }
            }
            TargetAddr::Domain(_, 0) => ClientEndpoint::learn(control_peer),
            TargetAddr::Domain(_, port) => {
                ClientEndpoint::fixed(SocketAddr::new(control_peer, *port))
            }
        }
    }

    /// The endpoint once fully known
    pub fn addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.ip, port))
    }

    /// Whether `src` is the client, learning the port on first contact
    fn accept(&mut self, src: SocketAddr) -> bool {
        if src.ip().to_canonical() != self.ip {
            return false;
        }
        match self.port {
            Some(port) => port == src.port(),
            None => {
                debug!("Learned UDP client endpoint {}", src);
                self.port = Some(src.port());
                true
            }
        }
    }
}

/// NAT-style UDP relay bound to an ephemeral port
pub struct UdpRelaySession {
    socket: UdpSocket,
    client: ClientEndpoint,
    policy: RoutePolicy,
    username: Option<String>,
    /// Remote endpoint -> client endpoint that last sent to it
    nat: HashMap<SocketAddr, SocketAddr>,
    /// Domain destinations already routed in this session
    routes: HashMap<TargetAddr, SocketAddr>,
}

impl UdpRelaySession {
    /// Bind the relay socket
    pub async fn bind(
        local: SocketAddr,
        client: ClientEndpoint,
        policy: RoutePolicy,
        username: Option<String>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .with_context(|| format!("Failed to bind UDP relay on {}", local))?;

        Ok(UdpRelaySession {
            socket,
            client,
            policy,
            username,
            nat: HashMap::new(),
            routes: HashMap::new(),
        })
    }

    /// Address the relay socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Relay datagrams until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (len, src) = tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok(received) => received,
                    Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                        trace!("UDP relay ignoring reset: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e).context("UDP relay receive failed"),
                },
            };

            let datagram = &buf[..len];
            if self.client.accept(src) {
                self.forward_outbound(datagram, src).await;
            } else {
                self.forward_inbound(datagram, src).await;
            }
        }

        debug!("UDP relay on {:?} closed", self.socket.local_addr().ok());
        Ok(())
    }

    async fn forward_outbound(&mut self, datagram: &[u8], client: SocketAddr) {
        let packet = match parse_udp_packet(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed datagram from {}: {:#}", client, e);
                return;
            }
        };

        if packet.is_fragmented() {
            debug!("Dropping fragmented datagram from {} (frag {})", client, packet.frag);
            return;
        }

        let dest = match self.route(&packet.addr).await {
            Some(dest) => dest,
            None => return,
        };

        match self.socket.send_to(&packet.data, dest).await {
            Ok(_) => {
                self.nat.insert(dest, client);
                trace!("UDP {} -> {} ({} bytes)", client, dest, packet.data.len());
            }
            Err(e) => debug!("UDP send to {} failed: {}", dest, e),
        }
    }

    /// Route a destination, reusing earlier answers for domains
    async fn route(&mut self, target: &TargetAddr) -> Option<SocketAddr> {
        if let Some(dest) = self.routes.get(target) {
            return Some(*dest);
        }

        match self.policy.route(target.clone(), self.username.as_deref()).await {
            Ok(dest) => {
                if matches!(target, TargetAddr::Domain(..)) {
                    self.routes.insert(target.clone(), dest);
                }
                Some(dest)
            }
            Err(e) => {
                debug!("Dropping datagram to {}: {}", target, e);
                None
            }
        }
    }

    async fn forward_inbound(&mut self, datagram: &[u8], remote: SocketAddr) {
        let client = match self.nat.get(&remote) {
            Some(client) => *client,
            None => {
                trace!("Dropping unsolicited datagram from {}", remote);
                return;
            }
        };

        let packet = UdpPacket::new(TargetAddr::Ip(remote), Bytes::copy_from_slice(datagram));
        if let Err(e) = self.socket.send_to(&encode_udp_packet(&packet), client).await {
            debug!("UDP send to client {} failed: {}", client, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{AccessControl, DnsResolver, NoPrivateNetworks};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Answers every name with loopback and counts lookups
    #[derive(Default)]
    struct CountingDns(AtomicUsize);

    #[async_trait]
    impl DnsResolver for CountingDns {
        async fn resolve(&self, _hostname: &str) -> Vec<IpAddr> {
            self.0.fetch_add(1, Ordering::SeqCst);
            vec!["127.0.0.1".parse().unwrap()]
        }
    }

    async fn start_session(client: ClientEndpoint) -> (SocketAddr, CancellationToken) {
        start_session_with(client, RoutePolicy::permissive()).await
    }

    async fn start_session_with(
        client: ClientEndpoint,
        policy: RoutePolicy,
    ) -> (SocketAddr, CancellationToken) {
        let session = UdpRelaySession::bind(
            "127.0.0.1:0".parse().unwrap(),
            client,
            policy,
            None,
        )
        .await
        .unwrap();
        let addr = session.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(session.run(cancel.clone()));
        (addr, cancel)
    }

    fn wrap(dest: SocketAddr, frag: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = UdpPacket::new(TargetAddr::Ip(dest), Bytes::copy_from_slice(payload));
        packet.frag = frag;
        encode_udp_packet(&packet).to_vec()
    }

    async fn recv_within(socket: &UdpSocket, ms: u64) -> Option<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; 2048];
        match tokio::time::timeout(Duration::from_millis(ms), socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => Some((buf[..n].to_vec(), from)),
            _ => None,
        }
    }

    #[test]
    fn test_client_endpoint_from_declared() {
        let peer: IpAddr = "192.0.2.7".parse().unwrap();

        let declared = TargetAddr::Ip("0.0.0.0:0".parse().unwrap());
        assert_eq!(ClientEndpoint::from_declared(&declared, peer), ClientEndpoint::learn(peer));

        let declared = TargetAddr::Ip("198.51.100.1:4000".parse().unwrap());
        assert_eq!(
            ClientEndpoint::from_declared(&declared, peer).addr(),
            Some("198.51.100.1:4000".parse().unwrap())
        );

        let declared = TargetAddr::Ip("0.0.0.0:5000".parse().unwrap());
        assert_eq!(
            ClientEndpoint::from_declared(&declared, peer).addr(),
            Some("192.0.2.7:5000".parse().unwrap())
        );
    }

    #[test]
    fn test_client_endpoint_learns_port() {
        let mut client = ClientEndpoint::learn("127.0.0.1".parse().unwrap());
        assert!(!client.accept("10.0.0.1:1000".parse().unwrap()));
        assert!(client.accept("127.0.0.1:4000".parse().unwrap()));
        assert!(client.accept("127.0.0.1:4000".parse().unwrap()));
        assert!(!client.accept("127.0.0.1:4001".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let (relay, cancel) = start_session(ClientEndpoint::fixed(client.local_addr().unwrap())).await;

        client.send_to(&wrap(target_addr, 0, b"ping"), relay).await.unwrap();
        let (payload, from) = recv_within(&target, 1000).await.unwrap();
        assert_eq!(payload, b"ping");
        assert_eq!(from, relay);

        target.send_to(b"pong", relay).await.unwrap();
        let (reply, from) = recv_within(&client, 1000).await.unwrap();
        assert_eq!(from, relay);
        assert_eq!(reply, wrap(target_addr, 0, b"pong"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_fragment_dropped() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let (relay, cancel) = start_session(ClientEndpoint::fixed(client.local_addr().unwrap())).await;

        client.send_to(&wrap(target_addr, 1, b"part"), relay).await.unwrap();
        assert!(recv_within(&target, 200).await.is_none());

        // Nothing was sent, so the target is not mapped either
        target.send_to(b"pong", relay).await.unwrap();
        assert!(recv_within(&client, 200).await.is_none());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_unsolicited_dropped() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (relay, cancel) = start_session(ClientEndpoint::fixed(client.local_addr().unwrap())).await;

        stranger.send_to(b"hello?", relay).await.unwrap();
        assert!(recv_within(&client, 200).await.is_none());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_learned_client() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        let (relay, cancel) = start_session(ClientEndpoint::learn("127.0.0.1".parse().unwrap())).await;

        client.send_to(&wrap(target_addr, 0, b"first"), relay).await.unwrap();
        let (payload, _) = recv_within(&target, 1000).await.unwrap();
        assert_eq!(payload, b"first");

        target.send_to(b"back", relay).await.unwrap();
        let (reply, _) = recv_within(&client, 1000).await.unwrap();
        assert_eq!(reply, wrap(target_addr, 0, b"back"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_udp_domain_routed_once_per_session() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = target.local_addr().unwrap().port();

        let dns = Arc::new(CountingDns::default());
        let policy = RoutePolicy::new(
            Arc::new(AccessControl::allow_all()),
            Arc::new(NoPrivateNetworks),
            dns.clone(),
        );
        let (relay, cancel) =
            start_session_with(ClientEndpoint::fixed(client.local_addr().unwrap()), policy).await;

        let domain = TargetAddr::domain("echo.test".to_string(), port);
        for payload in [&b"one"[..], b"two", b"three"] {
            let packet = UdpPacket::new(domain.clone(), Bytes::copy_from_slice(payload));
            client.send_to(&encode_udp_packet(&packet), relay).await.unwrap();
            let (received, _) = recv_within(&target, 1000).await.unwrap();
            assert_eq!(received, payload);
        }
        assert_eq!(dns.0.load(Ordering::SeqCst), 1);

        cancel.cancel();
    }
}
