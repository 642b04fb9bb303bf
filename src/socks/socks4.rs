//! SOCKS4/4a protocol handler
//!
//! Single-pass protocol without authentication. The user id is read and
//! ignored. A destination of `0.0.0.x` with `x != 0` marks a SOCKS4a
//! request whose host name follows the user id.
//!
//! # Request Format
//!
//! ```text
//! +----+----+---------+-------+--------+------+--------+------+
//! | VN | CD | DSTPORT | DSTIP | USERID | NULL | DOMAIN | NULL |
//! +----+----+---------+-------+--------+------+--------+------+
//! | 1  | 1  |    2    |   4   |  var   |  1   |  var   |  1   |
//! +----+----+---------+-------+--------+------+--------+------+
//! ```

use super::consts::*;
use super::relay::relay;
use super::types::{SocksCommand, TargetAddr};
use super::ProxySettings;
use crate::channel::Channel;
use crate::error::{is_cancelled, ProxyError, Socks4ReplyCode};
use crate::routing::RoutePolicy;
use crate::transport::bind_listener;
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A parsed SOCKS4/4a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks4Request {
    /// Raw command byte
    pub command: u8,
    /// Destination, a host name for SOCKS4a
    pub target: TargetAddr,
    /// Client-supplied user id
    pub user_id: String,
}

/// SOCKS4/4a session handler
#[derive(Debug, Clone)]
pub struct Socks4Handler {
    policy: RoutePolicy,
    settings: ProxySettings,
}

impl Socks4Handler {
    /// Create a SOCKS4 handler
    pub fn new(policy: RoutePolicy, settings: ProxySettings) -> Self {
        Socks4Handler { policy, settings }
    }

    /// True when the initial bytes announce SOCKS4
    pub fn can_handle(&self, initial: &[u8]) -> bool {
        initial.first() == Some(&SOCKS4_VERSION)
    }

    /// Serve one request, closing the channel whatever the outcome
    pub async fn handle(
        &self,
        mut channel: Channel,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = tokio::select! {
            result = self.serve(&mut channel, idle_timeout, cancel) => result,
            _ = cancel.cancelled() => Err(ProxyError::Cancelled.into()),
        };

        channel.close().await;
        result
    }

    async fn serve(
        &self,
        channel: &mut Channel,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = read_request(channel).await?;
        debug!(
            "SOCKS4 command {:#04x} to {} from {}",
            request.command,
            request.target,
            channel.remote_addr()
        );

        let result = match SocksCommand::from_byte(request.command) {
            Some(SocksCommand::Connect) => {
                self.connect(channel, request.target, idle_timeout, cancel).await
            }
            Some(SocksCommand::Bind) => {
                self.bind(channel, request.target, idle_timeout, cancel).await
            }
            _ => {
                debug!("Unsupported SOCKS4 command {:#04x}", request.command);
                send_socks4_reply(channel, Socks4ReplyCode::Rejected, unspecified_v4()).await
            }
        };

        match result {
            Err(e) if !is_cancelled(&e) => {
                warn!("SOCKS4 request from {} failed: {:#}", channel.remote_addr(), e);
                if channel.is_connected() {
                    let _ =
                        send_socks4_reply(channel, Socks4ReplyCode::Rejected, unspecified_v4()).await;
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn connect(
        &self,
        channel: &mut Channel,
        target: TargetAddr,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let addr = match self.policy.route(target.clone(), None).await {
            Ok(addr) => addr,
            Err(e) => {
                info!("SOCKS4 CONNECT to {} refused: {}", target, e);
                return send_socks4_reply(channel, Socks4ReplyCode::Rejected, unspecified_v4())
                    .await;
            }
        };

        let stream = match self.settings.dial(addr, cancel).await {
            Ok(stream) => stream,
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => {
                debug!("SOCKS4 CONNECT to {} failed: {:#}", target, e);
                return send_socks4_reply(channel, Socks4ReplyCode::Rejected, unspecified_v4())
                    .await;
            }
        };
        let upstream = Channel::tcp(stream)?;

        let granted = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), target.port());
        send_socks4_reply(channel, Socks4ReplyCode::Granted, granted).await?;

        relay(channel.take_transport(), upstream, idle_timeout, cancel).await
    }

    async fn bind(
        &self,
        channel: &mut Channel,
        expected: TargetAddr,
        idle_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let listener = bind_listener(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0), 1)
            .context("Failed to open BIND listener")?;
        let bound = listener.local_addr()?;
        send_socks4_reply(channel, Socks4ReplyCode::Granted, bound).await?;

        let (peer, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled.into()),
            accepted = tokio::time::timeout(idle_timeout, listener.accept()) => {
                accepted
                    .map_err(|_| ProxyError::IdleTimeout(idle_timeout))?
                    .context("BIND accept failed")?
            }
        };
        drop(listener);

        if !peer_matches(&expected, peer_addr.ip()).await {
            info!(
                "SOCKS4 BIND on {}: peer {} does not match expected {}",
                bound, peer_addr, expected
            );
            return send_socks4_reply(channel, Socks4ReplyCode::Rejected, unspecified_v4()).await;
        }

        send_socks4_reply(channel, Socks4ReplyCode::Granted, bound).await?;

        let peer = Channel::tcp(peer)?;
        relay(channel.take_transport(), peer, idle_timeout, cancel).await
    }
}

/// Whether an accepted BIND peer is the host the client announced
async fn peer_matches(expected: &TargetAddr, peer: IpAddr) -> bool {
    let expected_ip = match expected {
        TargetAddr::Ip(addr) => addr.ip(),
        TargetAddr::Domain(..) => match expected.resolve().await {
            Ok(addr) => addr.ip(),
            Err(_) => return false,
        },
    };
    expected_ip.to_canonical() == peer.to_canonical()
}

fn unspecified_v4() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Read a SOCKS4/4a request
pub async fn read_request<R>(reader: &mut R) -> Result<Socks4Request>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 8];
    reader
        .read_exact(&mut head)
        .await
        .context("Failed to read SOCKS4 request")?;

    if head[0] != SOCKS4_VERSION {
        return Err(ProxyError::Protocol(format!("Not a SOCKS4 request: version {}", head[0])).into());
    }

    let command = head[1];
    let port = u16::from_be_bytes([head[2], head[3]]);
    let ip = Ipv4Addr::new(head[4], head[5], head[6], head[7]);

    let user_id = read_nul_terminated(reader, MAX_USER_ID_LEN, "user id").await?;

    let target = if is_socks4a(ip) {
        let domain = read_nul_terminated(reader, MAX_DOMAIN_LEN, "domain").await?;
        if domain.is_empty() {
            return Err(ProxyError::Protocol("Empty SOCKS4a domain".to_string()).into());
        }
        TargetAddr::domain(domain, port)
    } else {
        TargetAddr::ipv4(ip, port)
    };

    Ok(Socks4Request {
        command,
        target,
        user_id,
    })
}

/// `0.0.0.x` with `x != 0`
fn is_socks4a(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    octets[..3] == [0, 0, 0] && octets[3] != 0
}

async fn read_nul_terminated<R>(reader: &mut R, max_len: usize, what: &str) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let byte = reader
            .read_u8()
            .await
            .with_context(|| format!("Failed to read SOCKS4 {}", what))?;
        if byte == 0 {
            break;
        }
        if bytes.len() == max_len {
            return Err(ProxyError::Protocol(format!("SOCKS4 {} too long", what)).into());
        }
        bytes.push(byte);
    }

    String::from_utf8(bytes)
        .map_err(|_| ProxyError::Protocol(format!("SOCKS4 {} is not valid UTF-8", what)).into())
}

/// Encode a SOCKS4 reply: `[0x00, CD, DSTPORT, DSTIP]`
///
/// IPv6 addresses cannot be expressed and are reported as `0.0.0.0`.
pub fn encode_socks4_reply(code: Socks4ReplyCode, addr: SocketAddr) -> [u8; 8] {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => ip.to_ipv4_mapped().unwrap_or(Ipv4Addr::UNSPECIFIED),
    };
    let port = addr.port().to_be_bytes();
    let octets = ip.octets();

    [
        SOCKS4_REPLY_VERSION,
        code.into(),
        port[0],
        port[1],
        octets[0],
        octets[1],
        octets[2],
        octets[3],
    ]
}

async fn send_socks4_reply<W>(writer: &mut W, code: Socks4ReplyCode, addr: SocketAddr) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_socks4_reply(code, addr)).await?;
    writer.flush().await?;
    Ok(())
}
