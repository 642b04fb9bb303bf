//! Request vocabulary shared by SOCKS4 and SOCKS5
//!
//! [`TargetAddr`] is what a client asks to reach. Its SOCKS5 wire form
//! (`ATYP`, address, port) appears in UDP datagram headers, so the
//! in-memory encode/decode lives here; streaming reads from a control
//! connection are in `command::address`.

use super::consts::*;
use crate::error::{ProxyError, Socks5Error};
use anyhow::{Context, Result};
use bytes::{Buf, BufMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Commands understood by the proxy
///
/// SOCKS4 and SOCKS5 number CONNECT and BIND identically, so one decoder
/// serves both. UDP ASSOCIATE only exists in SOCKS5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksCommand {
    /// Open an outbound TCP connection
    Connect,
    /// Accept one inbound TCP connection
    Bind,
    /// Relay UDP datagrams
    UdpAssociate,
}

impl SocksCommand {
    /// Decode a `CMD` byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            SOCKS5_CMD_TCP_CONNECT => SocksCommand::Connect,
            SOCKS5_CMD_TCP_BIND => SocksCommand::Bind,
            SOCKS5_CMD_UDP_ASSOCIATE => SocksCommand::UdpAssociate,
            _ => return None,
        })
    }
}

/// Destination named by a client
///
/// Domains are kept unresolved so routing can consult private DNS first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TargetAddr {
    /// Literal address
    Ip(SocketAddr),
    /// Host name and port
    Domain(String, u16),
}

impl TargetAddr {
    /// IPv4 literal target
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip((ip, port).into())
    }

    /// IPv6 literal target
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip((ip, port).into())
    }

    /// Named target, resolved later
    pub fn domain(domain: String, port: u16) -> Self {
        TargetAddr::Domain(domain, port)
    }

    /// Destination port
    pub fn port(&self) -> u16 {
        match *self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => port,
        }
    }

    /// Turn the target into a dialable address
    ///
    /// Domains go through the system resolver and the first answer wins.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        let (domain, port) = match self {
            TargetAddr::Ip(addr) => return Ok(*addr),
            TargetAddr::Domain(domain, port) => (domain.as_str(), *port),
        };

        let mut answers = tokio::net::lookup_host((domain, port))
            .await
            .with_context(|| format!("Failed to resolve {}", domain))?;
        answers
            .next()
            .ok_or_else(|| ProxyError::Unreachable(format!("{} has no addresses", domain)).into())
    }

    /// Bytes taken by [`encode`](Self::encode)
    pub fn encoded_len(&self) -> usize {
        let host = match self {
            TargetAddr::Ip(SocketAddr::V4(_)) => 4,
            TargetAddr::Ip(SocketAddr::V6(_)) => 16,
            TargetAddr::Domain(domain, _) => 1 + domain.len(),
        };
        1 + host + 2
    }

    /// Append `ATYP | ADDR | PORT`
    pub fn encode(&self, out: &mut impl BufMut) {
        match self {
            TargetAddr::Ip(addr) => {
                match addr.ip() {
                    IpAddr::V4(ip) => {
                        out.put_u8(SOCKS5_ADDR_TYPE_IPV4);
                        out.put_slice(&ip.octets());
                    }
                    IpAddr::V6(ip) => {
                        out.put_u8(SOCKS5_ADDR_TYPE_IPV6);
                        out.put_slice(&ip.octets());
                    }
                }
                out.put_u16(addr.port());
            }
            TargetAddr::Domain(domain, port) => {
                out.put_u8(SOCKS5_ADDR_TYPE_DOMAIN);
                out.put_u8(domain.len() as u8);
                out.put_slice(domain.as_bytes());
                out.put_u16(*port);
            }
        }
    }

    /// Take `ATYP | ADDR | PORT` off the front of `input`
    ///
    /// On success `input` is left at the first byte after the port.
    pub fn decode(input: &mut &[u8]) -> Result<Self> {
        let atyp = take::<1>(input)?[0];
        let addr = match atyp {
            SOCKS5_ADDR_TYPE_IPV4 => {
                let ip = Ipv4Addr::from(take::<4>(input)?);
                TargetAddr::ipv4(ip, u16::from_be_bytes(take(input)?))
            }
            SOCKS5_ADDR_TYPE_IPV6 => {
                let ip = Ipv6Addr::from(take::<16>(input)?);
                TargetAddr::ipv6(ip, u16::from_be_bytes(take(input)?))
            }
            SOCKS5_ADDR_TYPE_DOMAIN => {
                let len = take::<1>(input)?[0] as usize;
                if len == 0 || input.len() < len {
                    return Err(Socks5Error::InvalidDomain(String::new()).into());
                }
                let raw = &input[..len];
                let name = match std::str::from_utf8(raw) {
                    Ok(name) => name.to_owned(),
                    Err(_) => {
                        let lossy = String::from_utf8_lossy(raw).into_owned();
                        return Err(Socks5Error::InvalidDomain(lossy).into());
                    }
                };
                input.advance(len);
                TargetAddr::Domain(name, u16::from_be_bytes(take(input)?))
            }
            other => return Err(Socks5Error::AddressTypeNotSupported(other).into()),
        };
        Ok(addr)
    }
}

fn take<const N: usize>(input: &mut &[u8]) -> Result<[u8; N]> {
    if input.len() < N {
        let msg = format!("truncated address: need {} more bytes", N);
        return Err(ProxyError::Protocol(msg).into());
    }
    let mut out = [0u8; N];
    input.copy_to_slice(&mut out);
    Ok(out)
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => addr.fmt(f),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unsupported_address_type;

    #[test]
    fn test_command_numbering() {
        assert_eq!(SocksCommand::from_byte(0x01), Some(SocksCommand::Connect));
        assert_eq!(SocksCommand::from_byte(0x02), Some(SocksCommand::Bind));
        assert_eq!(SocksCommand::from_byte(0x03), Some(SocksCommand::UdpAssociate));
        assert_eq!(SocksCommand::from_byte(0x00), None);
        assert_eq!(SocksCommand::from_byte(0x09), None);
    }

    #[test]
    fn test_display_matches_socket_addr() {
        let v6 = TargetAddr::ipv6(Ipv6Addr::LOCALHOST, 443);
        assert_eq!(v6.to_string(), "[::1]:443");
        assert_eq!(TargetAddr::domain("db.corp".into(), 5432).to_string(), "db.corp:5432");
    }

    #[test]
    fn test_encode_domain() {
        let target = TargetAddr::domain("test".into(), 80);
        let mut out = Vec::new();
        target.encode(&mut out);

        assert_eq!(out, [SOCKS5_ADDR_TYPE_DOMAIN, 4, b't', b'e', b's', b't', 0, 80]);
        assert_eq!(out.len(), target.encoded_len());
    }

    #[test]
    fn test_decode_leaves_trailing_payload() {
        let mut wire: &[u8] = &[SOCKS5_ADDR_TYPE_IPV4, 192, 0, 2, 7, 0x1F, 0x90, b'h', b'i'];
        let target = TargetAddr::decode(&mut wire).unwrap();

        assert_eq!(target, TargetAddr::Ip("192.0.2.7:8080".parse().unwrap()));
        assert_eq!(wire, b"hi");
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        let mut truncated: &[u8] = &[SOCKS5_ADDR_TYPE_IPV6, 0, 0, 0];
        assert!(TargetAddr::decode(&mut truncated).is_err());

        let mut empty_name: &[u8] = &[SOCKS5_ADDR_TYPE_DOMAIN, 0, 0, 80];
        assert!(TargetAddr::decode(&mut empty_name).is_err());

        let mut unknown: &[u8] = &[0x05, 1, 2, 3, 4];
        let err = TargetAddr::decode(&mut unknown).unwrap_err();
        assert_eq!(unsupported_address_type(&err), Some(0x05));
    }

    #[tokio::test]
    async fn test_resolve() {
        let literal = TargetAddr::ipv4(Ipv4Addr::LOCALHOST, 9000);
        assert_eq!(literal.resolve().await.unwrap(), "127.0.0.1:9000".parse().unwrap());

        let named = TargetAddr::domain("localhost".into(), 53).resolve().await.unwrap();
        assert!(named.ip().is_loopback());
        assert_eq!(named.port(), 53);
    }
}
