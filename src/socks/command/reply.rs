//! SOCKS5 reply writer
//!
//! Every SOCKS5 reply the server sends is encoded here.

use crate::error::Socks5ReplyCode;
use crate::socks::consts::*;
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// `0.0.0.0:0`, reported when there is no meaningful bound address
pub fn unspecified_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// Encode a SOCKS5 reply
///
/// # SOCKS5 Reply Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// The address type follows the family of `bound`.
pub fn encode_reply(code: Socks5ReplyCode, bound: SocketAddr) -> Vec<u8> {
    let mut reply = Vec::with_capacity(22);
    reply.push(SOCKS5_VERSION);
    reply.push(code.into());
    reply.push(SOCKS5_RESERVED);

    match bound {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());

    reply
}

/// Encode and send a SOCKS5 reply
pub async fn send_reply<S>(stream: &mut S, code: Socks5ReplyCode, bound: SocketAddr) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&encode_reply(code, bound)).await?;
    stream.flush().await?;
    Ok(())
}
