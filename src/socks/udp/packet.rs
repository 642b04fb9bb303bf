//! SOCKS5 UDP encapsulation
//!
//! Every datagram between the client and the relay carries this header:
//!
//! ```text
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```
//!
//! Outbound the address is the destination; on replies it is the remote
//! peer the datagram came from.

use crate::error::ProxyError;
use crate::socks::types::TargetAddr;
use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const HEADER_PREFIX: usize = 3;

/// One encapsulated datagram
#[derive(Debug, Clone)]
pub struct UdpPacket {
    /// Fragment position; zero means a whole datagram
    pub frag: u8,
    /// Destination or origin, depending on direction
    pub addr: TargetAddr,
    /// Payload
    pub data: Bytes,
}

impl UdpPacket {
    /// Whole (unfragmented) datagram for `addr`
    pub fn new(addr: TargetAddr, data: Bytes) -> Self {
        UdpPacket { frag: 0, addr, data }
    }

    /// Fragments are not reassembled and get dropped by the relay
    pub fn is_fragmented(&self) -> bool {
        self.frag != 0
    }
}

/// Strip the header off a datagram received from the client
pub fn parse_udp_packet(datagram: &[u8]) -> Result<UdpPacket> {
    let mut input = datagram;
    if input.remaining() < HEADER_PREFIX {
        return Err(ProxyError::Protocol(format!("{}-byte UDP datagram", datagram.len())).into());
    }
    let rsv = input.get_u16();
    if rsv != 0 {
        return Err(ProxyError::Protocol(format!("UDP RSV must be zero, got {:#06x}", rsv)).into());
    }
    let frag = input.get_u8();
    let addr = TargetAddr::decode(&mut input).context("Bad UDP destination")?;

    Ok(UdpPacket {
        frag,
        addr,
        data: Bytes::copy_from_slice(input),
    })
}

/// Prefix a payload with the header for delivery to the client
pub fn encode_udp_packet(packet: &UdpPacket) -> Bytes {
    let len = HEADER_PREFIX + packet.addr.encoded_len() + packet.data.len();
    let mut out = BytesMut::with_capacity(len);
    out.put_u16(0);
    out.put_u8(packet.frag);
    packet.addr.encode(&mut out);
    out.extend_from_slice(&packet.data);
    out.freeze()
}
