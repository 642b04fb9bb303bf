//! SOCKS5 UDP relay
//!
//! Datagram header codec and the per-association relay session.

mod packet;
mod session;

pub use packet::{encode_udp_packet, parse_udp_packet, UdpPacket};
pub use session::{ClientEndpoint, UdpRelaySession};
