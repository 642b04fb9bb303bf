//! Wire constants for SOCKS4/4a (no RFC), SOCKS5 (RFC 1928), password
//! sub-negotiation (RFC 1929) and GSS-API framing (RFC 1961)

/// `VER` of every SOCKS5 message
pub const SOCKS5_VERSION: u8 = 0x05;
/// `VER` of the password sub-negotiation
pub const SOCKS5_AUTH_VERSION: u8 = 0x01;
/// `RSV` byte
pub const SOCKS5_RESERVED: u8 = 0x00;

/// Method: no authentication
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// Method: GSS-API
pub const SOCKS5_AUTH_METHOD_GSSAPI: u8 = 0x01;
/// Method: username/password
pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
/// Method selection answer when nothing offered is allowed
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

/// `CMD` CONNECT
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
/// `CMD` BIND
pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
/// `CMD` UDP ASSOCIATE
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

/// `ATYP` IPv4
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// `ATYP` host name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// `ATYP` IPv6
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

/// GSS-API message `VER`
pub const GSSAPI_VERSION: u8 = 0x01;
/// GSS-API `MTYP`: context token
pub const GSSAPI_MSG_CONTEXT: u8 = 0x01;
/// GSS-API `MTYP`: protection level
pub const GSSAPI_MSG_PROTECTION: u8 = 0x02;
/// GSS-API `MTYP`: encapsulated data
pub const GSSAPI_MSG_DATA: u8 = 0x03;
/// GSS-API `MTYP`: abort
pub const GSSAPI_MSG_ABORT: u8 = 0xFF;

/// `VN` of a SOCKS4 request
pub const SOCKS4_VERSION: u8 = 0x04;
/// `VN` of a SOCKS4 reply
pub const SOCKS4_REPLY_VERSION: u8 = 0x00;
/// SOCKS4 `CD` CONNECT
pub const SOCKS4_CMD_CONNECT: u8 = 0x01;
/// SOCKS4 `CD` BIND
pub const SOCKS4_CMD_BIND: u8 = 0x02;

/// Longest host name a SOCKS5 `ATYP` 0x03 field or SOCKS4a request may carry
pub const MAX_DOMAIN_LEN: usize = 255;
/// Longest SOCKS4 `USERID` read before giving up
pub const MAX_USER_ID_LEN: usize = 255;
/// Relay copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 8192;
/// Bytes peeked to pick a protocol handler
pub const PROTOCOL_PEEK_LEN: usize = 8;
