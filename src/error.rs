//! Error types for Socksrouter
//!
//! [`ProxyError`] is the crate-wide taxonomy; handlers return it wrapped in
//! `anyhow::Error` and the connection layer inspects the chain to decide
//! which reply a client gets. The reply code enums live here too so both
//! protocol handlers draw from one table.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by the listener, the protocol handlers and the stores
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Socket failure
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    /// The configuration cannot be served
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The peer sent something the protocol does not allow
    #[error("Malformed request: {0}")]
    Protocol(String),

    /// Credentials were rejected or the exchange was abandoned
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// SOCKS5 negotiation failure
    #[error(transparent)]
    Socks5(#[from] Socks5Error),

    /// Routing refused the destination
    #[error("Destination denied: {0}")]
    DestinationDenied(String),

    /// Outbound dial or resolution failed
    #[error("Destination unreachable: {0}")]
    Unreachable(String),

    /// No bytes moved in either direction within the window
    #[error("Relay idle for {0:?}")]
    IdleTimeout(Duration),

    /// Shutdown or connection cancellation
    #[error("Cancelled")]
    Cancelled,

    /// Certificate loading or handshake failure
    #[error("TLS failure: {0}")]
    Tls(String),

    /// A JSON store could not be read or written
    #[error("Store failure: {0}")]
    Store(String),
}

/// Negotiation failures specific to SOCKS5
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// `VER` byte is not 5 (or 1 in a password sub-negotiation)
    #[error("unexpected version byte {0:#04x}")]
    UnsupportedVersion(u8),

    /// None of the offered methods is allowed on this listener
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// The selected method rejected the client
    #[error("authentication rejected")]
    AuthFailed,

    /// `CMD` byte the proxy does not implement
    #[error("unsupported command {0:#04x}")]
    CommandNotSupported(u8),

    /// `ATYP` byte outside IPv4, domain and IPv6
    #[error("unsupported address type {0:#04x}")]
    AddressTypeNotSupported(u8),

    /// Empty or non-UTF-8 host name
    #[error("invalid domain name {0:?}")]
    InvalidDomain(String),
}

/// Returns true when the error chain ends in a cancellation.
///
/// Cancellation is the expected way for a connection to end during
/// shutdown and is never reported as a failure.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| matches!(cause.downcast_ref::<ProxyError>(), Some(ProxyError::Cancelled)))
}

/// Extracts the unsupported address type byte from an error chain, if any.
pub fn unsupported_address_type(err: &anyhow::Error) -> Option<u8> {
    err.chain().find_map(|cause| {
        let socks5 = cause.downcast_ref::<Socks5Error>().or_else(|| {
            match cause.downcast_ref::<ProxyError>() {
                Some(ProxyError::Socks5(inner)) => Some(inner),
                _ => None,
            }
        });
        match socks5 {
            Some(Socks5Error::AddressTypeNotSupported(atyp)) => Some(*atyp),
            _ => None,
        }
    })
}

/// `REP` values of a SOCKS5 reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Success
    Succeeded = 0x00,
    /// Unexpected server-side failure
    GeneralFailure = 0x01,
    /// Access rules or network membership refused the destination
    ConnectionNotAllowed = 0x02,
    /// Network unreachable
    NetworkUnreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// The destination refused or could not be dialed
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Unknown `CMD`
    CommandNotSupported = 0x07,
    /// Unknown `ATYP`
    AddressTypeNotSupported = 0x08,
}

impl Socks5ReplyCode {
    const ALL: [Socks5ReplyCode; 9] = [
        Socks5ReplyCode::Succeeded,
        Socks5ReplyCode::GeneralFailure,
        Socks5ReplyCode::ConnectionNotAllowed,
        Socks5ReplyCode::NetworkUnreachable,
        Socks5ReplyCode::HostUnreachable,
        Socks5ReplyCode::ConnectionRefused,
        Socks5ReplyCode::TtlExpired,
        Socks5ReplyCode::CommandNotSupported,
        Socks5ReplyCode::AddressTypeNotSupported,
    ];
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .get(value as usize)
            .copied()
            .ok_or_else(|| ProxyError::Protocol(format!("reply code {:#04x}", value)))
    }
}

/// `CD` values of a SOCKS4 reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks4ReplyCode {
    /// Request granted
    Granted = 0x5A,
    /// Request rejected or failed
    Rejected = 0x5B,
}

impl From<Socks4ReplyCode> for u8 {
    fn from(code: Socks4ReplyCode) -> Self {
        code as u8
    }
}
