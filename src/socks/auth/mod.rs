//! SOCKS5 authentication module
//!
//! Each authenticator owns one SOCKS5 method id. Authentication takes the
//! client channel by value and always hands a channel back: either the same
//! one or a replacement backed by a negotiated secure stream. Everything
//! after authentication must use the returned channel.

mod gssapi;
mod none;
mod password;

pub use gssapi::{GssStep, GssapiAcceptor, GssapiAuth, SecurityContext};
pub use none::NoAuth;
pub use password::{PasswordAuth, UserValidator};

use super::consts::*;
use crate::channel::Channel;

/// Result of running an authenticator
#[derive(Debug)]
pub struct AuthOutcome {
    /// Whether the client is authenticated
    pub success: bool,
    /// The channel to continue on, possibly different from the input
    pub channel: Channel,
    /// Authenticated identity, if the method yields one
    pub username: Option<String>,
}

impl AuthOutcome {
    /// Successful authentication
    pub fn accepted(channel: Channel, username: Option<String>) -> Self {
        AuthOutcome {
            success: true,
            channel,
            username,
        }
    }

    /// Failed authentication
    pub fn rejected(channel: Channel) -> Self {
        AuthOutcome {
            success: false,
            channel,
            username: None,
        }
    }
}

/// A registered SOCKS5 authentication method
#[derive(Debug, Clone)]
pub enum Authenticator {
    /// Method 0x00
    NoAuth(NoAuth),
    /// Method 0x01
    Gssapi(GssapiAuth),
    /// Method 0x02
    Password(PasswordAuth),
}

impl Authenticator {
    /// SOCKS5 method id of this authenticator
    pub fn method(&self) -> u8 {
        match self {
            Authenticator::NoAuth(_) => SOCKS5_AUTH_METHOD_NONE,
            Authenticator::Gssapi(_) => SOCKS5_AUTH_METHOD_GSSAPI,
            Authenticator::Password(_) => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Run the method's sub-negotiation
    pub async fn authenticate(&self, channel: Channel) -> AuthOutcome {
        match self {
            Authenticator::NoAuth(auth) => auth.authenticate(channel).await,
            Authenticator::Gssapi(auth) => auth.authenticate(channel).await,
            Authenticator::Password(auth) => auth.authenticate(channel).await,
        }
    }
}

impl From<NoAuth> for Authenticator {
    fn from(auth: NoAuth) -> Self {
        Authenticator::NoAuth(auth)
    }
}

impl From<GssapiAuth> for Authenticator {
    fn from(auth: GssapiAuth) -> Self {
        Authenticator::Gssapi(auth)
    }
}

impl From<PasswordAuth> for Authenticator {
    fn from(auth: PasswordAuth) -> Self {
        Authenticator::Password(auth)
    }
}

/// Pick the authenticator for a client's offered methods
///
/// `registered` must already be filtered to the listener's allowed methods
/// and sorted by ascending method id; the first one the client offers wins.
pub fn select_authenticator<'a>(
    registered: &'a [Authenticator],
    offered: &[u8],
) -> Option<&'a Authenticator> {
    registered
        .iter()
        .find(|auth| offered.contains(&auth.method()))
}
