//! RFC 1929 username/password sub-negotiation
//!
//! ```text
//! request:  VER(1)=0x01 | ULEN(1) | UNAME(1..255) | PLEN(1) | PASSWD(0..255)
//! response: VER(1)=0x01 | STATUS(1), 0x00 on success
//! ```
//!
//! Every failure the client can still hear about gets a non-zero status
//! before the connection is dropped.

use super::AuthOutcome;
use crate::channel::Channel;
use crate::error::Socks5Error;
use crate::socks::consts::SOCKS5_AUTH_VERSION;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

const STATUS_OK: u8 = 0x00;
const STATUS_DENIED: u8 = 0x01;

/// Credential check backing the password method
#[async_trait]
pub trait UserValidator: Send + Sync {
    /// True when the username exists and the password matches
    async fn validate(&self, username: &str, password: &str) -> bool;
}

/// The password method (0x02)
#[derive(Clone)]
pub struct PasswordAuth {
    validator: Arc<dyn UserValidator>,
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth").finish_non_exhaustive()
    }
}

impl PasswordAuth {
    /// Check credentials against `validator`
    pub fn new(validator: Arc<dyn UserValidator>) -> Self {
        PasswordAuth { validator }
    }

    /// Run the sub-negotiation; the channel is never replaced
    pub async fn authenticate(&self, mut channel: Channel) -> AuthOutcome {
        match negotiate(&mut channel, self.validator.as_ref()).await {
            Ok(username) => AuthOutcome::accepted(channel, Some(username)),
            Err(e) => {
                debug!("Password authentication from {} failed: {:#}", channel.remote_addr(), e);
                AuthOutcome::rejected(channel)
            }
        }
    }
}

struct Credentials {
    username: String,
    password: String,
}

/// Read one request, answer it and return the authenticated username
pub async fn negotiate<S>(stream: &mut S, validator: &dyn UserValidator) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let verdict = match read_credentials(stream).await {
        Ok(creds) => {
            if validator.validate(&creds.username, &creds.password).await {
                debug!("User {} authenticated", creds.username);
                Ok(creds.username)
            } else {
                warn!("Rejected credentials for user {}", creds.username);
                Err(Socks5Error::AuthFailed.into())
            }
        }
        // Nobody left to answer
        Err(e) if closed_early(&e) => return Err(e),
        Err(e) => Err(e),
    };

    let status = if verdict.is_ok() { STATUS_OK } else { STATUS_DENIED };
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    verdict
}

async fn read_credentials<R>(reader: &mut R) -> Result<Credentials>
where
    R: AsyncRead + Unpin,
{
    let version = reader.read_u8().await?;
    if version != SOCKS5_AUTH_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    let username = read_field(reader).await?;
    let password = read_field(reader).await?;
    if username.is_empty() {
        return Err(Socks5Error::AuthFailed).context("empty username");
    }

    match (String::from_utf8(username), String::from_utf8(password)) {
        (Ok(username), Ok(password)) => Ok(Credentials { username, password }),
        _ => Err(Socks5Error::AuthFailed).context("credentials are not UTF-8"),
    }
}

/// One length-prefixed field
async fn read_field<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await?;
    let mut field = vec![0u8; len as usize];
    reader.read_exact(&mut field).await?;
    Ok(field)
}

fn closed_early(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<io::Error>().map(io::Error::kind),
        Some(io::ErrorKind::UnexpectedEof)
    )
}
