//! SOCKS5 protocol handler
//!
//! Drives one SOCKS5 session: method negotiation, authentication, the
//! command header and the command chain. Authentication may replace the
//! channel; from that point on only the replacement is used.

use super::auth::{select_authenticator, Authenticator};
use super::command::{CommandChain, Socks5CommandContext};
use super::consts::*;
use crate::channel::Channel;
use crate::error::{ProxyError, Socks5Error};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// SOCKS5 session handler for one listener
#[derive(Debug, Clone)]
pub struct Socks5Handler {
    authenticators: Vec<Authenticator>,
    chain: Arc<CommandChain>,
}

impl Socks5Handler {
    /// Create a handler offering the registered authenticators the listener allows
    ///
    /// Authenticators are kept in ascending method-id order so the lowest
    /// method the client offers is selected.
    pub fn new(registered: Vec<Authenticator>, allowed: &[u8], chain: Arc<CommandChain>) -> Self {
        let mut authenticators: Vec<Authenticator> = registered
            .into_iter()
            .filter(|auth| allowed.contains(&auth.method()))
            .collect();
        authenticators.sort_by_key(Authenticator::method);
        authenticators.dedup_by_key(|auth| auth.method());

        Socks5Handler {
            authenticators,
            chain,
        }
    }

    /// Method ids this handler will select from
    pub fn methods(&self) -> Vec<u8> {
        self.authenticators.iter().map(Authenticator::method).collect()
    }

    /// True when the initial bytes announce SOCKS5
    pub fn can_handle(&self, initial: &[u8]) -> bool {
        initial.first() == Some(&SOCKS5_VERSION)
    }

    /// Serve one session, closing the channel whatever the outcome
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
        // VER, NMETHODS, METHODS
        let mut head = [0u8; 2];
        channel.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(head[0]).into());
        }
        let mut offered = vec![0u8; head[1] as usize];
        channel.read_exact(&mut offered).await?;

        let auth = match select_authenticator(&self.authenticators, &offered) {
            Some(auth) => auth,
            None => {
                debug!(
                    "No acceptable method for {}: offered {:?}, allowed {:?}",
                    channel.remote_addr(),
                    offered,
                    self.methods()
                );
                channel
                    .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                    .await?;
                channel.flush().await?;
                return Err(Socks5Error::NoAcceptableMethod.into());
            }
        };

        channel.write_all(&[SOCKS5_VERSION, auth.method()]).await?;
        channel.flush().await?;

        let outcome = auth.authenticate(channel.take_transport()).await;
        *channel = outcome.channel;
        if !outcome.success {
            return Err(Socks5Error::AuthFailed.into());
        }
        if let Some(user) = &outcome.username {
            debug!("{} authenticated as {}", channel.remote_addr(), user);
        }

        // VER, CMD, RSV, ATYP
        let mut header = [0u8; 4];
        channel.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(header[0]).into());
        }

        let mut ctx = Socks5CommandContext::new(
            channel.take_transport(),
            header,
            idle_timeout,
            outcome.username,
            cancel.clone(),
        );
        let result = self.chain.dispatch(&mut ctx).await;
        *channel = ctx.channel;
        result
    }
}
