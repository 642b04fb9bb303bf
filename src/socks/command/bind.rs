//! BIND command
//!
//! Opens a one-shot listener, reports it to the client, waits for a single
//! inbound connection, reports the peer and relays. The listener is dropped
//! as soon as the peer is accepted or the wait ends.

use super::{read_address, send_reply, Socks5CommandContext};
use crate::channel::Channel;
use crate::error::{ProxyError, Socks5ReplyCode};
use crate::socks::relay::relay;
use crate::transport::bind_listener;
use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Accepts one inbound connection on behalf of the client
#[derive(Debug, Clone, Default)]
pub struct BindHandler;

impl BindHandler {
    /// Create a BIND handler
    pub fn new() -> Self {
        BindHandler
    }

    pub(super) async fn handle(&self, ctx: &mut Socks5CommandContext) -> Result<()> {
        let atyp = ctx.address_type();
        let expected = match read_address(&mut ctx.channel, atyp).await? {
            Some(addr) => addr,
            None => return Ok(()),
        };

        let bind_ip = ctx
            .channel
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let listener = bind_listener(SocketAddr::new(bind_ip, 0), 1)
            .context("Failed to open BIND listener")?;
        let bound = listener.local_addr()?;
        debug!("BIND for {} expecting {} listening on {}", ctx.channel.remote_addr(), expected, bound);

        send_reply(&mut ctx.channel, Socks5ReplyCode::Succeeded, bound).await?;

        let (peer, peer_addr) = accept_one(listener, ctx).await?;
        debug!("BIND on {} accepted {}", bound, peer_addr);

        send_reply(&mut ctx.channel, Socks5ReplyCode::Succeeded, peer_addr).await?;

        let peer = Channel::tcp(peer)?;
        relay(ctx.channel.take_transport(), peer, ctx.idle_timeout, &ctx.cancel).await
    }
}

/// Wait for the single inbound connection, then drop the listener
async fn accept_one(
    listener: TcpListener,
    ctx: &Socks5CommandContext,
) -> Result<(TcpStream, SocketAddr)> {
    tokio::select! {
        _ = ctx.cancel.cancelled() => Err(ProxyError::Cancelled.into()),
        accepted = tokio::time::timeout(ctx.idle_timeout, listener.accept()) => {
            accepted
                .map_err(|_| ProxyError::IdleTimeout(ctx.idle_timeout))?
                .context("BIND accept failed")
        }
    }
}
