//! CONNECT command

use super::{read_address, send_reply, unspecified_addr, Socks5CommandContext};
use crate::channel::Channel;
use crate::error::{is_cancelled, ProxyError, Socks5ReplyCode};
use crate::routing::RoutePolicy;
use crate::socks::relay::relay;
use crate::socks::ProxySettings;
use anyhow::Result;
use tracing::{debug, info};

/// Opens an outbound TCP connection and relays to it
#[derive(Debug, Clone)]
pub struct ConnectHandler {
    policy: RoutePolicy,
    settings: ProxySettings,
}

impl ConnectHandler {
    /// Create a CONNECT handler
    pub fn new(policy: RoutePolicy, settings: ProxySettings) -> Self {
        ConnectHandler { policy, settings }
    }

    pub(super) async fn handle(&self, ctx: &mut Socks5CommandContext) -> Result<()> {
        let atyp = ctx.address_type();
        let target = match read_address(&mut ctx.channel, atyp).await? {
            Some(target) => target,
            None => return Ok(()),
        };
        debug!("CONNECT {} from {}", target, ctx.channel.remote_addr());

        let addr = match self.policy.route(target.clone(), ctx.username.as_deref()).await {
            Ok(addr) => addr,
            Err(ProxyError::DestinationDenied(reason)) => {
                info!("CONNECT to {} denied: {}", target, reason);
                send_reply(
                    &mut ctx.channel,
                    Socks5ReplyCode::ConnectionNotAllowed,
                    unspecified_addr(),
                )
                .await?;
                return Ok(());
            }
            Err(e) => {
                debug!("CONNECT to {} failed: {}", target, e);
                send_reply(
                    &mut ctx.channel,
                    Socks5ReplyCode::ConnectionRefused,
                    unspecified_addr(),
                )
                .await?;
                return Ok(());
            }
        };

        let stream = match self.settings.dial(addr, &ctx.cancel).await {
            Ok(stream) => stream,
            Err(e) if is_cancelled(&e) => return Err(e),
            Err(e) => {
                debug!("CONNECT to {} failed: {:#}", target, e);
                send_reply(
                    &mut ctx.channel,
                    Socks5ReplyCode::ConnectionRefused,
                    unspecified_addr(),
                )
                .await?;
                return Ok(());
            }
        };

        let bound = if self.settings.report_bound_address {
            stream.local_addr().unwrap_or_else(|_| unspecified_addr())
        } else {
            unspecified_addr()
        };

        let upstream = match Channel::tcp(stream) {
            Ok(channel) => channel,
            Err(e) => {
                debug!("Outbound socket to {} unusable: {}", addr, e);
                send_reply(
                    &mut ctx.channel,
                    Socks5ReplyCode::ConnectionRefused,
                    unspecified_addr(),
                )
                .await?;
                return Ok(());
            }
        };

        send_reply(&mut ctx.channel, Socks5ReplyCode::Succeeded, bound).await?;
        debug!("Relaying {} <-> {} ({})", ctx.channel.remote_addr(), target, addr);

        relay(ctx.channel.take_transport(), upstream, ctx.idle_timeout, &ctx.cancel).await
    }
}
