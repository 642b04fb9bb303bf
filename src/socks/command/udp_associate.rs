//! UDP ASSOCIATE command
//!
//! The association lives exactly as long as the TCP control connection:
//! the relay session runs on its own task and is cancelled once the client
//! closes the control stream or the connection is cancelled.

use super::{read_address, send_reply, Socks5CommandContext};
use crate::channel::Channel;
use crate::error::Socks5ReplyCode;
use crate::routing::RoutePolicy;
use crate::socks::udp::{ClientEndpoint, UdpRelaySession};
use anyhow::Result;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

/// Sets up a UDP relay session for the client
#[derive(Debug, Clone)]
pub struct UdpAssociateHandler {
    policy: RoutePolicy,
}

impl UdpAssociateHandler {
    /// Create a UDP ASSOCIATE handler
    pub fn new(policy: RoutePolicy) -> Self {
        UdpAssociateHandler { policy }
    }

    pub(super) async fn handle(&self, ctx: &mut Socks5CommandContext) -> Result<()> {
        let atyp = ctx.address_type();
        let declared = match read_address(&mut ctx.channel, atyp).await? {
            Some(addr) => addr,
            None => return Ok(()),
        };

        let control_peer = ctx.channel.remote_addr().ip();
        let client = ClientEndpoint::from_declared(&declared, control_peer);

        let bind_ip = ctx
            .channel
            .local_addr()
            .map(|addr| addr.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let session = UdpRelaySession::bind(
            SocketAddr::new(bind_ip, 0),
            client,
            self.policy.clone(),
            ctx.username.clone(),
        )
        .await?;
        let relay_addr = session.local_addr()?;

        send_reply(&mut ctx.channel, Socks5ReplyCode::Succeeded, relay_addr).await?;
        info!(
            "UDP ASSOCIATE for {} relaying on {}",
            ctx.channel.remote_addr(),
            relay_addr
        );

        let session_cancel = ctx.cancel.child_token();
        let session_task = tokio::spawn(session.run(session_cancel.clone()));

        tokio::select! {
            _ = monitor_control_stream(&mut ctx.channel) => {}
            _ = ctx.cancel.cancelled() => {
                debug!("UDP ASSOCIATE on {} cancelled", relay_addr);
            }
        }

        session_cancel.cancel();
        match session_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("UDP relay on {} ended with error: {:#}", relay_addr, e),
            Err(e) => warn!("UDP relay task on {} failed: {}", relay_addr, e),
        }

        info!("UDP ASSOCIATE session on {} ended", relay_addr);
        Ok(())
    }
}

/// Wait until the control stream closes
///
/// The UDP association terminates when the TCP control connection closes.
async fn monitor_control_stream(stream: &mut Channel) {
    let mut buf = [0u8; 1];

    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("Control stream closed, terminating UDP association");
                break;
            }
            Ok(_) => {
                debug!("Ignoring data on UDP control stream");
            }
            Err(e) => {
                debug!("Control stream error: {}", e);
                break;
            }
        }
    }
}
