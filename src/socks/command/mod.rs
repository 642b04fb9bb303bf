//! SOCKS5 command handling
//!
//! After authentication the SOCKS5 handler reads the 4-byte command header
//! and hands a [`Socks5CommandContext`] to the [`CommandChain`]. The chain
//! tries its handlers in order (CONNECT, BIND, UDP ASSOCIATE) and falls
//! through to "command not supported".

mod address;
mod bind;
mod connect;
mod reply;
mod udp_associate;

pub use address::read_address;
pub use bind::BindHandler;
pub use connect::ConnectHandler;
pub use reply::{encode_reply, send_reply, unspecified_addr};
pub use udp_associate::UdpAssociateHandler;

use super::consts::*;
use super::ProxySettings;
use crate::channel::Channel;
use crate::error::{is_cancelled, unsupported_address_type, Socks5Error, Socks5ReplyCode};
use crate::routing::RoutePolicy;
use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a command handler needs about one request
#[derive(Debug)]
pub struct Socks5CommandContext {
    /// Client channel, the one returned by authentication
    pub channel: Channel,
    header: [u8; 4],
    /// Relay idle timeout
    pub idle_timeout: Duration,
    /// Authenticated identity, if any
    pub username: Option<String>,
    /// Connection lifetime
    pub cancel: CancellationToken,
}

impl Socks5CommandContext {
    /// Build a context from the raw `[VER, CMD, RSV, ATYP]` header
    pub fn new(
        channel: Channel,
        header: [u8; 4],
        idle_timeout: Duration,
        username: Option<String>,
        cancel: CancellationToken,
    ) -> Self {
        Socks5CommandContext {
            channel,
            header,
            idle_timeout,
            username,
            cancel,
        }
    }

    /// The raw command header
    pub fn header(&self) -> [u8; 4] {
        self.header
    }

    /// `CMD` byte
    pub fn command(&self) -> u8 {
        self.header[1]
    }

    /// `ATYP` byte
    pub fn address_type(&self) -> u8 {
        self.header[3]
    }

    /// Reply on the client channel if it is still open
    pub async fn reply_if_connected(&mut self, code: Socks5ReplyCode) {
        if self.channel.is_connected() {
            if let Err(e) = send_reply(&mut self.channel, code, unspecified_addr()).await {
                debug!("Failed to send {:?} reply: {:#}", code, e);
            }
        }
    }
}

/// One link of the command chain
#[derive(Debug, Clone)]
pub enum CommandHandler {
    /// CONNECT (0x01)
    Connect(ConnectHandler),
    /// BIND (0x02)
    Bind(BindHandler),
    /// UDP ASSOCIATE (0x03)
    UdpAssociate(UdpAssociateHandler),
    /// Terminal link, answers every command with "not supported"
    Unsupported,
}

impl CommandHandler {
    /// Whether this link handles `command`
    pub fn handles(&self, command: u8) -> bool {
        match self {
            CommandHandler::Connect(_) => command == SOCKS5_CMD_TCP_CONNECT,
            CommandHandler::Bind(_) => command == SOCKS5_CMD_TCP_BIND,
            CommandHandler::UdpAssociate(_) => command == SOCKS5_CMD_UDP_ASSOCIATE,
            CommandHandler::Unsupported => true,
        }
    }

    async fn handle(&self, ctx: &mut Socks5CommandContext) -> Result<()> {
        match self {
            CommandHandler::Connect(handler) => handler.handle(ctx).await,
            CommandHandler::Bind(handler) => handler.handle(ctx).await,
            CommandHandler::UdpAssociate(handler) => handler.handle(ctx).await,
            CommandHandler::Unsupported => reply_not_supported(ctx).await,
        }
    }
}

async fn reply_not_supported(ctx: &mut Socks5CommandContext) -> Result<()> {
    debug!(
        "{} from {}",
        Socks5Error::CommandNotSupported(ctx.command()),
        ctx.channel.remote_addr()
    );
    send_reply(
        &mut ctx.channel,
        Socks5ReplyCode::CommandNotSupported,
        unspecified_addr(),
    )
    .await
}

/// Ordered command handlers, first match wins
#[derive(Debug, Clone)]
pub struct CommandChain {
    handlers: Vec<CommandHandler>,
}

impl CommandChain {
    /// The standard chain: CONNECT, BIND, UDP ASSOCIATE, unsupported
    pub fn new(policy: RoutePolicy, settings: ProxySettings) -> Self {
        CommandChain::from_handlers(vec![
            CommandHandler::Connect(ConnectHandler::new(policy.clone(), settings.clone())),
            CommandHandler::Bind(BindHandler::new()),
            CommandHandler::UdpAssociate(UdpAssociateHandler::new(policy)),
        ])
    }

    /// A chain of the given handlers, terminated by the unsupported handler
    pub fn from_handlers(mut handlers: Vec<CommandHandler>) -> Self {
        handlers.retain(|h| !matches!(h, CommandHandler::Unsupported));
        handlers.push(CommandHandler::Unsupported);
        CommandChain { handlers }
    }

    /// Run the first handler that accepts the context's command
    ///
    /// Address-type errors are answered with "address type not supported",
    /// other unexpected failures with "general failure" while the client
    /// channel is still open. Cancellation passes through untouched.
    pub async fn dispatch(&self, ctx: &mut Socks5CommandContext) -> Result<()> {
        let command = ctx.command();
        let result = match self.handlers.iter().find(|h| h.handles(command)) {
            Some(handler) => handler.handle(ctx).await,
            None => reply_not_supported(ctx).await,
        };

        let err = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if is_cancelled(&err) {
            return Err(err);
        }

        if let Some(atyp) = unsupported_address_type(&err) {
            debug!("Unsupported address type {:#04x}", atyp);
            ctx.reply_if_connected(Socks5ReplyCode::AddressTypeNotSupported)
                .await;
            return Ok(());
        }

        warn!("SOCKS5 command {:#04x} failed: {:#}", command, err);
        ctx.reply_if_connected(Socks5ReplyCode::GeneralFailure).await;
        Err(err)
    }
}
