//! GSS-API authentication handler
//!
//! Implements the RFC 1961 message framing for SOCKS5 method 0x01:
//!
//! ```text
//! +------+------+------+.......................+
//! | ver  | mtyp | len  |       token           |
//! +------+------+------+.......................+
//! | 0x01 | 0x01 | 0x02 | up to 2^16 - 1 octets |
//! +------+------+------+.......................+
//! ```
//!
//! The security mechanism itself (Kerberos or otherwise) is supplied through
//! [`GssapiAcceptor`]. Once the context is established and the protection
//! level agreed, every payload byte travels as a wrapped `mtyp = 0x03`
//! message. The authenticator hides that by returning a new channel whose
//! plain bytes are encapsulated by a background pump over the original one.

use super::AuthOutcome;
use crate::channel::Channel;
use crate::error::ProxyError;
use crate::socks::consts::*;
use anyhow::{bail, Context, Result};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tracing::{debug, info, trace};

/// Result of feeding one client token into a security context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GssStep {
    /// More tokens are needed; the output token goes back to the client
    Continue(Vec<u8>),
    /// Context established, optionally with a final token for the client
    Complete(Option<Vec<u8>>),
}

/// Server side of one GSS-API security context
pub trait SecurityContext: Send + Sync {
    /// Consume a context-establishment token from the client
    fn step(&mut self, token: &[u8]) -> Result<GssStep>;

    /// Authenticated principal, available once the context is complete
    fn principal(&self) -> Option<String>;

    /// Protect an outgoing message
    fn wrap(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify and unprotect an incoming message
    fn unwrap(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Factory for per-connection security contexts
pub trait GssapiAcceptor: Send + Sync {
    /// Start a fresh acceptor context
    fn new_context(&self) -> Box<dyn SecurityContext>;
}

/// GSS-API authentication handler
#[derive(Clone)]
pub struct GssapiAuth {
    acceptor: Arc<dyn GssapiAcceptor>,
}

impl fmt::Debug for GssapiAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GssapiAuth").finish_non_exhaustive()
    }
}

impl GssapiAuth {
    /// Create a GSS-API authenticator backed by `acceptor`
    pub fn new(acceptor: Arc<dyn GssapiAcceptor>) -> Self {
        GssapiAuth { acceptor }
    }

    /// Establish a context and wrap the channel in the negotiated protection
    pub async fn authenticate(&self, mut channel: Channel) -> AuthOutcome {
        let mut context = self.acceptor.new_context();

        let principal = match establish(&mut channel, context.as_mut()).await {
            Ok(principal) => principal,
            Err(e) => {
                debug!("GSS-API authentication from {} failed: {:#}", channel.remote_addr(), e);
                // Best effort; the client may already be gone
                let _ = channel.write_all(&[GSSAPI_VERSION, GSSAPI_MSG_ABORT]).await;
                return AuthOutcome::rejected(channel);
            }
        };

        info!("GSS-API authentication successful for {}", principal);

        let remote = channel.remote_addr();
        let context: Arc<dyn SecurityContext> = Arc::from(context);
        let (app_side, pump_side) = tokio::io::duplex(DEFAULT_BUFFER_SIZE * 2);
        tokio::spawn(pump(channel, pump_side, context));

        AuthOutcome::accepted(Channel::from_stream(app_side, remote), Some(principal))
    }
}

/// Drive context establishment and protection-level negotiation
async fn establish(channel: &mut Channel, context: &mut dyn SecurityContext) -> Result<String> {
    loop {
        let token = read_message(channel, GSSAPI_MSG_CONTEXT).await?;
        match context.step(&token)? {
            GssStep::Continue(reply) => {
                write_message(channel, GSSAPI_MSG_CONTEXT, &reply).await?;
            }
            GssStep::Complete(reply) => {
                if let Some(reply) = reply.filter(|r| !r.is_empty()) {
                    write_message(channel, GSSAPI_MSG_CONTEXT, &reply).await?;
                }
                break;
            }
        }
    }

    let principal = context
        .principal()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ProxyError::Auth("GSS-API context has no principal".to_string()))?;

    // Protection level: a single wrapped octet, echoed back as accepted
    let request = read_message(channel, GSSAPI_MSG_PROTECTION).await?;
    let level = context.unwrap(&request)?;
    if level.len() != 1 {
        bail!(ProxyError::Auth(format!(
            "Invalid protection level message of {} bytes",
            level.len()
        )));
    }
    trace!("GSS-API protection level {} for {}", level[0], principal);
    let reply = context.wrap(&level)?;
    write_message(channel, GSSAPI_MSG_PROTECTION, &reply).await?;

    Ok(principal)
}

/// Read one framed message of the expected type
async fn read_message<R: AsyncRead + Unpin>(reader: &mut R, expected: u8) -> Result<Vec<u8>> {
    let mut head = [0u8; 2];
    reader
        .read_exact(&mut head)
        .await
        .context("Failed to read GSS-API message header")?;

    if head[0] != GSSAPI_VERSION {
        bail!(ProxyError::Protocol(format!(
            "Invalid GSS-API version: {}",
            head[0]
        )));
    }
    if head[1] == GSSAPI_MSG_ABORT {
        bail!(ProxyError::Auth("Client aborted GSS-API negotiation".to_string()));
    }
    if head[1] != expected {
        bail!(ProxyError::Protocol(format!(
            "Unexpected GSS-API message type {:#04x}, expected {:#04x}",
            head[1], expected
        )));
    }

    let len = reader.read_u16().await? as usize;
    let mut token = vec![0u8; len];
    reader.read_exact(&mut token).await?;
    Ok(token)
}

/// Write one framed message
async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, mtyp: u8, token: &[u8]) -> Result<()> {
    let len = u16::try_from(token.len()).map_err(|_| {
        ProxyError::Protocol(format!("GSS-API token too large: {} bytes", token.len()))
    })?;

    let mut frame = Vec::with_capacity(4 + token.len());
    frame.push(GSSAPI_VERSION);
    frame.push(mtyp);
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(token);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Unwrap data messages from the client onto the plain side
async fn decapsulate<R, W>(wire: &mut R, plain: &mut W, context: &dyn SecurityContext) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let wrapped = read_message(wire, GSSAPI_MSG_DATA).await?;
        let data = context.unwrap(&wrapped)?;
        plain.write_all(&data).await?;
    }
}

/// Wrap plain-side output into data messages for the client
async fn encapsulate<R, W>(plain: &mut R, wire: &mut W, context: &dyn SecurityContext) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; DEFAULT_BUFFER_SIZE];
    loop {
        let n = plain.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let wrapped = context.wrap(&buf[..n])?;
        write_message(wire, GSSAPI_MSG_DATA, &wrapped).await?;
    }
}

/// Move bytes between the plain side and the encapsulated channel
async fn pump(channel: Channel, plain: DuplexStream, context: Arc<dyn SecurityContext>) {
    let remote = channel.remote_addr();
    let (mut wire_read, mut wire_write) = tokio::io::split(channel);
    let (mut plain_read, mut plain_write) = tokio::io::split(plain);

    tokio::select! {
        result = decapsulate(&mut wire_read, &mut plain_write, context.as_ref()) => {
            if let Err(e) = result {
                trace!("GSS-API inbound from {} ended: {:#}", remote, e);
            }
        }
        result = encapsulate(&mut plain_read, &mut wire_write, context.as_ref()) => {
            if let Err(e) = result {
                trace!("GSS-API outbound to {} ended: {:#}", remote, e);
            }
        }
    }

    let mut channel = wire_read.unsplit(wire_write);
    channel.close().await;
}
