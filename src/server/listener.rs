//! Listener accept loops
//!
//! A standard listener owns one listening socket; a split listener owns a
//! read-port and a write-port socket whose accepted halves meet in the
//! pairing service. Either way each complete channel is admitted through the
//! connection limiter and served on its own task, so the accept loop never
//! waits on a connection.

use super::handler::ConnectionHandler;
use super::limiter::ConnectionLimiter;
use super::pairing::{ConnectionPairing, SplitSide, SWEEP_INTERVAL};
use crate::channel::Channel;
use crate::config::{ChannelMode, ListenerConfig};
use crate::error::ProxyError;
use crate::transport::{bind_listener, SocketOpts};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Listening sockets of one listener
#[derive(Debug)]
enum Sockets {
    Standard(TcpListener),
    Split {
        read: TcpListener,
        write: TcpListener,
    },
}

/// One configured listener, bound and ready to accept
#[derive(Debug)]
pub struct ProxyListener {
    sockets: Sockets,
    acceptor: Arc<Acceptor>,
}

/// State shared by the accept loops of one listener
#[derive(Debug)]
struct Acceptor {
    handler: ConnectionHandler,
    limiter: ConnectionLimiter,
    socket_opts: SocketOpts,
    pairing: Arc<ConnectionPairing>,
}

impl ProxyListener {
    /// Bind the sockets described by `config`
    pub fn bind(
        config: &ListenerConfig,
        handler: ConnectionHandler,
        socket_opts: SocketOpts,
    ) -> Result<Self> {
        let bind = |port: u16| -> Result<TcpListener> {
            let addr = config
                .socket_addr(port)
                .map_err(ProxyError::Config)?;
            bind_listener(addr, config.backlog)
                .with_context(|| format!("Listener '{}': failed to bind {}", config.name, addr))
        };

        let sockets = match (config.channel_mode, config.split_ports) {
            (ChannelMode::Standard, _) => Sockets::Standard(bind(config.port)?),
            (ChannelMode::Split, Some(ports)) => Sockets::Split {
                read: bind(ports.read)?,
                write: bind(ports.write)?,
            },
            (ChannelMode::Split, None) => {
                return Err(ProxyError::Config(format!(
                    "Listener '{}': split mode requires split_ports",
                    config.name
                ))
                .into())
            }
        };

        Ok(ProxyListener {
            sockets,
            acceptor: Arc::new(Acceptor {
                handler,
                limiter: ConnectionLimiter::new(config.max_connections),
                socket_opts,
                pairing: Arc::new(ConnectionPairing::default()),
            }),
        })
    }

    /// Listener name
    pub fn name(&self) -> &str {
        self.acceptor.handler.name()
    }

    /// Bound addresses: one in standard mode, read then write in split mode
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let sockets: Vec<&TcpListener> = match &self.sockets {
            Sockets::Standard(listener) => vec![listener],
            Sockets::Split { read, write } => vec![read, write],
        };
        sockets
            .into_iter()
            .filter_map(|s| s.local_addr().ok())
            .collect()
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.name().to_string();
        info!("[{}] Listening on {:?}", name, self.local_addrs());

        let mut loops = JoinSet::new();
        match self.sockets {
            Sockets::Standard(listener) => {
                loops.spawn(accept_loop(
                    listener,
                    None,
                    self.acceptor.clone(),
                    cancel.clone(),
                ));
            }
            Sockets::Split { read, write } => {
                loops.spawn(accept_loop(
                    read,
                    Some(SplitSide::Read),
                    self.acceptor.clone(),
                    cancel.clone(),
                ));
                loops.spawn(accept_loop(
                    write,
                    Some(SplitSide::Write),
                    self.acceptor.clone(),
                    cancel.clone(),
                ));
                loops.spawn(
                    self.acceptor
                        .pairing
                        .clone()
                        .run_sweeper(SWEEP_INTERVAL, cancel.clone()),
                );
            }
        }

        while loops.join_next().await.is_some() {}
        info!("[{}] Stopped", name);
    }
}

async fn accept_loop(
    listener: TcpListener,
    side: Option<SplitSide>,
    acceptor: Arc<Acceptor>,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("[{}] Accept failed: {}", acceptor.handler.name(), e);
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                continue;
            }
        };
        acceptor.socket_opts.hint(&stream);

        if let Some(channel) = acceptor.complete(stream, addr, side) {
            acceptor.admit(channel, &cancel);
        }
    }
}

impl Acceptor {
    /// Turn an accepted socket into a channel, or park it for pairing
    fn complete(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        side: Option<SplitSide>,
    ) -> Option<Channel> {
        let result = match side {
            None => Channel::tcp(stream).map(Some),
            Some(side) => self.pairing.try_pair(stream, side),
        };

        match result {
            Ok(channel) => channel,
            Err(e) => {
                debug!("[{}] Dropped connection from {}: {}", self.handler.name(), addr, e);
                None
            }
        }
    }

    /// Spawn the connection task if the limiter has room
    fn admit(&self, channel: Channel, cancel: &CancellationToken) {
        let permit = match self.limiter.try_acquire() {
            Some(permit) => permit,
            None => {
                warn!(
                    "[{}] Connection limit {} reached, refusing {}",
                    self.handler.name(),
                    self.limiter.max(),
                    channel.remote_addr()
                );
                return;
            }
        };

        let handler = self.handler.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            let _permit = permit;
            handler.handle(channel, cancel).await;
        });
    }
}
