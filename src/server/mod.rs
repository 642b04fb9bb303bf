//! Proxy server
//!
//! Builds one [`ProxyListener`] per configured listener from the shared
//! stores and settings, then runs them all until shutdown.

mod handler;
mod limiter;
mod listener;
mod pairing;

pub use handler::ConnectionHandler;
pub use limiter::{ConnectionLimiter, ConnectionPermit};
pub use listener::ProxyListener;
pub use pairing::{ConnectionPairing, SplitSide, PAIRING_WINDOW, SWEEP_INTERVAL};

use crate::config::{Config, ListenerConfig};
use crate::routing::{AccessControl, RoutePolicy};
use crate::socks::auth::{Authenticator, GssapiAcceptor, GssapiAuth, NoAuth, PasswordAuth};
use crate::socks::command::CommandChain;
use crate::socks::consts::SOCKS5_AUTH_METHOD_GSSAPI;
use crate::socks::{ProtocolDispatcher, ProtocolHandler, ProxySettings, Socks4Handler, Socks5Handler};
use crate::store::{HostStore, NetworkStore, UserStore, RULES_FILE};
use crate::transport::{load_tls_acceptor, SocketOpts};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stores and rules shared by every listener
#[derive(Clone)]
pub struct Services {
    /// Credentials for the password method
    pub users: Arc<UserStore>,
    /// Private network membership
    pub networks: Arc<NetworkStore>,
    /// Private DNS records
    pub hosts: Arc<HostStore>,
    /// Source and destination rules
    pub access: Arc<AccessControl>,
    /// Backend for the GSS-API method, if any
    pub gssapi: Option<Arc<dyn GssapiAcceptor>>,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("access_rules", &self.access.len())
            .field("gssapi", &self.gssapi.is_some())
            .finish()
    }
}

impl Services {
    /// Open the stores and rules under the configured data directory
    pub fn open(config: &Config) -> Result<Self> {
        let data_dir = &config.server.data_dir;
        let access = AccessControl::load(data_dir.join(RULES_FILE), &config.rules)
            .context("Failed to load access rules")?;
        info!("Loaded {} access rules", access.len());

        Ok(Services {
            users: Arc::new(UserStore::open(data_dir)?),
            networks: Arc::new(NetworkStore::open(data_dir)?),
            hosts: Arc::new(HostStore::open(data_dir)?),
            access: Arc::new(access),
            gssapi: None,
        })
    }

    /// Register a GSS-API backend, enabling method 0x01 where allowed
    pub fn with_gssapi(mut self, acceptor: Arc<dyn GssapiAcceptor>) -> Self {
        self.gssapi = Some(acceptor);
        self
    }

    fn authenticators(&self) -> Vec<Authenticator> {
        let mut authenticators: Vec<Authenticator> = vec![
            NoAuth.into(),
            PasswordAuth::new(self.users.clone()).into(),
        ];
        if let Some(acceptor) = &self.gssapi {
            authenticators.push(GssapiAuth::new(acceptor.clone()).into());
        }
        authenticators
    }
}

/// All listeners of one configuration, bound and ready to run
#[derive(Debug)]
pub struct Server {
    listeners: Vec<ProxyListener>,
}

impl Server {
    /// Bind every configured listener
    pub fn bind(config: &Config, services: &Services) -> Result<Self> {
        let policy = RoutePolicy::new(
            services.access.clone(),
            services.networks.clone(),
            services.hosts.clone(),
        );
        let settings = ProxySettings::from_server_config(&config.server);
        let chain = Arc::new(CommandChain::new(policy.clone(), settings.clone()));
        let socket_opts = SocketOpts::from_tcp_config(&config.server.tcp);

        let listeners = config
            .listeners
            .iter()
            .map(|listener| {
                let handler = build_handler(config, listener, services, &policy, &settings, &chain)?;
                ProxyListener::bind(listener, handler, socket_opts.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Server { listeners })
    }

    /// Bound addresses of every listener, keyed by name
    pub fn local_addrs(&self) -> Vec<(String, Vec<SocketAddr>)> {
        self.listeners
            .iter()
            .map(|l| (l.name().to_string(), l.local_addrs()))
            .collect()
    }

    /// Run all listeners until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) {
        let mut running = JoinSet::new();
        for listener in self.listeners {
            running.spawn(listener.run(cancel.clone()));
        }
        while running.join_next().await.is_some() {}
        info!("All listeners stopped");
    }
}

fn build_handler(
    config: &Config,
    listener: &ListenerConfig,
    services: &Services,
    policy: &RoutePolicy,
    settings: &ProxySettings,
    chain: &Arc<CommandChain>,
) -> Result<ConnectionHandler> {
    if listener
        .allowed_auth_methods
        .contains(&SOCKS5_AUTH_METHOD_GSSAPI)
        && services.gssapi.is_none()
    {
        warn!(
            "[{}] GSS-API allowed but no backend is registered; method 0x01 will not be offered",
            listener.name
        );
    }

    let socks5 = Socks5Handler::new(
        services.authenticators(),
        &listener.allowed_auth_methods,
        chain.clone(),
    );
    let mut protocols = Vec::new();
    if listener.enable_socks4 {
        protocols.push(ProtocolHandler::Socks4(Socks4Handler::new(
            policy.clone(),
            settings.clone(),
        )));
    }
    protocols.push(ProtocolHandler::Socks5(socks5));

    let handler = ConnectionHandler::new(
        &listener.name,
        services.access.clone(),
        ProtocolDispatcher::new(protocols),
        config.server.idle_timeout(),
    );

    if listener.tls.enabled {
        let acceptor = load_tls_acceptor(&listener.tls)
            .with_context(|| format!("Listener '{}': failed to load TLS", listener.name))?;
        Ok(handler.with_tls(acceptor, config.server.handshake_timeout()))
    } else {
        Ok(handler)
    }
}

/// Open the stores, bind every listener and run until `cancel` fires
pub async fn run_server(config: Config, cancel: CancellationToken) -> Result<()> {
    let services = Services::open(&config)?;
    let server = Server::bind(&config, &services)?;

    for (name, addrs) in server.local_addrs() {
        info!("Listener '{}' bound to {:?}", name, addrs);
    }

    server.run(cancel).await;
    Ok(())
}
