//! # Socksrouter - SOCKS4/4a and SOCKS5 proxy server
//!
//! Socksrouter runs any number of SOCKS listeners from one configuration.
//! Each listener can terminate TLS, accept clients over one port or over a
//! split read/write port pair, and choose which SOCKS5 authentication
//! methods it offers.
//!
//! ## Features
//!
//! - **SOCKS5**: CONNECT, BIND and UDP ASSOCIATE with no-auth,
//!   username/password (RFC 1929) and GSS-API (RFC 1961) authentication
//! - **SOCKS4/4a**: CONNECT and BIND, with 4a domain names
//! - **Access control**: allow/deny rules on source IP and destination host
//! - **Private networks**: users reach each other's assigned addresses only
//!   when they share a network, with private DNS for internal host names
//! - **Split channels**: upstream and downstream bytes on separate TCP
//!   connections, paired by client IP
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksrouter::config::load_config;
//! use socksrouter::run_server;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("config.toml")?;
//!     let cancel = CancellationToken::new();
//!
//!     run_server(config, cancel).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! accept -> limiter -> source rules -> TLS -> protocol detection
//!        -> SOCKS4 / SOCKS5 (auth, command chain) -> route policy -> relay
//! ```

#![warn(missing_docs, rust_2018_idioms)]

pub mod channel;
pub mod config;
pub mod error;
pub mod routing;
pub mod server;
pub mod socks;
pub mod store;
pub mod transport;

pub use config::{load_config, Config};
pub use error::{ProxyError, Socks5Error};
pub use server::{run_server, Server, Services};

/// Crate version, logged at startup
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
