//! Server-wide configuration types
//!
//! Settings shared by every listener: timeouts, the data directory that
//! holds the JSON stores and socket tuning for accepted and outbound
//! connections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default data directory
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Default relay idle timeout in seconds
fn default_idle_timeout() -> u64 {
    300
}

/// Default outbound connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

/// Default TLS handshake timeout in seconds
fn default_handshake_timeout() -> u64 {
    10
}

/// Server-wide configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Directory holding users.json, networks.json, hosts.json and rules.json
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Relay idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// TLS handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,

    /// Report the real outbound local endpoint in CONNECT replies instead of 0.0.0.0:0
    #[serde(default)]
    pub report_bound_address: bool,

    /// Socket options for accepted and outbound TCP connections
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            data_dir: default_data_dir(),
            idle_timeout: default_idle_timeout(),
            connect_timeout: default_connect_timeout(),
            handshake_timeout: default_handshake_timeout(),
            report_bound_address: false,
            tcp: TcpConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Relay idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout)
    }

    /// Outbound connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// TLS handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than zero".to_string());
        }
        if self.connect_timeout == 0 {
            return Err("connect_timeout must be greater than zero".to_string());
        }
        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// Default TCP_NODELAY setting
fn default_nodelay() -> bool {
    true
}

/// TCP socket configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// Idle seconds before keepalive probes start; 0 disables keepalive
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}
