//! Listener configuration types
//!
//! Each `[[listeners]]` entry describes one logical listener: where it binds,
//! which protocols and authentication methods it accepts, whether it
//! terminates TLS and whether clients arrive on one port or on a split
//! read/write port pair.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

/// Default bind host
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default listen port
fn default_port() -> u16 {
    1080
}

/// Default listen backlog
fn default_backlog() -> u32 {
    128
}

/// Default per-listener connection cap
fn default_max_connections() -> usize {
    1024
}

/// Default allowed authentication methods (no authentication)
fn default_auth_methods() -> Vec<u8> {
    vec![0x00]
}

/// Default SOCKS4 toggle
fn default_enable_socks4() -> bool {
    true
}

/// How client traffic reaches the listener
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChannelMode {
    /// One TCP connection carries both directions
    #[default]
    Standard,
    /// Reads and writes arrive on two connections to two ports
    Split,
}

/// Port pair used by split channel mode
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SplitPorts {
    /// Port the client sends its upstream bytes to
    pub read: u16,
    /// Port the client receives downstream bytes from
    pub write: u16,
}

/// TLS termination settings
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Terminate TLS on accepted connections
    #[serde(default)]
    pub enabled: bool,

    /// PEM certificate chain
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM private key
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    /// Key password (encrypted keys are not supported)
    #[serde(default)]
    pub password: Option<String>,
}

impl TlsConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.enabled {
            return Ok(());
        }
        if self.cert_path.is_none() {
            return Err("TLS enabled but cert_path is not set".to_string());
        }
        if self.key_path.is_none() {
            return Err("TLS enabled but key_path is not set".to_string());
        }
        Ok(())
    }
}

/// Listener configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenerConfig {
    /// Unique listener name, also the connection limiter key
    pub name: String,

    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port (standard mode)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Maximum concurrent connections, 0 for unlimited
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// SOCKS5 authentication methods this listener accepts
    #[serde(default = "default_auth_methods")]
    pub allowed_auth_methods: Vec<u8>,

    /// Accept SOCKS4/4a clients
    #[serde(default = "default_enable_socks4")]
    pub enable_socks4: bool,

    /// Standard or split channel mode
    #[serde(default)]
    pub channel_mode: ChannelMode,

    /// Read/write ports for split mode
    #[serde(default)]
    pub split_ports: Option<SplitPorts>,

    /// TLS termination
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            name: "default".to_string(),
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            allowed_auth_methods: default_auth_methods(),
            enable_socks4: default_enable_socks4(),
            channel_mode: ChannelMode::Standard,
            split_ports: None,
            tls: TlsConfig::default(),
        }
    }
}

impl ListenerConfig {
    /// Parse the bind host as an IP address
    pub fn bind_ip(&self) -> Result<IpAddr, String> {
        self.host
            .parse()
            .map_err(|_| format!("Listener '{}': invalid host '{}'", self.name, self.host))
    }

    /// Socket address for a given port on this listener's host
    pub fn socket_addr(&self, port: u16) -> Result<SocketAddr, String> {
        Ok(SocketAddr::new(self.bind_ip()?, port))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("Listener name must not be empty".to_string());
        }
        self.bind_ip()?;
        if self.allowed_auth_methods.is_empty() {
            return Err(format!(
                "Listener '{}': allowed_auth_methods must not be empty",
                self.name
            ));
        }
        if let Some(method) = self
            .allowed_auth_methods
            .iter()
            .find(|m| !matches!(m, 0x00..=0x02))
        {
            return Err(format!(
                "Listener '{}': unknown authentication method {:#04x}",
                self.name, method
            ));
        }
        if self.channel_mode == ChannelMode::Split {
            match self.split_ports {
                None => {
                    return Err(format!(
                        "Listener '{}': split mode requires split_ports",
                        self.name
                    ))
                }
                Some(ports) if ports.read == ports.write => {
                    return Err(format!(
                        "Listener '{}': split read and write ports must differ",
                        self.name
                    ))
                }
                Some(_) => {}
            }
        }
        self.tls
            .validate()
            .map_err(|e| format!("Listener '{}': {}", self.name, e))
    }
}
