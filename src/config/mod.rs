//! Configuration module for Socksrouter
//!
//! This module provides configuration types and parsing for the proxy.

mod listener;
mod server;

pub use listener::{ChannelMode, ListenerConfig, SplitPorts, TlsConfig};
pub use server::{ServerConfig, TcpConfig};

use crate::routing::AccessRule;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Server-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Listeners to run
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,

    /// Inline access rules, appended to those in `rules.json`
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<(), String> {
        self.server.validate()?;

        if self.listeners.is_empty() {
            return Err("At least one listener must be configured".to_string());
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            listener.validate()?;
            if !names.insert(listener.name.to_lowercase()) {
                return Err(format!("Duplicate listener name: {}", listener.name));
            }
        }

        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse and validate configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config =
        toml::from_str(content).with_context(|| "Failed to parse configuration")?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}
