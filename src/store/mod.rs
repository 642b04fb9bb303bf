//! JSON file-backed stores
//!
//! Users, private networks and private DNS records live in JSON files under
//! the configured data directory. Each store loads its file once at startup
//! and keeps the records behind a `tokio::sync::RwLock`. Writers build the
//! new list, persist it while still holding the write lock and only then
//! swap it in, so a failed write leaves memory matching the file.

mod dns;
mod networks;
mod users;

pub use dns::{HostRecord, HostStore};
pub use networks::{NetworkMember, NetworkStore, PrivateNetwork};
pub use users::{User, UserStore};

use crate::error::ProxyError;
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tracing::debug;

/// File name of the user store
pub const USERS_FILE: &str = "users.json";
/// File name of the private network store
pub const NETWORKS_FILE: &str = "networks.json";
/// File name of the private DNS store
pub const HOSTS_FILE: &str = "hosts.json";
/// File name of the access rules
pub const RULES_FILE: &str = "rules.json";

/// Load a JSON list, treating a missing file as empty
fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        debug!("No store file at {:?}, starting empty", path);
        return Ok(Vec::new());
    }

    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
}

/// Write a JSON list, creating the parent directory when needed
async fn save_json<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {:?}", dir))?;
        }
    }

    let json = serde_json::to_string_pretty(records)
        .map_err(|e| ProxyError::Store(format!("Failed to encode {:?}: {}", path, e)))?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}
