//! Private DNS store
//!
//! Host names recorded here take precedence over the system resolver for
//! proxied destinations. Lookups ignore ASCII case and a trailing dot.

use super::{load_json, save_json, HOSTS_FILE};
use crate::error::ProxyError;
use crate::routing::DnsResolver;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Addresses recorded for one host name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRecord {
    /// Host name
    pub hostname: String,
    /// Addresses, in answer order
    pub addresses: Vec<IpAddr>,
}

/// `hosts.json` backed private DNS
#[derive(Debug)]
pub struct HostStore {
    path: PathBuf,
    records: RwLock<Vec<HostRecord>>,
}

fn same_host(a: &str, b: &str) -> bool {
    a.trim_end_matches('.')
        .eq_ignore_ascii_case(b.trim_end_matches('.'))
}

impl HostStore {
    /// Load `hosts.json` from `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let path = data_dir.as_ref().join(HOSTS_FILE);
        let records: Vec<HostRecord> = load_json(&path)?;
        debug!("Loaded {} private DNS records from {:?}", records.len(), path);

        Ok(HostStore {
            path,
            records: RwLock::new(records),
        })
    }

    /// All records
    pub async fn list(&self) -> Vec<HostRecord> {
        self.records.read().await.clone()
    }

    /// Addresses for `hostname`, empty when unknown
    pub async fn lookup(&self, hostname: &str) -> Vec<IpAddr> {
        let records = self.records.read().await;
        records
            .iter()
            .find(|r| same_host(&r.hostname, hostname))
            .map(|r| r.addresses.clone())
            .unwrap_or_default()
    }

    /// Add a record, replacing any existing one for the same name
    pub async fn add(&self, hostname: &str, addresses: Vec<IpAddr>) -> Result<()> {
        if hostname.trim_end_matches('.').is_empty() {
            return Err(ProxyError::Store("Host name must not be empty".to_string()).into());
        }
        if addresses.is_empty() {
            return Err(ProxyError::Store(format!("No addresses given for {}", hostname)).into());
        }

        let mut records = self.records.write().await;
        let mut updated = records.clone();
        updated.retain(|r| !same_host(&r.hostname, hostname));
        updated.push(HostRecord {
            hostname: hostname.to_string(),
            addresses,
        });
        save_json(&self.path, &updated).await?;
        *records = updated;

        info!("Recorded private host {}", hostname);
        Ok(())
    }

    /// Remove a record, returning whether one existed
    pub async fn remove(&self, hostname: &str) -> Result<bool> {
        let mut records = self.records.write().await;
        let mut updated = records.clone();
        updated.retain(|r| !same_host(&r.hostname, hostname));
        if updated.len() == records.len() {
            return Ok(false);
        }
        save_json(&self.path, &updated).await?;
        *records = updated;

        info!("Removed private host {}", hostname);
        Ok(true)
    }
}

#[async_trait]
impl DnsResolver for HostStore {
    async fn resolve(&self, hostname: &str) -> Vec<IpAddr> {
        self.lookup(hostname).await
    }
}
