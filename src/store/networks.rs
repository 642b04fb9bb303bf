//! Private network store
//!
//! A private network is an IPv4 range whose members each get one address
//! from it. Two users may reach each other's assigned addresses only when
//! they share a network.

use super::{load_json, save_json, UserStore, NETWORKS_FILE};
use crate::error::ProxyError;
use crate::routing::PrivateNetworks;
use anyhow::Result;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// A user's membership in a network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkMember {
    /// Member name, as recorded in the user store
    pub username: String,
    /// Address assigned from the network's range
    pub assigned_ip: Ipv4Addr,
}

/// A private network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrivateNetwork {
    /// Random identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// IPv4 CIDR range, e.g. `10.1.0.0/16`
    pub ip_range: String,
    /// Members with their assigned addresses
    #[serde(default)]
    pub members: Vec<NetworkMember>,
}

impl PrivateNetwork {
    fn range(&self) -> Result<Ipv4Net> {
        self.ip_range
            .parse()
            .map_err(|_| ProxyError::Store(format!("Invalid IP range: {}", self.ip_range)).into())
    }

    fn has_member(&self, username: &str) -> bool {
        self.members
            .iter()
            .any(|m| m.username.eq_ignore_ascii_case(username))
    }

    /// First address between network+1 and broadcast-1 not yet assigned
    fn next_free_ip(&self) -> Result<Option<Ipv4Addr>> {
        let range = self.range()?;
        let first = u32::from(range.network()).saturating_add(1);
        let last = u32::from(range.broadcast()).saturating_sub(1);

        Ok((first..=last)
            .map(Ipv4Addr::from)
            .find(|ip| !self.members.iter().any(|m| m.assigned_ip == *ip)))
    }
}

/// `networks.json` backed network store
#[derive(Debug)]
pub struct NetworkStore {
    path: PathBuf,
    networks: RwLock<Vec<PrivateNetwork>>,
}

impl NetworkStore {
    /// Load `networks.json` from `data_dir`
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let path = data_dir.as_ref().join(NETWORKS_FILE);
        let networks: Vec<PrivateNetwork> = load_json(&path)?;
        debug!("Loaded {} private networks from {:?}", networks.len(), path);

        Ok(NetworkStore {
            path,
            networks: RwLock::new(networks),
        })
    }

    /// All networks
    pub async fn list(&self) -> Vec<PrivateNetwork> {
        self.networks.read().await.clone()
    }

    /// Look a network up by id
    pub async fn get(&self, id: &str) -> Option<PrivateNetwork> {
        let networks = self.networks.read().await;
        networks.iter().find(|n| n.id == id).cloned()
    }

    /// Create a network over an IPv4 CIDR range
    pub async fn create(&self, name: &str, ip_range: &str) -> Result<PrivateNetwork> {
        let range: Ipv4Net = ip_range
            .parse()
            .map_err(|_| ProxyError::Store(format!("Invalid IPv4 CIDR range: {}", ip_range)))?;

        let network = PrivateNetwork {
            id: Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            ip_range: range.to_string(),
            members: Vec::new(),
        };

        let mut networks = self.networks.write().await;
        let mut updated = networks.clone();
        updated.push(network.clone());
        save_json(&self.path, &updated).await?;
        *networks = updated;

        info!("Created private network {} ({}) over {}", network.name, network.id, range);
        Ok(network)
    }

    /// Add an existing user to a network, assigning the first free address
    pub async fn add_member(
        &self,
        users: &UserStore,
        username: &str,
        network_id: &str,
    ) -> Result<NetworkMember> {
        let user = users
            .get(username)
            .await
            .ok_or_else(|| ProxyError::Store(format!("User '{}' not found", username)))?;

        let mut networks = self.networks.write().await;
        let mut updated = networks.clone();
        let network = updated
            .iter_mut()
            .find(|n| n.id == network_id)
            .ok_or_else(|| ProxyError::Store(format!("Network '{}' not found", network_id)))?;

        if network.has_member(&user.username) {
            return Err(ProxyError::Store(format!(
                "User '{}' is already a member of {}",
                user.username, network.name
            ))
            .into());
        }

        let assigned_ip = network.next_free_ip()?.ok_or_else(|| {
            ProxyError::Store(format!("Network {} has no free addresses", network.name))
        })?;
        let member = NetworkMember {
            username: user.username,
            assigned_ip,
        };
        network.members.push(member.clone());
        save_json(&self.path, &updated).await?;
        *networks = updated;

        info!("Assigned {} to {} in {}", member.assigned_ip, member.username, network_id);
        Ok(member)
    }

    /// Remove a user from a network, returning whether a member was removed
    pub async fn remove_member(&self, username: &str, network_id: &str) -> Result<bool> {
        let mut networks = self.networks.write().await;
        let mut updated = networks.clone();
        let network = updated
            .iter_mut()
            .find(|n| n.id == network_id)
            .ok_or_else(|| ProxyError::Store(format!("Network '{}' not found", network_id)))?;

        let before = network.members.len();
        network
            .members
            .retain(|m| !m.username.eq_ignore_ascii_case(username));
        if network.members.len() == before {
            return Ok(false);
        }
        save_json(&self.path, &updated).await?;
        *networks = updated;

        info!("Removed {} from {}", username, network_id);
        Ok(true)
    }

    /// True if `username` shares a network with the member assigned `destination`
    pub async fn connection_allowed(&self, username: &str, destination: IpAddr) -> bool {
        let destination = match destination.to_canonical() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => return false,
        };

        let networks = self.networks.read().await;
        networks
            .iter()
            .filter(|n| n.has_member(username))
            .any(|n| n.members.iter().any(|m| m.assigned_ip == destination))
    }
}

#[async_trait]
impl PrivateNetworks for NetworkStore {
    async fn is_connection_allowed(&self, username: &str, destination: IpAddr) -> bool {
        self.connection_allowed(username, destination).await
    }
}
