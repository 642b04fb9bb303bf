//! Access control and routing decisions
//!
//! This module holds the destination policy used by every protocol handler
//! and the collaborator interfaces it consumes: private DNS and private
//! network membership.

mod access;
mod policy;

pub use access::{pattern_matches, AccessControl, AccessRule, RuleTarget, RuleType};
pub use policy::{is_private, DenyReason, RouteDecision, RoutePolicy};

use async_trait::async_trait;
use std::net::IpAddr;

/// Resolver for private/internal host names
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Addresses recorded for a host name, empty when unknown
    async fn resolve(&self, hostname: &str) -> Vec<IpAddr>;
}

/// Private network membership checks
#[async_trait]
pub trait PrivateNetworks: Send + Sync {
    /// True if `username` shares a private network with the member assigned `destination`
    async fn is_connection_allowed(&self, username: &str, destination: IpAddr) -> bool;
}

/// Private DNS that knows no hosts
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrivateDns;

#[async_trait]
impl DnsResolver for NoPrivateDns {
    async fn resolve(&self, _hostname: &str) -> Vec<IpAddr> {
        Vec::new()
    }
}

/// Private networks with no members
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPrivateNetworks;

#[async_trait]
impl PrivateNetworks for NoPrivateNetworks {
    async fn is_connection_allowed(&self, _username: &str, _destination: IpAddr) -> bool {
        false
    }
}
