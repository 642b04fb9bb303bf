//! Route decision logic
//!
//! Decides whether a destination may be reached and which socket address
//! to dial. Private (RFC 1918) destinations are governed by private-network
//! membership, everything else by the destination access rules.

use super::{AccessControl, DnsResolver, NoPrivateDns, NoPrivateNetworks, PrivateNetworks};
use crate::error::ProxyError;
use crate::socks::types::TargetAddr;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, trace};

/// Why a destination was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Private destination requested without an authenticated user
    AnonymousPrivate,
    /// Authenticated user shares no private network with the destination
    NotNetworkMember,
    /// Destination access rules reject the host
    Rules,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::AnonymousPrivate => write!(f, "anonymous access to private address"),
            DenyReason::NotNetworkMember => write!(f, "not a member of the destination network"),
            DenyReason::Rules => write!(f, "rejected by access rules"),
        }
    }
}

/// Outcome of a destination check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision {
    /// Destination may be dialed
    Allowed,
    /// Destination must be answered with "connection not allowed"
    Denied(DenyReason),
}

impl RouteDecision {
    /// True when the destination is allowed
    pub fn is_allowed(&self) -> bool {
        matches!(self, RouteDecision::Allowed)
    }
}

/// Check whether an address lies in the RFC 1918 private ranges
///
/// 10.0.0.0/8, 172.16.0.0/12 and 192.168.0.0/16. IPv4-mapped IPv6
/// addresses are classified by their IPv4 form.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| v4.is_private()).unwrap_or(false),
    }
}

/// Destination policy shared by every protocol handler
#[derive(Clone)]
pub struct RoutePolicy {
    access: Arc<AccessControl>,
    networks: Arc<dyn PrivateNetworks>,
    dns: Arc<dyn DnsResolver>,
}

impl fmt::Debug for RoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutePolicy")
            .field("access", &self.access)
            .finish_non_exhaustive()
    }
}

impl RoutePolicy {
    /// Create a policy from its collaborators
    pub fn new(
        access: Arc<AccessControl>,
        networks: Arc<dyn PrivateNetworks>,
        dns: Arc<dyn DnsResolver>,
    ) -> Self {
        RoutePolicy {
            access,
            networks,
            dns,
        }
    }

    /// A policy without rules, private networks or private DNS
    pub fn permissive() -> Self {
        RoutePolicy::new(
            Arc::new(AccessControl::allow_all()),
            Arc::new(NoPrivateNetworks),
            Arc::new(NoPrivateDns),
        )
    }

    /// The access rules
    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    /// Replace a domain target with the first private DNS answer, if any
    pub async fn resolve_private(&self, target: TargetAddr) -> TargetAddr {
        if let TargetAddr::Domain(domain, port) = &target {
            if let Some(ip) = self.dns.resolve(domain).await.first() {
                trace!("Private DNS resolved {} to {}", domain, ip);
                return TargetAddr::Ip(SocketAddr::new(*ip, *port));
            }
        }
        target
    }

    /// Decide whether a destination may be reached by `username`
    pub async fn authorize(&self, target: &TargetAddr, username: Option<&str>) -> RouteDecision {
        match target {
            TargetAddr::Ip(addr) if is_private(addr.ip()) => {
                self.authorize_private(addr.ip(), username).await
            }
            TargetAddr::Ip(addr) => self.authorize_host(&addr.ip().to_string()),
            TargetAddr::Domain(domain, _) => self.authorize_host(domain),
        }
    }

    async fn authorize_private(&self, ip: IpAddr, username: Option<&str>) -> RouteDecision {
        let username = match username {
            Some(name) if !name.is_empty() => name,
            _ => return RouteDecision::Denied(DenyReason::AnonymousPrivate),
        };

        if self.networks.is_connection_allowed(username, ip).await {
            RouteDecision::Allowed
        } else {
            RouteDecision::Denied(DenyReason::NotNetworkMember)
        }
    }

    fn authorize_host(&self, host: &str) -> RouteDecision {
        if self.access.is_destination_allowed(host) {
            RouteDecision::Allowed
        } else {
            RouteDecision::Denied(DenyReason::Rules)
        }
    }

    /// Resolve and authorize a destination, returning the address to dial
    ///
    /// Domains are first looked up in private DNS, then checked against the
    /// policy, then resolved through the system resolver. A public domain that
    /// the system resolver maps into a private range is checked again as a
    /// private destination.
    pub async fn route(
        &self,
        target: TargetAddr,
        username: Option<&str>,
    ) -> Result<SocketAddr, ProxyError> {
        let target = self.resolve_private(target).await;

        if let RouteDecision::Denied(reason) = self.authorize(&target, username).await {
            debug!("Destination {} denied: {}", target, reason);
            return Err(ProxyError::DestinationDenied(format!("{}: {}", target, reason)));
        }

        let addr = match &target {
            TargetAddr::Ip(addr) => return Ok(*addr),
            TargetAddr::Domain(..) => target
                .resolve()
                .await
                .map_err(|e| ProxyError::Unreachable(format!("{:#}", e)))?,
        };

        if is_private(addr.ip()) {
            if let RouteDecision::Denied(reason) = self.authorize_private(addr.ip(), username).await
            {
                debug!("Destination {} ({}) denied: {}", target, addr, reason);
                return Err(ProxyError::DestinationDenied(format!("{}: {}", target, reason)));
            }
        }

        Ok(addr)
    }
}
