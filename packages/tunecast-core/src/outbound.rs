//! Outbound URL guard.
//!
//! Any URL the transcoder is asked to fetch passes through this allowlist
//! first. The guard is syntactic: scheme, port, hostname and IP-literal
//! checks. It refuses loopback, link-local, multicast and (by default)
//! private ranges so a hostile recording source cannot point the worker at
//! internal services.

use std::net::IpAddr;
use std::str::FromStr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutboundError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("scheme not allowed: {0}")]
    SchemeDenied(String),
    #[error("port not allowed: {0}")]
    PortDenied(u16),
    #[error("host not allowed: {0}")]
    HostDenied(String),
    #[error("address not allowed: {0}")]
    AddressDenied(IpAddr),
}

/// Allowlist configuration for outbound fetches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundPolicy {
    /// Exact hostnames permitted. Empty = any hostname (IP rules still apply
    /// to IP literals).
    pub allow_hosts: Vec<String>,
    /// CIDR blocks permitted for IP-literal hosts. Entries here override the
    /// built-in refusals, which is how a receiver on RFC1918 space is
    /// whitelisted.
    pub allow_cidrs: Vec<String>,
    /// Permitted ports; an absent explicit port uses the scheme default.
    pub allow_ports: Vec<u16>,
    /// Permitted schemes.
    pub allow_schemes: Vec<String>,
}

impl Default for OutboundPolicy {
    fn default() -> Self {
        Self {
            allow_hosts: Vec::new(),
            allow_cidrs: Vec::new(),
            allow_ports: vec![80, 443, 8001, 8002],
            allow_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

/// Compiled form of [`OutboundPolicy`].
#[derive(Debug, Clone)]
pub struct OutboundGuard {
    allow_hosts: Vec<String>,
    allow_cidrs: Vec<IpNet>,
    allow_ports: Vec<u16>,
    allow_schemes: Vec<String>,
}

impl OutboundGuard {
    /// Compiles the policy; malformed CIDR entries are rejected up front.
    pub fn new(policy: &OutboundPolicy) -> Result<Self, String> {
        let mut allow_cidrs = Vec::with_capacity(policy.allow_cidrs.len());
        for raw in &policy.allow_cidrs {
            let net =
                IpNet::from_str(raw).map_err(|e| format!("invalid cidr {raw:?}: {e}"))?;
            allow_cidrs.push(net);
        }
        Ok(Self {
            allow_hosts: policy
                .allow_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            allow_cidrs,
            allow_ports: policy.allow_ports.clone(),
            allow_schemes: policy
                .allow_schemes
                .iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        })
    }

    /// Validates a raw URL, returning the parsed form on success.
    pub fn check(&self, raw: &str) -> Result<Url, OutboundError> {
        let url = Url::parse(raw).map_err(|e| OutboundError::InvalidUrl(e.to_string()))?;

        let scheme = url.scheme().to_ascii_lowercase();
        if !self.allow_schemes.iter().any(|s| *s == scheme) {
            return Err(OutboundError::SchemeDenied(scheme));
        }

        let port = url
            .port_or_known_default()
            .ok_or_else(|| OutboundError::InvalidUrl("missing port".to_string()))?;
        if !self.allow_ports.is_empty() && !self.allow_ports.contains(&port) {
            return Err(OutboundError::PortDenied(port));
        }

        match url.host() {
            Some(Host::Ipv4(ip)) => self.check_ip(IpAddr::V4(ip))?,
            Some(Host::Ipv6(ip)) => self.check_ip(IpAddr::V6(ip))?,
            Some(Host::Domain(domain)) => {
                let domain = domain.to_ascii_lowercase();
                if domain == "localhost" || domain.ends_with(".localhost") {
                    return Err(OutboundError::HostDenied(domain));
                }
                if !self.allow_hosts.is_empty() && !self.allow_hosts.contains(&domain) {
                    return Err(OutboundError::HostDenied(domain));
                }
            }
            None => return Err(OutboundError::InvalidUrl("missing host".to_string())),
        }

        Ok(url)
    }

    fn check_ip(&self, ip: IpAddr) -> Result<(), OutboundError> {
        if self.allow_cidrs.iter().any(|net| net.contains(&ip)) {
            return Ok(());
        }
        if is_forbidden_ip(&ip) {
            return Err(OutboundError::AddressDenied(ip));
        }
        Ok(())
    }
}

/// Address ranges never fetched unless explicitly allowlisted.
fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                // fe80::/10 link-local and fc00::/7 unique-local
                || (v6.segments()[0] & 0xffc0) == 0xfe80
                || (v6.segments()[0] & 0xfe00) == 0xfc00
        }
    }
}
