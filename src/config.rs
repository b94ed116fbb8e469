//! # Configuration Management
//!
//! Server configuration and the IP allow-list.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//!
//! ## Security Considerations
//! - The allow-list is the only admission control: an empty list admits
//!   nobody, and there is no implicit localhost exception.
//! - A CIDR entry without a prefix length means exactly that one address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// Default listen address. The proxy speaks plaintext TCP; anything beyond
/// the allow-list (TLS, tunnels) belongs to the network in front of it.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:24000";

/// Main server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address, e.g. `"0.0.0.0:24000"`.
    pub listen: String,

    /// CIDR ranges admitted by the accept loop, e.g.
    /// `["192.168.1.0/24", "2001:db8::/32", "10.1.2.3"]`.
    /// Empty means every connection is refused.
    pub allowed_ips: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            allowed_ips: Vec::new(),
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            ProxyError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProxyError::Config(format!("failed to parse TOML: {e}")))
    }

    /// Validate the configuration for common issues.
    ///
    /// Returns a list of validation errors. Empty list means the
    /// configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen.is_empty() {
            errors.push("listen address cannot be empty".to_string());
        } else if self.listen.parse::<SocketAddr>().is_err() {
            errors.push(format!(
                "invalid listen address: '{}' (expected format: '0.0.0.0:24000')",
                self.listen
            ));
        }

        for spec in &self.allowed_ips {
            if let Err(error) = parse_cidr(spec) {
                errors.push(error.to_string());
            }
        }

        if self.allowed_ips.is_empty() {
            errors.push(
                "allowed_ips is empty: every connection will be refused".to_string(),
            );
        }

        errors
    }

    /// Validate and return Result - convenience method.
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Config(format!(
                "configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }

    /// Build the compiled allow-list for the accept loop.
    pub fn allow_list(&self) -> Result<AllowList> {
        AllowList::parse(&self.allowed_ips)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv4Cidr {
    network: u32,
    mask: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ipv6Cidr {
    network: u128,
    mask: u128,
}

enum Cidr {
    V4(Ipv4Cidr),
    V6(Ipv6Cidr),
}

fn parse_cidr(spec: &str) -> Result<Cidr> {
    let invalid = || ProxyError::Config(format!("invalid CIDR '{spec}'"));

    let (addr, prefix) = match spec.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix.parse::<u32>().map_err(|_| invalid())?)),
        None => (spec, None),
    };

    if let Ok(v4) = addr.parse::<Ipv4Addr>() {
        let prefix = prefix.unwrap_or(32);
        if prefix > 32 {
            return Err(invalid());
        }
        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        return Ok(Cidr::V4(Ipv4Cidr {
            network: u32::from(v4) & mask,
            mask,
        }));
    }

    if let Ok(v6) = addr.parse::<Ipv6Addr>() {
        let prefix = prefix.unwrap_or(128);
        if prefix > 128 {
            return Err(invalid());
        }
        let mask = if prefix == 0 {
            0
        } else {
            u128::MAX << (128 - prefix)
        };
        return Ok(Cidr::V6(Ipv6Cidr {
            network: u128::from(v6) & mask,
            mask,
        }));
    }

    Err(invalid())
}

/// Compiled IP allow-list. An address is admitted when it falls inside any
/// configured range of the matching family.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    v4: Vec<Ipv4Cidr>,
    v6: Vec<Ipv6Cidr>,
}

impl AllowList {
    /// Parse a list of CIDR strings. Rejects the whole list on the first
    /// malformed entry; a half-working allow-list is worse than none.
    pub fn parse(specs: &[String]) -> Result<Self> {
        let mut list = AllowList::default();
        for spec in specs {
            match parse_cidr(spec)? {
                Cidr::V4(cidr) => list.v4.push(cidr),
                Cidr::V6(cidr) => list.v6.push(cidr),
            }
        }
        Ok(list)
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => {
                let ip = u32::from(ip);
                self.v4.iter().any(|cidr| ip & cidr.mask == cidr.network)
            }
            IpAddr::V6(ip) => {
                let ip = u128::from(ip);
                self.v6.iter().any(|cidr| ip & cidr.mask == cidr.network)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow(specs: &[&str]) -> AllowList {
        let specs: Vec<String> = specs.iter().map(|s| s.to_string()).collect();
        AllowList::parse(&specs).unwrap()
    }

    #[test]
    fn defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen, "0.0.0.0:24000");
        assert!(config.allowed_ips.is_empty());
    }

    #[test]
    fn v4_range_matching() {
        let list = allow(&["192.168.1.0/24"]);
        assert!(list.contains("192.168.1.1".parse().unwrap()));
        assert!(list.contains("192.168.1.255".parse().unwrap()));
        assert!(!list.contains("192.168.2.1".parse().unwrap()));
        assert!(!list.contains("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn bare_address_is_a_full_prefix() {
        let list = allow(&["10.1.2.3"]);
        assert!(list.contains("10.1.2.3".parse().unwrap()));
        assert!(!list.contains("10.1.2.4".parse().unwrap()));
    }

    #[test]
    fn zero_prefix_matches_everything_in_family() {
        let list = allow(&["0.0.0.0/0"]);
        assert!(list.contains("203.0.113.9".parse().unwrap()));
        // But not the other family.
        assert!(!list.contains("::1".parse().unwrap()));
    }

    #[test]
    fn v6_range_matching() {
        let list = allow(&["2001:db8::/32", "::1"]);
        assert!(list.contains("2001:db8::42".parse().unwrap()));
        assert!(list.contains("::1".parse().unwrap()));
        assert!(!list.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn empty_list_denies_all() {
        let list = AllowList::default();
        assert!(!list.contains("127.0.0.1".parse().unwrap()));
        assert!(!list.contains("::1".parse().unwrap()));
    }

    #[test]
    fn malformed_cidrs_are_rejected() {
        for spec in ["", "hello", "10.0.0.0/33", "2001:db8::/129", "10.0.0.0/x"] {
            let specs = vec![spec.to_string()];
            assert!(AllowList::parse(&specs).is_err(), "accepted '{spec}'");
        }
    }
}
