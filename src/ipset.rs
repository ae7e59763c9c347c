//! CIDR membership for the primary address zone.
//!
//! Loaded once from a networks file (one CIDR per line) and then shared
//! read-only across all upstream validators.

use std::net::IpAddr;
use std::path::Path;

use anyhow::Context;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use prefix_trie::PrefixSet;
use tracing::info;

/// Immutable prefix trie answering "does this address belong to the primary
/// zone?" for both address families.
pub struct IpSet {
    v4: PrefixSet<Ipv4Net>,
    v6: PrefixSet<Ipv6Net>,
    len: usize,
}

impl IpSet {
    /// Load a networks file, one CIDR per line. Blank lines and `#` comments
    /// are skipped; anything else must parse as an IPv4 or IPv6 network.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let body = std::fs::read_to_string(path)
            .with_context(|| format!("read networks file {}", path.display()))?;

        let mut v4 = PrefixSet::new();
        let mut v6 = PrefixSet::new();
        let mut len = 0usize;
        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let net: IpNet = line
                .parse()
                .with_context(|| format!("invalid network {line:?} in {}", path.display()))?;
            match net {
                IpNet::V4(net) => {
                    v4.insert(net);
                }
                IpNet::V6(net) => {
                    v6.insert(net);
                }
            }
            len += 1;
        }
        info!("loaded {} primary networks from {}", len, path.display());
        Ok(Self { v4, v6, len })
    }

    /// Build a set from already-parsed networks. Used by tests.
    pub fn from_networks(nets: impl IntoIterator<Item = IpNet>) -> Self {
        let mut v4 = PrefixSet::new();
        let mut v6 = PrefixSet::new();
        let mut len = 0usize;
        for net in nets {
            match net {
                IpNet::V4(net) => {
                    v4.insert(net);
                }
                IpNet::V6(net) => {
                    v6.insert(net);
                }
            }
            len += 1;
        }
        Self { v4, v6, len }
    }

    /// Membership test against the loaded networks.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(ip) => self.v4.get_spm(&ip.into()).is_some(),
            IpAddr::V6(ip) => self.v6.get_spm(&ip.into()).is_some(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Private-range predicate: RFC1918 for IPv4 and unique-local (fc00::/7) for
/// IPv6. Link-local addresses are deliberately not private here.
pub fn is_private(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => ip.is_private(),
        IpAddr::V6(ip) => (ip.octets()[0] & 0xfe) == 0xfc,
    }
}
