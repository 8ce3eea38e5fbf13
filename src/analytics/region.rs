//! Region resolution seam and an in-memory CIDR table backend

use anyhow::{anyhow, Context, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;

use crate::analytics::models::Region;

/// Maps a client IP to a coarse region
///
/// Implementations are read-only once constructed and must be total:
/// anything they cannot place resolves to [`Region::Unknown`].
pub trait RegionLookup: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Region;
}

/// Ranges that never carry a public geolocation
static RESERVED_NETS: LazyLock<Vec<IpNet>> = LazyLock::new(|| {
    [
        "0.0.0.0/8",
        "10.0.0.0/8",
        "100.64.0.0/10",
        "127.0.0.0/8",
        "169.254.0.0/16",
        "172.16.0.0/12",
        "192.0.0.0/24",
        "192.0.2.0/24",
        "192.168.0.0/16",
        "198.18.0.0/15",
        "198.51.100.0/24",
        "203.0.113.0/24",
        "224.0.0.0/4",
        "240.0.0.0/4",
        "::/128",
        "::1/128",
        "100::/64",
        "2001:db8::/32",
        "fc00::/7",
        "fe80::/10",
        "ff00::/8",
    ]
    .iter()
    .filter_map(|net| net.parse().ok())
    .collect()
});

/// Unwrap IPv4-mapped IPv6 addresses so they hit IPv4 data
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// True for loopback, private, link-local, documentation and other
/// non-routable addresses
pub fn is_reserved(ip: IpAddr) -> bool {
    let ip = canonical_ip(ip);
    RESERVED_NETS.iter().any(|net| net.contains(&ip))
}

/// Longest-prefix-match table of `network -> region code`
#[derive(Debug, Clone, Default)]
pub struct CidrTable {
    /// Sorted by descending prefix length so the first hit is the most specific
    entries: Vec<(IpNet, Region)>,
}

impl CidrTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, code: &str) {
        let net = net.trunc();
        self.entries.retain(|(existing, _)| *existing != net);
        self.entries.push((net, Region::known(code)));
        self.entries
            .sort_by(|(a, _), (b, _)| b.prefix_len().cmp(&a.prefix_len()));
    }

    /// Parse `cidr,code` lines; blank lines and `#` comments are skipped
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (net, code) = line
                .split_once(',')
                .ok_or_else(|| anyhow!("line {}: expected 'cidr,code'", idx + 1))?;
            let net: IpNet = net
                .trim()
                .parse()
                .with_context(|| format!("line {}: invalid network '{}'", idx + 1, net.trim()))?;
            table.insert(net, code.trim());
        }
        Ok(table)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read region table at {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("Failed to parse region table at {}", path.display()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl RegionLookup for CidrTable {
    fn resolve(&self, ip: IpAddr) -> Region {
        if is_reserved(ip) {
            return Region::Unknown;
        }
        let ip = canonical_ip(ip);
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, region)| region.clone())
            .unwrap_or(Region::Unknown)
    }
}
