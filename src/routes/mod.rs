// Routes module - route model, longest-prefix lookup and snapshot parsing

pub mod lookup;
pub mod parser;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

/// VRF name used when a request or a record does not name one.
pub const DEFAULT_VRF: &str = "default";

/// Local-preference assumed for entries that do not carry one (BGP default).
pub const DEFAULT_LOCAL_PREF: u32 = 100;

/// Protocol that installed a route, normalised across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Connected,
    Local,
    Static,
    Policy,
    Ebgp,
    Ibgp,
    Ospf,
    Isis,
    Mpls,
    Unknown,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Connected => "connected",
            Protocol::Local => "local",
            Protocol::Static => "static",
            Protocol::Policy => "policy",
            Protocol::Ebgp => "ebgp",
            Protocol::Ibgp => "ibgp",
            Protocol::Ospf => "ospf",
            Protocol::Isis => "isis",
            Protocol::Mpls => "mpls",
            Protocol::Unknown => "unknown",
        }
    }

    /// Entries a static/policy-routed device forwards on.
    pub fn is_static_table(&self) -> bool {
        matches!(
            self,
            Protocol::Static | Protocol::Policy | Protocol::Connected | Protocol::Local
        )
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One routing-table entry for a prefix on one device/VRF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub prefix: IpNet,
    /// None for locally originated and connected entries
    pub next_hop: Option<IpAddr>,
    pub protocol: Protocol,
    #[serde(default)]
    pub as_path: Vec<u32>,
    /// Raw community tags, decoded lazily
    #[serde(default)]
    pub communities: Vec<String>,
    pub local_pref: Option<u32>,
    pub metric: Option<u32>,
    pub active: bool,
    /// Advertising peer
    pub peer: Option<String>,
    pub interface: Option<String>,
    /// VRF the next device looks the prefix up in (VRF leak, parent/child eBGP)
    pub next_vrf: Option<String>,
}

impl RouteEntry {
    pub fn new(prefix: IpNet, protocol: Protocol) -> Self {
        RouteEntry {
            prefix,
            next_hop: None,
            protocol,
            as_path: Vec::new(),
            communities: Vec::new(),
            local_pref: None,
            metric: None,
            active: true,
            peer: None,
            interface: None,
            next_vrf: None,
        }
    }

    pub fn effective_local_pref(&self) -> u32 {
        self.local_pref.unwrap_or(DEFAULT_LOCAL_PREF)
    }

    pub fn effective_metric(&self) -> u32 {
        self.metric.unwrap_or(0)
    }

    /// Key that identifies an entry within one device/VRF table.
    pub fn identity(&self) -> (IpNet, Option<IpAddr>, Option<&str>) {
        (self.prefix, self.next_hop, self.peer.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Push,
    Swap,
    Pop,
}

/// MPLS action observed on a device for a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelOperation {
    pub action: LabelAction,
    pub label: u32,
    pub lsp: Option<String>,
}

/// A label operation together with the FEC and next-hop it was collected for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelBinding {
    pub fec: IpNet,
    /// None when the operation applies whatever the next-hop
    pub next_hop: Option<IpAddr>,
    pub operation: LabelOperation,
}

/// Label operations for `prefix` from the most specific FEC covering it. Bindings tied to
/// another next-hop are ignored.
pub fn label_operations(
    bindings: &[LabelBinding],
    prefix: &IpNet,
    next_hop: Option<IpAddr>,
) -> Vec<LabelOperation> {
    let matching: Vec<&LabelBinding> = bindings
        .iter()
        .filter(|b| b.fec.contains(prefix))
        .filter(|b| b.next_hop.is_none() || b.next_hop == next_hop)
        .collect();
    let Some(longest) = matching.iter().map(|b| b.fec.prefix_len()).max() else {
        return Vec::new();
    };
    matching
        .into_iter()
        .filter(|b| b.fec.prefix_len() == longest)
        .map(|b| b.operation.clone())
        .collect()
}

/// IGP/LDP adjacency reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Adjacency {
    pub neighbor: String,
    pub local_interface: Option<String>,
    pub neighbor_address: Option<IpAddr>,
    pub protocol: Option<String>,
}

/// Everything collected from one device in one collection cycle.
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub device: String,
    pub vendor: Option<String>,
    pub collected_at: Option<DateTime<Utc>>,
    /// Route entries keyed by VRF
    pub tables: BTreeMap<String, Vec<RouteEntry>>,
    pub labels: Vec<LabelBinding>,
    pub adjacencies: Vec<Adjacency>,
    /// Records that were skipped while parsing
    pub warnings: Vec<String>,
}

impl DeviceSnapshot {
    pub fn new(device: impl Into<String>) -> Self {
        DeviceSnapshot {
            device: device.into(),
            ..Default::default()
        }
    }

    pub fn add_route(&mut self, vrf: &str, entry: RouteEntry) {
        self.tables.entry(vrf.to_string()).or_default().push(entry);
    }

    pub fn route_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

/// Parse a prefix the way operators type them: CIDR, or a bare address as a host route.
/// Host bits are cleared.
pub fn parse_prefix(raw: &str) -> Option<IpNet> {
    let raw = raw.trim();
    if raw == "default" {
        return "0.0.0.0/0".parse().ok();
    }
    if let Ok(net) = raw.parse::<IpNet>() {
        return Some(net.trunc());
    }
    raw.parse::<IpAddr>().ok().map(IpNet::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefix() {
        assert_eq!(parse_prefix("8.8.8.0/24"), "8.8.8.0/24".parse().ok());
        assert_eq!(parse_prefix("8.8.8.1/24"), "8.8.8.0/24".parse().ok());
        assert_eq!(parse_prefix("8.8.8.8"), "8.8.8.8/32".parse().ok());
        assert_eq!(parse_prefix("default"), "0.0.0.0/0".parse().ok());
        assert_eq!(parse_prefix("2001:db8::/32"), "2001:db8::/32".parse().ok());
        assert_eq!(parse_prefix("8.8.8.0/33"), None);
        assert_eq!(parse_prefix("not-a-prefix"), None);
    }

    #[test]
    fn test_effective_defaults() {
        let entry = RouteEntry::new("10.0.0.0/8".parse().unwrap(), Protocol::Ebgp);
        assert_eq!(entry.effective_local_pref(), DEFAULT_LOCAL_PREF);
        assert_eq!(entry.effective_metric(), 0);
        assert!(Protocol::Static.is_static_table());
        assert!(!Protocol::Ibgp.is_static_table());
    }
}
