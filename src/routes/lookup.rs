// Route lookup engine with longest prefix matching

use super::{DeviceSnapshot, Protocol, RouteEntry};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How entries that tie on local-preference, metric and AS-path length but differ in
/// protocol are treated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum ProtocolTieBreak {
    /// Protocol does not matter; such entries are equal-cost.
    #[default]
    EqualCost,
    /// Earlier protocols win; protocols not listed rank last.
    Prefer { order: Vec<Protocol> },
}

impl ProtocolTieBreak {
    fn rank(&self, protocol: Protocol) -> usize {
        match self {
            ProtocolTieBreak::EqualCost => 0,
            ProtocolTieBreak::Prefer { order } => order
                .iter()
                .position(|p| *p == protocol)
                .unwrap_or(order.len()),
        }
    }
}

/// Display/iteration order: active first, then higher local-preference, lower metric,
/// shorter AS-path. Remaining ties fall back to protocol rank, next-hop and peer so the
/// order never depends on collection order.
pub fn compare_entries(a: &RouteEntry, b: &RouteEntry, tie_break: &ProtocolTieBreak) -> Ordering {
    b.active
        .cmp(&a.active)
        .then_with(|| b.effective_local_pref().cmp(&a.effective_local_pref()))
        .then_with(|| a.effective_metric().cmp(&b.effective_metric()))
        .then_with(|| a.as_path.len().cmp(&b.as_path.len()))
        .then_with(|| tie_break.rank(a.protocol).cmp(&tie_break.rank(b.protocol)))
        .then_with(|| a.next_hop.cmp(&b.next_hop))
        .then_with(|| a.peer.cmp(&b.peer))
}

/// Entries of `ordered` that share the best local-preference/metric tier, in order.
pub fn equal_cost_tier(ordered: &[RouteEntry], tie_break: &ProtocolTieBreak) -> Vec<RouteEntry> {
    let best = ordered
        .iter()
        .map(|e| tier_key(e, tie_break))
        .min();

    match best {
        Some(best) => ordered
            .iter()
            .filter(|e| tier_key(e, tie_break) == best)
            .cloned()
            .collect(),
        None => Vec::new(),
    }
}

// The active flag is not part of the key: an inactive entry with a better local-preference
// forms the tier on its own. `WalkSettings::prefer_active` filters before the tier is taken.
fn tier_key(entry: &RouteEntry, tie_break: &ProtocolTieBreak) -> (std::cmp::Reverse<u32>, u32, usize) {
    (
        std::cmp::Reverse(entry.effective_local_pref()),
        entry.effective_metric(),
        tie_break.rank(entry.protocol),
    )
}

/// Routes of one device/VRF, bucketed by prefix length.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    by_len: BTreeMap<u8, HashMap<IpNet, Vec<RouteEntry>>>,
    len: usize,
}

impl RouteTable {
    /// Build a table; entries repeating an existing (prefix, next-hop, peer) are dropped.
    pub fn new(entries: impl IntoIterator<Item = RouteEntry>) -> Self {
        let mut table = RouteTable::default();
        for entry in entries {
            table.insert(entry);
        }
        table
    }

    fn insert(&mut self, mut entry: RouteEntry) -> bool {
        entry.prefix = entry.prefix.trunc();
        let bucket = self
            .by_len
            .entry(entry.prefix.prefix_len())
            .or_default()
            .entry(entry.prefix)
            .or_default();

        if bucket.iter().any(|e| e.identity() == entry.identity()) {
            tracing::debug!("Dropping duplicate route entry for {}", entry.prefix);
            return false;
        }
        bucket.push(entry);
        self.len += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every entry tying for the longest prefix that covers `prefix`.
    pub fn longest_match(&self, prefix: &IpNet) -> &[RouteEntry] {
        for (&len, bucket) in self.by_len.range(..=prefix.prefix_len()).rev() {
            let Ok(covering) = IpNet::new(prefix.addr(), len) else {
                continue;
            };
            if let Some(entries) = bucket.get(&covering.trunc()) {
                return entries;
            }
        }
        &[]
    }
}

/// Route Snapshot Index: every device/VRF table of one snapshot generation.
#[derive(Debug, Clone, Default)]
pub struct RouteIndex {
    tables: HashMap<String, BTreeMap<String, RouteTable>>,
}

impl RouteIndex {
    pub fn build<'a>(devices: impl IntoIterator<Item = &'a DeviceSnapshot>) -> Self {
        let mut tables: HashMap<String, BTreeMap<String, RouteTable>> = HashMap::new();
        for snapshot in devices {
            let device_tables = tables.entry(snapshot.device.clone()).or_default();
            for (vrf, entries) in &snapshot.tables {
                device_tables.insert(vrf.clone(), RouteTable::new(entries.iter().cloned()));
            }
        }
        RouteIndex { tables }
    }

    pub fn has_device(&self, device: &str) -> bool {
        self.tables.contains_key(device)
    }

    pub fn has_vrf(&self, device: &str, vrf: &str) -> bool {
        self.tables
            .get(device)
            .is_some_and(|vrfs| vrfs.contains_key(vrf))
    }

    pub fn devices(&self) -> BTreeSet<&str> {
        self.tables.keys().map(String::as_str).collect()
    }

    pub fn route_count(&self) -> usize {
        self.tables
            .values()
            .flat_map(|vrfs| vrfs.values())
            .map(RouteTable::len)
            .sum()
    }

    /// Longest-prefix match on one device/VRF, ordered with the default tie-break.
    /// No covering entry yields an empty result.
    pub fn lookup(&self, device: &str, vrf: &str, prefix: &IpNet) -> Vec<RouteEntry> {
        self.lookup_with(device, vrf, prefix, &ProtocolTieBreak::default())
    }

    pub fn lookup_with(
        &self,
        device: &str,
        vrf: &str,
        prefix: &IpNet,
        tie_break: &ProtocolTieBreak,
    ) -> Vec<RouteEntry> {
        let Some(table) = self.tables.get(device).and_then(|vrfs| vrfs.get(vrf)) else {
            return Vec::new();
        };
        ordered(table.longest_match(prefix).to_vec(), tie_break)
    }
}

/// Sort entries by [`compare_entries`].
pub fn ordered(mut entries: Vec<RouteEntry>, tie_break: &ProtocolTieBreak) -> Vec<RouteEntry> {
    entries.sort_by(|a, b| compare_entries(a, b, tie_break));
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn entry(prefix: &str, next_hop: &str) -> RouteEntry {
        let mut e = RouteEntry::new(prefix.parse().unwrap(), Protocol::Ebgp);
        e.next_hop = Some(next_hop.parse().unwrap());
        e
    }

    #[test]
    fn test_longest_match_returns_all_ties() {
        let table = RouteTable::new(vec![
            entry("10.0.0.0/8", "192.0.2.1"),
            entry("10.1.0.0/16", "192.0.2.2"),
            entry("10.1.0.0/16", "192.0.2.3"),
            entry("0.0.0.0/0", "192.0.2.4"),
        ]);

        let hits = table.longest_match(&"10.1.2.0/24".parse().unwrap());
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|e| e.prefix.prefix_len() == 16));

        let hits = table.longest_match(&"10.9.0.0/24".parse().unwrap());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].prefix.prefix_len(), 8);

        let hits = table.longest_match(&"172.16.0.0/12".parse().unwrap());
        assert_eq!(hits[0].prefix.prefix_len(), 0);
    }

    #[test]
    fn test_less_specific_query_does_not_match_more_specific_route() {
        let table = RouteTable::new(vec![entry("10.1.0.0/16", "192.0.2.2")]);
        assert!(table.longest_match(&"10.0.0.0/8".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_no_covering_entry_is_empty() {
        let table = RouteTable::new(vec![entry("10.0.0.0/8", "192.0.2.1")]);
        assert!(table.longest_match(&"192.168.0.0/24".parse().unwrap()).is_empty());
        assert!(table.longest_match(&"2001:db8::/64".parse().unwrap()).is_empty());
    }

    #[test]
    fn test_duplicates_are_dropped() {
        let table = RouteTable::new(vec![
            entry("10.0.0.0/8", "192.0.2.1"),
            entry("10.0.0.0/8", "192.0.2.1"),
        ]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_ordering() {
        let mut inactive = entry("10.0.0.0/8", "192.0.2.1");
        inactive.active = false;
        inactive.local_pref = Some(300);
        let mut low_pref = entry("10.0.0.0/8", "192.0.2.2");
        low_pref.local_pref = Some(50);
        let mut high_metric = entry("10.0.0.0/8", "192.0.2.3");
        high_metric.metric = Some(20);
        let mut long_path = entry("10.0.0.0/8", "192.0.2.4");
        long_path.as_path = vec![7018, 3356, 15169];
        let best = entry("10.0.0.0/8", "192.0.2.5");

        let sorted = ordered(
            vec![inactive, low_pref, high_metric, long_path, best],
            &ProtocolTieBreak::default(),
        );
        let hops: Vec<IpAddr> = sorted.iter().filter_map(|e| e.next_hop).collect();
        let expected: Vec<IpAddr> = ["192.0.2.5", "192.0.2.4", "192.0.2.3", "192.0.2.2", "192.0.2.1"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(hops, expected);
    }

    #[test]
    fn test_equal_cost_tier() {
        let a = entry("10.0.0.0/8", "192.0.2.1");
        let b = entry("10.0.0.0/8", "192.0.2.2");
        let mut backup = entry("10.0.0.0/8", "192.0.2.3");
        backup.local_pref = Some(50);

        let tier = equal_cost_tier(&[a, b, backup], &ProtocolTieBreak::default());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_protocol_tie_break_policy() {
        let bgp = entry("10.0.0.0/8", "192.0.2.1");
        let mut stat = entry("10.0.0.0/8", "192.0.2.2");
        stat.protocol = Protocol::Static;
        let entries = [bgp, stat];

        assert_eq!(equal_cost_tier(&entries, &ProtocolTieBreak::EqualCost).len(), 2);

        let prefer_static = ProtocolTieBreak::Prefer {
            order: vec![Protocol::Static, Protocol::Ebgp],
        };
        let tier = equal_cost_tier(&ordered(entries.to_vec(), &prefer_static), &prefer_static);
        assert_eq!(tier.len(), 1);
        assert_eq!(tier[0].protocol, Protocol::Static);
    }

    #[test]
    fn test_index_lookup_by_device_and_vrf() {
        let mut rr1 = DeviceSnapshot::new("rr1");
        rr1.add_route("default", entry("8.8.8.0/24", "192.0.2.1"));
        rr1.add_route("CUST-A", entry("8.8.0.0/16", "192.0.2.9"));
        let index = RouteIndex::build([&rr1]);

        let prefix = "8.8.8.0/24".parse().unwrap();
        assert_eq!(index.lookup("rr1", "default", &prefix).len(), 1);
        assert_eq!(index.lookup("rr1", "CUST-A", &prefix)[0].prefix.prefix_len(), 16);
        assert!(index.lookup("rr1", "CUST-B", &prefix).is_empty());
        assert!(index.lookup("rr2", "default", &prefix).is_empty());
        assert!(index.has_vrf("rr1", "CUST-A"));
        assert_eq!(index.route_count(), 2);
    }
}
