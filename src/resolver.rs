// Next-hop resolution: which device owns an address

use crate::inventory::Inventory;
use crate::routes::Adjacency;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Owner(String),
    /// Several devices claim the address
    Ambiguous(Vec<String>),
    /// Outside the known inventory
    Unknown,
}

#[derive(Debug, Clone, Default)]
pub struct NextHopResolver {
    owners: HashMap<IpAddr, BTreeSet<String>>,
}

impl NextHopResolver {
    /// Index inventory loopback and interface addresses. Adjacency-reported addresses
    /// fill in only what the inventory does not declare.
    pub fn build<'a>(
        inventory: &Inventory,
        adjacencies: impl IntoIterator<Item = &'a Adjacency>,
    ) -> Self {
        let mut owners: HashMap<IpAddr, BTreeSet<String>> = HashMap::new();
        for device in inventory.devices() {
            for addr in device.addresses() {
                owners.entry(addr).or_default().insert(device.hostname.clone());
            }
        }

        let mut learned: HashMap<IpAddr, BTreeSet<String>> = HashMap::new();
        for adjacency in adjacencies {
            if let Some(addr) = adjacency.neighbor_address {
                if !owners.contains_key(&addr) {
                    learned
                        .entry(addr)
                        .or_default()
                        .insert(adjacency.neighbor.clone());
                }
            }
        }
        owners.extend(learned);

        let resolver = NextHopResolver { owners };
        for (addr, claimants) in resolver.ambiguous_addresses() {
            tracing::warn!(
                "Address {} is claimed by several devices: {}",
                addr,
                claimants.join(", ")
            );
        }
        resolver
    }

    pub fn resolve(&self, next_hop: IpAddr) -> Resolution {
        match self.owners.get(&next_hop) {
            None => Resolution::Unknown,
            Some(owners) if owners.len() == 1 => owners
                .iter()
                .next()
                .map(|o| Resolution::Owner(o.clone()))
                .unwrap_or(Resolution::Unknown),
            Some(owners) => Resolution::Ambiguous(owners.iter().cloned().collect()),
        }
    }

    /// Resolve against the snapshot first, then against adjacencies that did not make it
    /// into the snapshot (live-collected devices).
    pub fn resolve_with<'a>(
        &self,
        next_hop: IpAddr,
        adjacencies: impl IntoIterator<Item = &'a Adjacency>,
    ) -> Resolution {
        let resolution = self.resolve(next_hop);
        if resolution != Resolution::Unknown {
            return resolution;
        }
        let learned: BTreeSet<&str> = adjacencies
            .into_iter()
            .filter(|a| a.neighbor_address == Some(next_hop))
            .map(|a| a.neighbor.as_str())
            .collect();
        match learned.len() {
            0 => Resolution::Unknown,
            1 => learned
                .into_iter()
                .next()
                .map(|o| Resolution::Owner(o.to_string()))
                .unwrap_or(Resolution::Unknown),
            _ => Resolution::Ambiguous(learned.into_iter().map(str::to_string).collect()),
        }
    }

    /// Addresses with more than one owner, sorted by address.
    pub fn ambiguous_addresses(&self) -> Vec<(IpAddr, Vec<String>)> {
        let mut ambiguous: Vec<(IpAddr, Vec<String>)> = self
            .owners
            .iter()
            .filter(|(_, owners)| owners.len() > 1)
            .map(|(addr, owners)| (*addr, owners.iter().cloned().collect()))
            .collect();
        ambiguous.sort();
        ambiguous
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::Device;

    fn device(name: &str, addrs: &[&str]) -> Device {
        let mut d = Device::new(name);
        for (i, a) in addrs.iter().enumerate() {
            d.interfaces.insert(format!("et-0/0/{}", i), a.parse().unwrap());
        }
        d
    }

    #[test]
    fn test_resolve_owner_and_unknown() {
        let mut inv = Inventory::default();
        let mut a = device("router-a", &["10.1.1.1"]);
        a.loopbacks.push("192.168.255.1".parse().unwrap());
        inv.add_device(a);
        inv.add_device(device("router-b", &["10.1.1.2"]));
        let resolver = NextHopResolver::build(&inv, []);

        assert_eq!(
            resolver.resolve("192.168.255.1".parse().unwrap()),
            Resolution::Owner("router-a".to_string())
        );
        assert_eq!(
            resolver.resolve("10.1.1.2".parse().unwrap()),
            Resolution::Owner("router-b".to_string())
        );
        assert_eq!(resolver.resolve("99.99.99.99".parse().unwrap()), Resolution::Unknown);
    }

    #[test]
    fn test_duplicate_address_is_ambiguous() {
        let mut inv = Inventory::default();
        inv.add_device(device("router-a", &["10.1.1.1"]));
        inv.add_device(device("router-b", &["10.1.1.1"]));
        let resolver = NextHopResolver::build(&inv, []);

        assert_eq!(
            resolver.resolve("10.1.1.1".parse().unwrap()),
            Resolution::Ambiguous(vec!["router-a".to_string(), "router-b".to_string()])
        );
        assert_eq!(resolver.ambiguous_addresses().len(), 1);
    }

    #[test]
    fn test_adjacency_fills_gaps_only() {
        let mut inv = Inventory::default();
        inv.add_device(device("router-a", &["10.1.1.1"]));
        let adjacencies = [
            Adjacency {
                neighbor: "router-z".to_string(),
                local_interface: None,
                neighbor_address: Some("10.1.1.1".parse().unwrap()),
                protocol: Some("isis".to_string()),
            },
            Adjacency {
                neighbor: "router-c".to_string(),
                local_interface: None,
                neighbor_address: Some("10.9.9.9".parse().unwrap()),
                protocol: None,
            },
        ];
        let resolver = NextHopResolver::build(&inv, &adjacencies);

        assert_eq!(
            resolver.resolve("10.1.1.1".parse().unwrap()),
            Resolution::Owner("router-a".to_string())
        );
        assert_eq!(
            resolver.resolve("10.9.9.9".parse().unwrap()),
            Resolution::Owner("router-c".to_string())
        );
    }

    #[test]
    fn test_resolve_with_collected_adjacencies() {
        let mut inv = Inventory::default();
        inv.add_device(device("router-a", &["10.1.1.1"]));
        let resolver = NextHopResolver::build(&inv, []);
        let collected = [Adjacency {
            neighbor: "router-z".to_string(),
            local_interface: Some("et-0/0/1".to_string()),
            neighbor_address: Some("10.5.5.5".parse().unwrap()),
            protocol: None,
        }];

        assert_eq!(
            resolver.resolve_with("10.5.5.5".parse().unwrap(), &collected),
            Resolution::Owner("router-z".to_string())
        );
        // The inventory still wins over collected adjacencies
        assert_eq!(
            resolver.resolve_with("10.1.1.1".parse().unwrap(), &collected),
            Resolution::Owner("router-a".to_string())
        );
        assert_eq!(
            resolver.resolve_with("10.6.6.6".parse().unwrap(), &collected),
            Resolution::Unknown
        );
    }
}
