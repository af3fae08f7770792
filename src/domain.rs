// Domain boundary classification
//
// Declared inventory membership is authoritative. When the inventory says nothing about a
// device, the next-hop address that led to it can still place it: firewall tiers are
// addressed out of reserved blocks, one small slot per firewall instance.

use crate::inventory::Inventory;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;

/// Which route table a domain forwards on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteSemantics {
    /// Dynamic RIB (BGP/IGP plus static and connected)
    #[default]
    Dynamic,
    /// Static/policy routes only
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainSource {
    Declared,
    /// Derived from addressing; lower confidence
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainAssignment {
    pub domain: String,
    pub source: DomainSource,
}

/// Reserved addressing block that identifies a boundary tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryBlock {
    pub block: IpNet,
    /// Prefix length of one firewall instance's slot inside the block
    #[serde(default = "default_slot_len")]
    pub slot_len: u8,
    pub domain: String,
    pub role: String,
    pub region: Option<String>,
}

fn default_slot_len() -> u8 {
    29
}

/// A boundary device placed purely from its address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferredBoundary {
    pub device: String,
    pub role: String,
    pub domain: String,
    pub region: Option<String>,
    pub slot: IpNet,
}

#[derive(Debug, Clone, Default)]
pub struct DomainClassifier {
    declared: HashMap<String, String>,
    bridges: HashMap<String, Vec<String>>,
    semantics: HashMap<String, RouteSemantics>,
    blocks: Vec<BoundaryBlock>,
}

impl DomainClassifier {
    pub fn new(inventory: &Inventory, blocks: Vec<BoundaryBlock>) -> Self {
        let declared = inventory
            .devices()
            .filter_map(|d| d.domain.clone().map(|domain| (d.hostname.clone(), domain)))
            .collect();
        let bridges = inventory
            .devices()
            .filter(|d| !d.bridges.is_empty())
            .map(|d| (d.hostname.clone(), d.bridges.clone()))
            .collect();
        let mut semantics: HashMap<String, RouteSemantics> = inventory
            .domains()
            .map(|(name, spec)| (name.clone(), spec.semantics))
            .collect();
        for block in &blocks {
            semantics
                .entry(block.domain.clone())
                .or_insert(RouteSemantics::Static);
        }

        DomainClassifier {
            declared,
            bridges,
            semantics,
            blocks,
        }
    }

    /// Inventory-declared domain of a device.
    pub fn domain_of(&self, device: &str) -> Option<&str> {
        self.declared.get(device).map(String::as_str)
    }

    /// Domain of `device`, falling back to the boundary blocks with the address traffic
    /// was sent to.
    pub fn classify(&self, device: &str, referred_via: Option<IpAddr>) -> Option<DomainAssignment> {
        if let Some(domain) = self.domain_of(device) {
            return Some(DomainAssignment {
                domain: domain.to_string(),
                source: DomainSource::Declared,
            });
        }

        referred_via
            .and_then(|addr| self.matching_block(addr))
            .map(|block| DomainAssignment {
                domain: block.domain.clone(),
                source: DomainSource::Inferred,
            })
    }

    /// Domains a boundary device sits between, as declared by the inventory.
    pub fn bridges_of(&self, device: &str) -> &[String] {
        self.bridges.get(device).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when both devices have a declared domain and the domains differ.
    pub fn crosses_boundary(&self, from_device: &str, to_device: &str) -> bool {
        match (self.domain_of(from_device), self.domain_of(to_device)) {
            (Some(from), Some(to)) => from != to,
            _ => false,
        }
    }

    /// Identify an uninventoried boundary device from a next-hop address.
    pub fn infer_boundary(&self, addr: IpAddr) -> Option<InferredBoundary> {
        let block = self.matching_block(addr)?;
        let slot = IpNet::new(addr, block.slot_len).ok()?.trunc();
        let device = match &block.region {
            Some(region) => format!("{}-{}-{}", block.role, region, slot),
            None => format!("{}-{}", block.role, slot),
        };

        Some(InferredBoundary {
            device,
            role: block.role.clone(),
            domain: block.domain.clone(),
            region: block.region.clone(),
            slot,
        })
    }

    /// Unknown domains forward on the dynamic RIB.
    pub fn semantics_of(&self, domain: Option<&str>) -> RouteSemantics {
        domain
            .and_then(|d| self.semantics.get(d).copied())
            .unwrap_or_default()
    }

    fn matching_block(&self, addr: IpAddr) -> Option<&BoundaryBlock> {
        self.blocks
            .iter()
            .filter(|b| b.block.contains(&addr))
            .max_by_key(|b| b.block.prefix_len())
    }
}
