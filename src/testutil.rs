// Small in-code topologies for unit tests

use crate::decoder::{DecoderRegistry, SiteCommunityDecoder};
use crate::domain::{BoundaryBlock, RouteSemantics};
use crate::error::{TracerError, TracerResult};
use crate::inventory::{Device, DomainSpec, Inventory};
use crate::routes::{DEFAULT_VRF, DeviceSnapshot, Protocol, RouteEntry};
use crate::snapshot::{Snapshot, SnapshotData, SnapshotSettings, SnapshotSource};
use crate::walker::{PathEngine, WalkSettings};
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub fn net(raw: &str) -> IpNet {
    raw.parse().unwrap()
}

pub fn loaded_at() -> DateTime<Utc> {
    "2026-10-16T09:00:00Z".parse().unwrap()
}

pub fn route(prefix: &str, next_hop: Option<&str>, protocol: Protocol) -> RouteEntry {
    let mut entry = RouteEntry::new(net(prefix), protocol);
    entry.next_hop = next_hop.map(|nh| nh.parse().unwrap());
    entry
}

#[derive(Debug, Clone, Default)]
pub struct Fixture {
    inventory: Inventory,
    devices: BTreeMap<String, DeviceSnapshot>,
    blocks: Vec<BoundaryBlock>,
}

impl Fixture {
    pub fn new() -> Self {
        Fixture::default()
    }

    /// Inventory device owning `address` as its loopback.
    pub fn device(mut self, name: &str, domain: Option<&str>, address: &str) -> Self {
        let mut device = Device::new(name);
        device.domain = domain.map(str::to_string);
        device.loopbacks.push(address.parse().unwrap());
        self.inventory.add_device(device);
        self
    }

    /// Mark an inventory device as joining several domains.
    pub fn bridging(mut self, name: &str, domains: &[&str]) -> Self {
        let mut device = self.inventory.device(name).cloned().unwrap_or_else(|| Device::new(name));
        device.bridges = domains.iter().map(|d| d.to_string()).collect();
        self.inventory.add_device(device);
        self
    }

    pub fn static_domain(mut self, name: &str) -> Self {
        self.inventory.add_domain(
            name,
            DomainSpec {
                semantics: RouteSemantics::Static,
                description: None,
            },
        );
        self
    }

    pub fn block(mut self, block: BoundaryBlock) -> Self {
        self.blocks.push(block);
        self
    }

    pub fn route(self, device: &str, prefix: &str, next_hop: Option<&str>, protocol: Protocol) -> Self {
        self.entry(device, DEFAULT_VRF, route(prefix, next_hop, protocol))
    }

    pub fn entry(mut self, device: &str, vrf: &str, entry: RouteEntry) -> Self {
        self.doc(device).add_route(vrf, entry);
        self
    }

    pub fn collected_at(mut self, device: &str, at: DateTime<Utc>) -> Self {
        self.doc(device).collected_at = Some(at);
        self
    }

    pub fn with_doc(mut self, device: &str, edit: impl FnOnce(&mut DeviceSnapshot)) -> Self {
        edit(self.doc(device));
        self
    }

    fn doc(&mut self, device: &str) -> &mut DeviceSnapshot {
        self.devices
            .entry(device.to_string())
            .or_insert_with(|| DeviceSnapshot::new(device))
    }

    pub fn settings(&self) -> SnapshotSettings {
        SnapshotSettings {
            boundary_blocks: self.blocks.clone(),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot::build(
            self.inventory.clone(),
            self.devices.values().cloned().collect(),
            &self.settings(),
            loaded_at(),
        )
    }

    pub fn engine(&self) -> PathEngine {
        self.engine_with(WalkSettings::default())
    }

    pub fn engine_with(&self, settings: WalkSettings) -> PathEngine {
        let decoders = DecoderRegistry::new().with(Arc::new(SiteCommunityDecoder::default()));
        PathEngine::new(Arc::new(self.snapshot()), Arc::new(decoders), settings)
    }
}

/// Serves a fixture as snapshot data and counts loads.
pub struct MemorySource {
    fixture: Fixture,
    loads: AtomicUsize,
    fail_next: AtomicBool,
}

impl MemorySource {
    pub fn new(fixture: Fixture) -> Self {
        MemorySource {
            fixture,
            loads: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn fail_next_load(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl SnapshotSource for MemorySource {
    fn describe(&self) -> String {
        "in-memory fixture".to_string()
    }

    fn load(&self) -> TracerResult<SnapshotData> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TracerError::Snapshot("fixture unavailable".to_string()));
        }
        Ok(SnapshotData {
            inventory: self.fixture.inventory.clone(),
            devices: self.fixture.devices.values().cloned().collect(),
            warnings: Vec::new(),
        })
    }
}
