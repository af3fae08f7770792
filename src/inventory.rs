// Device inventory loaded from TOML
//
// ```toml
// [domains.fw-t2]
// semantics = "static"
//
// [devices.pe-1]
// role = "pe"
// domain = "dc"
// vendor = "juniper"
// loopbacks = ["192.168.255.1"]
// interfaces = { "xe-0/0/0" = "10.0.1.1/30" }
// connection = { host = "10.0.0.1", port = 830 }
// ```

use crate::domain::RouteSemantics;
use crate::error::{TracerError, TracerResult};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainSpec {
    #[serde(default)]
    pub semantics: RouteSemantics,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    domains: BTreeMap<String, DomainSpec>,
    #[serde(default)]
    devices: BTreeMap<String, DeviceFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct DeviceFile {
    role: Option<String>,
    domain: Option<String>,
    vendor: Option<String>,
    #[serde(default)]
    loopbacks: Vec<String>,
    #[serde(default)]
    interfaces: BTreeMap<String, String>,
    #[serde(default)]
    bridges: Vec<String>,
    #[serde(default)]
    vrfs: Vec<String>,
    #[serde(default)]
    connection: toml::Table,
}

/// A device as declared by the inventory.
#[derive(Debug, Clone, Default)]
pub struct Device {
    pub hostname: String,
    pub role: Option<String>,
    pub domain: Option<String>,
    pub vendor: Option<String>,
    pub loopbacks: Vec<IpAddr>,
    /// Interface name to address
    pub interfaces: BTreeMap<String, IpAddr>,
    /// Domains a firewall sits between
    pub bridges: Vec<String>,
    pub vrfs: Vec<String>,
    /// Connection parameters, untouched by the tracer
    pub connection: toml::Table,
}

impl Device {
    pub fn new(hostname: impl Into<String>) -> Self {
        Device {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    /// Every address that identifies this device as a next-hop.
    pub fn addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.loopbacks
            .iter()
            .copied()
            .chain(self.interfaces.values().copied())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    devices: BTreeMap<String, Device>,
    domains: BTreeMap<String, DomainSpec>,
}

impl Inventory {
    pub fn load(path: &Path) -> TracerResult<Self> {
        tracing::info!("Loading inventory from: {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> TracerResult<Self> {
        let file: InventoryFile = toml::from_str(content)?;
        let mut inventory = Inventory {
            devices: BTreeMap::new(),
            domains: file.domains,
        };

        for (hostname, spec) in file.devices {
            let loopbacks = spec
                .loopbacks
                .iter()
                .map(|raw| parse_address(&hostname, raw))
                .collect::<TracerResult<Vec<_>>>()?;
            let interfaces = spec
                .interfaces
                .iter()
                .map(|(name, raw)| Ok((name.clone(), parse_address(&hostname, raw)?)))
                .collect::<TracerResult<BTreeMap<_, _>>>()?;

            inventory.add_device(Device {
                hostname: hostname.clone(),
                role: spec.role,
                domain: spec.domain,
                vendor: spec.vendor,
                loopbacks,
                interfaces,
                bridges: spec.bridges,
                vrfs: spec.vrfs,
                connection: spec.connection,
            });
        }

        tracing::info!(
            "Loaded inventory: {} devices, {} domains",
            inventory.devices.len(),
            inventory.domains.len()
        );
        Ok(inventory)
    }

    pub fn add_device(&mut self, device: Device) {
        self.devices.insert(device.hostname.clone(), device);
    }

    pub fn add_domain(&mut self, name: impl Into<String>, spec: DomainSpec) {
        self.domains.insert(name.into(), spec);
    }

    pub fn device(&self, hostname: &str) -> Option<&Device> {
        self.devices.get(hostname)
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.devices.contains_key(hostname)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn domains(&self) -> impl Iterator<Item = (&String, &DomainSpec)> {
        self.domains.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Interface addresses are often written with their mask ("10.0.1.1/30").
fn parse_address(hostname: &str, raw: &str) -> TracerResult<IpAddr> {
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<IpNet>().ok().map(|net| net.addr()))
        .ok_or_else(|| TracerError::Inventory(format!("{}: invalid address '{}'", hostname, raw)))
}
