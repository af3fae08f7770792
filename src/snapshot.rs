// Snapshot generations and the atomic snapshot store
//
// A `Snapshot` is built once from one load of the inventory plus every device document and
// is never modified afterwards. Reloading builds a new generation and swaps it in; traces
// that already hold the previous `Arc<Snapshot>` finish against it.

use crate::domain::{BoundaryBlock, DomainClassifier, RouteSemantics};
use crate::error::{TracerError, TracerResult};
use crate::inventory::Inventory;
use crate::resolver::{NextHopResolver, Resolution};
use crate::routes::lookup::{ProtocolTieBreak, RouteIndex};
use crate::routes::parser::parse_device_document;
use crate::routes::{DeviceSnapshot, LabelBinding, LabelOperation, RouteEntry, label_operations};
use crate::simulate::Exclusion;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;
use tokio::time::{Duration, interval};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    /// Devices collected longer ago than this are reported as stale
    pub stale_after: chrono::Duration,
    pub boundary_blocks: Vec<BoundaryBlock>,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        SnapshotSettings {
            stale_after: chrono::Duration::seconds(3600),
            boundary_blocks: Vec::new(),
        }
    }
}

/// Raw material for one generation, as returned by a [`SnapshotSource`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotData {
    pub inventory: Inventory,
    pub devices: Vec<DeviceSnapshot>,
    /// Documents that could not be read at all
    pub warnings: Vec<String>,
}

pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    fn load(&self) -> TracerResult<SnapshotData>;
}

/// Inventory TOML plus a directory holding one JSON document per device.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    inventory_path: PathBuf,
    snapshot_dir: PathBuf,
}

impl DirectorySource {
    pub fn new(inventory_path: impl Into<PathBuf>, snapshot_dir: impl Into<PathBuf>) -> Self {
        DirectorySource {
            inventory_path: inventory_path.into(),
            snapshot_dir: snapshot_dir.into(),
        }
    }

    fn read_document(path: &Path) -> TracerResult<DeviceSnapshot> {
        let fallback = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let content = std::fs::read_to_string(path)?;
        parse_device_document(&content, &fallback)
    }
}

impl SnapshotSource for DirectorySource {
    fn describe(&self) -> String {
        format!(
            "inventory {} with snapshots in {}",
            self.inventory_path.display(),
            self.snapshot_dir.display()
        )
    }

    fn load(&self) -> TracerResult<SnapshotData> {
        let inventory = Inventory::load(&self.inventory_path)?;

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.snapshot_dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut data = SnapshotData {
            inventory,
            ..Default::default()
        };
        for path in files {
            match Self::read_document(&path) {
                Ok(device) => data.devices.push(device),
                Err(e) => {
                    tracing::warn!("Skipping snapshot document {}: {}", path.display(), e);
                    data.warnings.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        Ok(data)
    }
}

/// One immutable, point-in-time view of all collected routing state.
#[derive(Debug)]
pub struct Snapshot {
    generation: Uuid,
    loaded_at: DateTime<Utc>,
    inventory: Arc<Inventory>,
    index: RouteIndex,
    labels: HashMap<String, Vec<LabelBinding>>,
    /// Device to age in seconds, for devices older than the staleness threshold
    stale: BTreeMap<String, i64>,
    resolver: NextHopResolver,
    classifier: DomainClassifier,
    load_warnings: Vec<String>,
}

impl Snapshot {
    /// Build a generation. When several documents name the same device the most recently
    /// collected one is kept.
    pub fn build(
        inventory: Inventory,
        devices: Vec<DeviceSnapshot>,
        settings: &SnapshotSettings,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let mut latest: BTreeMap<String, DeviceSnapshot> = BTreeMap::new();
        for doc in devices {
            if let Some(existing) = latest.get(&doc.device) {
                if existing.collected_at >= doc.collected_at {
                    tracing::warn!("Ignoring older duplicate snapshot for {}", doc.device);
                    continue;
                }
            }
            latest.insert(doc.device.clone(), doc);
        }

        let mut load_warnings = Vec::new();
        let mut stale = BTreeMap::new();
        for doc in latest.values() {
            load_warnings.extend(doc.warnings.iter().cloned());
            if !inventory.contains(&doc.device) {
                tracing::debug!("Snapshot for {} has no inventory entry", doc.device);
            }
            if let Some(ts) = doc.collected_at {
                let age = loaded_at - ts;
                if age > settings.stale_after {
                    tracing::warn!(
                        "Snapshot for {} is {}s old",
                        doc.device,
                        age.num_seconds()
                    );
                    stale.insert(doc.device.clone(), age.num_seconds());
                }
            }
        }

        let index = RouteIndex::build(latest.values());
        let resolver =
            NextHopResolver::build(&inventory, latest.values().flat_map(|d| d.adjacencies.iter()));
        let classifier = DomainClassifier::new(&inventory, settings.boundary_blocks.clone());

        let labels = latest
            .into_iter()
            .map(|(device, doc)| (device, doc.labels))
            .collect();

        let snapshot = Snapshot {
            generation: Uuid::new_v4(),
            loaded_at,
            inventory: Arc::new(inventory),
            index,
            labels,
            stale,
            resolver,
            classifier,
            load_warnings,
        };
        tracing::info!(
            "Built snapshot generation {}: {} devices, {} routes, {} stale",
            snapshot.generation,
            snapshot.index.devices().len(),
            snapshot.index.route_count(),
            snapshot.stale.len()
        );
        snapshot
    }

    /// Load from a source and build, stamping the generation with the current time.
    pub fn load(source: &dyn SnapshotSource, settings: &SnapshotSettings) -> TracerResult<Self> {
        tracing::info!("Loading snapshot from {}", source.describe());
        let data = source.load()?;
        if data.devices.is_empty() && !data.warnings.is_empty() {
            return Err(TracerError::Snapshot(format!(
                "no readable device documents ({} failed)",
                data.warnings.len()
            )));
        }
        let mut snapshot = Snapshot::build(data.inventory, data.devices, settings, Utc::now());
        snapshot.load_warnings.extend(data.warnings);
        Ok(snapshot)
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    pub fn index(&self) -> &RouteIndex {
        &self.index
    }

    pub fn resolver(&self) -> &NextHopResolver {
        &self.resolver
    }

    pub fn classifier(&self) -> &DomainClassifier {
        &self.classifier
    }

    pub fn load_warnings(&self) -> &[String] {
        &self.load_warnings
    }

    pub fn has_data(&self, device: &str) -> bool {
        self.index.has_device(device)
    }

    /// Present in the inventory or in the collected data.
    pub fn knows_device(&self, device: &str) -> bool {
        self.inventory.contains(device) || self.index.has_device(device)
    }

    /// Age in seconds if the device's data is older than the staleness threshold.
    pub fn stale_age(&self, device: &str) -> Option<i64> {
        self.stale.get(device).copied()
    }

    pub fn stale_devices(&self) -> Vec<&str> {
        self.stale.keys().map(String::as_str).collect()
    }

    /// Label operations for a prefix on a device, from the most specific FEC covering it.
    pub fn labels_for(
        &self,
        device: &str,
        prefix: &IpNet,
        next_hop: Option<IpAddr>,
    ) -> Vec<LabelOperation> {
        self.labels
            .get(device)
            .map(|bindings| label_operations(bindings, prefix, next_hop))
            .unwrap_or_default()
    }

    pub fn view<'a>(&'a self, exclusion: Option<&'a Exclusion>) -> SnapshotView<'a> {
        SnapshotView {
            snapshot: self,
            exclusion: exclusion.filter(|e| !e.is_empty()),
        }
    }

    pub fn summary(&self) -> SnapshotSummary {
        SnapshotSummary {
            generation: self.generation,
            loaded_at: self.loaded_at,
            devices: self.index.devices().len(),
            inventory_devices: self.inventory.len(),
            routes: self.index.route_count(),
            stale_devices: self.stale_devices().iter().map(|d| d.to_string()).collect(),
            ambiguous_addresses: self.resolver.ambiguous_addresses().len(),
            load_warnings: self.load_warnings.len(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotSummary {
    pub generation: Uuid,
    pub loaded_at: DateTime<Utc>,
    pub devices: usize,
    pub inventory_devices: usize,
    pub routes: usize,
    pub stale_devices: Vec<String>,
    pub ambiguous_addresses: usize,
    pub load_warnings: usize,
}

/// Entries surviving the view's filters and how many the exclusion removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewLookup {
    pub entries: Vec<RouteEntry>,
    pub excluded: usize,
}

/// Read-time filter over a snapshot. Excluded devices and links make the entries that
/// forward to them invisible; the snapshot itself is untouched.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotView<'a> {
    snapshot: &'a Snapshot,
    exclusion: Option<&'a Exclusion>,
}

impl<'a> SnapshotView<'a> {
    pub fn snapshot(&self) -> &'a Snapshot {
        self.snapshot
    }

    pub fn excludes_device(&self, device: &str) -> bool {
        self.exclusion.is_some_and(|e| e.excludes_device(device))
    }

    pub fn lookup(
        &self,
        device: &str,
        vrf: &str,
        prefix: &IpNet,
        semantics: RouteSemantics,
        tie_break: &ProtocolTieBreak,
    ) -> ViewLookup {
        let entries = self.snapshot.index.lookup_with(device, vrf, prefix, tie_break);
        self.filter_entries(device, entries, semantics)
    }

    /// Apply domain semantics and the exclusion to already ordered entries.
    pub fn filter_entries(
        &self,
        device: &str,
        entries: Vec<RouteEntry>,
        semantics: RouteSemantics,
    ) -> ViewLookup {
        let entries: Vec<RouteEntry> = entries
            .into_iter()
            .filter(|e| semantics == RouteSemantics::Dynamic || e.protocol.is_static_table())
            .collect();

        let Some(exclusion) = self.exclusion else {
            return ViewLookup {
                entries,
                excluded: 0,
            };
        };
        let before = entries.len();
        let entries: Vec<RouteEntry> = entries
            .into_iter()
            .filter(|e| !self.forwards_into(exclusion, device, e))
            .collect();
        ViewLookup {
            excluded: before - entries.len(),
            entries,
        }
    }

    fn forwards_into(&self, exclusion: &Exclusion, device: &str, entry: &RouteEntry) -> bool {
        let Some(next_hop) = entry.next_hop else {
            return false;
        };
        match self.snapshot.resolver.resolve(next_hop) {
            Resolution::Owner(next) => {
                exclusion.excludes_device(&next) || exclusion.excludes_link(device, &next)
            }
            Resolution::Ambiguous(owners) => owners.iter().all(|o| exclusion.excludes_device(o)),
            Resolution::Unknown => false,
        }
    }
}

/// Holds the current generation; readers never see a partially built one.
pub struct SnapshotStore {
    current: ArcSwap<Snapshot>,
    settings: SnapshotSettings,
}

impl SnapshotStore {
    pub fn new(initial: Snapshot, settings: SnapshotSettings) -> Self {
        SnapshotStore {
            current: ArcSwap::new(Arc::new(initial)),
            settings,
        }
    }

    pub fn current(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn settings(&self) -> &SnapshotSettings {
        &self.settings
    }

    /// Install a new generation, returning the one it replaced.
    pub fn swap(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let next = Arc::new(snapshot);
        let previous = self.current.swap(next.clone());
        tracing::info!(
            "Snapshot generation {} replaced by {}",
            previous.generation(),
            next.generation()
        );
        previous
    }

    /// Rebuild from `source`. On failure the current generation stays in place.
    pub fn reload(&self, source: &dyn SnapshotSource) -> TracerResult<Arc<Snapshot>> {
        let snapshot = Snapshot::load(source, &self.settings)?;
        self.swap(snapshot);
        Ok(self.current())
    }

    /// Periodically reload in the background. Building runs on the blocking pool so
    /// in-flight traces and the runtime are never held up.
    pub fn start_reload_task(
        self: Arc<Self>,
        source: Arc<dyn SnapshotSource>,
        period: Duration,
    ) -> task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reload_interval = interval(period);
            // First tick completes immediately; the initial generation is already loaded
            reload_interval.tick().await;

            loop {
                reload_interval.tick().await;

                let store = self.clone();
                let source = source.clone();
                match task::spawn_blocking(move || store.reload(source.as_ref())).await {
                    Ok(Ok(snapshot)) => {
                        tracing::debug!("Reloaded snapshot generation {}", snapshot.generation())
                    }
                    Ok(Err(e)) => tracing::warn!(
                        "Snapshot reload failed, keeping generation {}: {}",
                        self.current().generation(),
                        e
                    ),
                    Err(e) => tracing::error!("Snapshot reload task failed: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::{LabelAction, Protocol};
    use crate::testutil::{Fixture, MemorySource, loaded_at, net, route};

    #[test]
    fn test_duplicate_documents_keep_latest() {
        let mut old = DeviceSnapshot::new("pe-1");
        old.collected_at = Some(loaded_at() - chrono::Duration::minutes(30));
        old.add_route("default", route("10.0.0.0/8", Some("192.0.2.1"), Protocol::Static));
        let mut new = DeviceSnapshot::new("pe-1");
        new.collected_at = Some(loaded_at() - chrono::Duration::minutes(5));
        new.add_route("default", route("10.0.0.0/8", Some("192.0.2.9"), Protocol::Static));

        let snapshot = Snapshot::build(
            Inventory::default(),
            vec![new, old],
            &SnapshotSettings::default(),
            loaded_at(),
        );
        let hits = snapshot.index().lookup("pe-1", "default", &net("10.1.0.0/16"));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].next_hop, Some("192.0.2.9".parse().unwrap()));
    }

    #[test]
    fn test_staleness_is_flagged_at_load() {
        let snapshot = Fixture::new()
            .route("pe-1", "10.0.0.0/8", None, Protocol::Connected)
            .route("pe-2", "10.0.0.0/8", None, Protocol::Connected)
            .collected_at("pe-1", loaded_at() - chrono::Duration::hours(2))
            .collected_at("pe-2", loaded_at() - chrono::Duration::minutes(10))
            .snapshot();

        assert_eq!(snapshot.stale_devices(), vec!["pe-1"]);
        assert_eq!(snapshot.stale_age("pe-1"), Some(7200));
        assert_eq!(snapshot.stale_age("pe-2"), None);
    }

    #[test]
    fn test_labels_for_most_specific_fec() {
        let mut doc = DeviceSnapshot::new("agg-1");
        for (fec, label, next_hop) in [
            ("8.8.0.0/16", 100, None),
            ("8.8.8.0/24", 200, None),
            ("8.8.8.0/24", 300, Some("10.0.0.9")),
        ] {
            doc.labels.push(LabelBinding {
                fec: net(fec),
                next_hop: next_hop.map(|a: &str| a.parse().unwrap()),
                operation: LabelOperation {
                    action: LabelAction::Swap,
                    label,
                    lsp: None,
                },
            });
        }
        let snapshot = Snapshot::build(
            Inventory::default(),
            vec![doc],
            &SnapshotSettings::default(),
            loaded_at(),
        );

        let ops = snapshot.labels_for("agg-1", &net("8.8.8.0/24"), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].label, 200);
        let ops = snapshot.labels_for("agg-1", &net("8.8.4.0/24"), None);
        assert_eq!(ops[0].label, 100);
        assert!(snapshot.labels_for("agg-1", &net("9.9.9.0/24"), None).is_empty());
        assert!(snapshot.labels_for("agg-9", &net("8.8.8.0/24"), None).is_empty());
    }

    #[test]
    fn test_view_applies_exclusion_without_mutating() {
        let snapshot = Fixture::new()
            .device("a", None, "10.0.0.1")
            .device("b", None, "10.0.0.2")
            .device("c", None, "10.0.0.3")
            .route("a", "8.8.8.0/24", Some("10.0.0.2"), Protocol::Ebgp)
            .route("a", "8.8.8.0/24", Some("10.0.0.3"), Protocol::Ebgp)
            .snapshot();
        let prefix = net("8.8.8.0/24");
        let tie = ProtocolTieBreak::default();
        let exclusion = Exclusion::default().with_device("b");

        let filtered = snapshot
            .view(Some(&exclusion))
            .lookup("a", "default", &prefix, RouteSemantics::Dynamic, &tie);
        assert_eq!(filtered.entries.len(), 1);
        assert_eq!(filtered.excluded, 1);

        let unfiltered = snapshot
            .view(None)
            .lookup("a", "default", &prefix, RouteSemantics::Dynamic, &tie);
        assert_eq!(unfiltered.entries.len(), 2);

        let link = Exclusion::default().with_link("c", "a");
        let filtered = snapshot
            .view(Some(&link))
            .lookup("a", "default", &prefix, RouteSemantics::Dynamic, &tie);
        assert_eq!(filtered.entries[0].next_hop, Some("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_static_semantics_hide_dynamic_entries() {
        let snapshot = Fixture::new()
            .route("fw-1", "8.8.8.0/24", Some("10.0.0.2"), Protocol::Ebgp)
            .route("fw-1", "8.8.8.0/24", Some("10.0.0.3"), Protocol::Static)
            .snapshot();
        let hits = snapshot.view(None).lookup(
            "fw-1",
            "default",
            &net("8.8.8.0/24"),
            RouteSemantics::Static,
            &ProtocolTieBreak::default(),
        );
        assert_eq!(hits.entries.len(), 1);
        assert_eq!(hits.entries[0].protocol, Protocol::Static);
    }

    #[test]
    fn test_store_reload_swaps_generation() {
        let source = MemorySource::new(Fixture::new().route("pe-1", "10.0.0.0/8", None, Protocol::Connected));
        let store = SnapshotStore::new(
            Snapshot::load(&source, &SnapshotSettings::default()).unwrap(),
            SnapshotSettings::default(),
        );
        let before = store.current();

        let after = store.reload(&source).unwrap();
        assert_ne!(before.generation(), after.generation());
        assert_eq!(store.current().generation(), after.generation());
        // The old generation is still usable by whoever holds it
        assert_eq!(before.index().route_count(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_current_generation() {
        let source = MemorySource::new(Fixture::new().route("pe-1", "10.0.0.0/8", None, Protocol::Connected));
        let store = SnapshotStore::new(
            Snapshot::load(&source, &SnapshotSettings::default()).unwrap(),
            SnapshotSettings::default(),
        );
        let before = store.current().generation();

        source.fail_next_load();
        assert!(store.reload(&source).is_err());
        assert_eq!(store.current().generation(), before);
    }

    #[tokio::test]
    async fn test_reload_task_installs_new_generations() {
        let source = Arc::new(MemorySource::new(
            Fixture::new().route("pe-1", "10.0.0.0/8", None, Protocol::Connected),
        ));
        let store = Arc::new(SnapshotStore::new(
            Snapshot::load(source.as_ref(), &SnapshotSettings::default()).unwrap(),
            SnapshotSettings::default(),
        ));
        let first = store.current().generation();

        let handle = store
            .clone()
            .start_reload_task(source.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.abort();

        assert_ne!(store.current().generation(), first);
        assert!(source.load_count() >= 2);
    }

    #[test]
    fn test_directory_source() {
        let dir = std::env::temp_dir().join(format!("path-tracer-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let inventory = dir.join("inventory.toml");
        std::fs::write(&inventory, "[devices.rr1]\nloopbacks = [\"192.168.255.1\"]\n").unwrap();
        std::fs::write(
            dir.join("rr1.json"),
            r#"{"routes": [{"prefix": "8.8.8.0/24", "protocol": "static", "next_hop": "12.122.83.238"}]}"#,
        )
        .unwrap();
        std::fs::write(dir.join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let data = DirectorySource::new(&inventory, &dir).load().unwrap();
        assert_eq!(data.inventory.len(), 1);
        assert_eq!(data.devices.len(), 1);
        assert_eq!(data.devices[0].device, "rr1");
        assert_eq!(data.warnings.len(), 1);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
