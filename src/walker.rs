// Path walker: hop-by-hop next-hop resolution over one snapshot generation
//
// The walk is a depth-first search driven by an explicit task stack. Each visit looks the
// destination prefix up on the current device, keeps the best equal-cost tier, and either
// forks (one sibling per entry) or follows the single entry. Sibling order is the lookup
// order, so the same snapshot and request always give the same paths in the same order.

use crate::decoder::DecoderRegistry;
use crate::domain::DomainSource;
use crate::error::{CollectError, TracerError, TracerResult};
use crate::path::{
    Branch, ForkChoice, Hop, Path, TerminationReason, TraceRequest, TraceResult, TraceWarning,
};
use crate::resolver::Resolution;
use crate::routes::lookup::{ProtocolTieBreak, RouteIndex, equal_cost_tier};
use crate::routes::{
    Adjacency, DEFAULT_VRF, DeviceSnapshot, LabelBinding, Protocol, RouteEntry, label_operations,
    parse_prefix,
};
use crate::simulate::Exclusion;
use crate::snapshot::{Snapshot, SnapshotView, ViewLookup};
use ipnet::IpNet;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkSettings {
    /// Hops per path before the walk gives up
    pub max_depth: usize,
    /// Siblings per fork; extra equal-cost entries are dropped in lookup order
    pub max_ecmp_branches: usize,
    pub tie_break: ProtocolTieBreak,
    /// Follow only active entries when a device has any. Off by default: an inactive entry
    /// with a better local-preference or metric forms the tier on its own.
    pub prefer_active: bool,
}

impl Default for WalkSettings {
    fn default() -> Self {
        WalkSettings {
            max_depth: 30,
            max_ecmp_branches: 8,
            tie_break: ProtocolTieBreak::default(),
            prefer_active: false,
        }
    }
}

/// Fetches routing state straight from a device that the snapshot has no data for.
pub trait LiveCollector: Send + Sync {
    fn collect(&self, device: &str) -> Result<DeviceSnapshot, CollectError>;
}

/// How the best path for a prefix ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginClassification {
    pub prefix: IpNet,
    pub start: String,
    pub origin_device: Option<String>,
    /// `connected`, `static`, `ebgp`... of the route at the origin
    pub origin_type: Option<Protocol>,
    pub route: Option<RouteEntry>,
    pub termination: Option<TerminationReason>,
    pub path_count: usize,
    pub generation: Uuid,
}

/// Entry point for every read-only operation over one snapshot generation.
#[derive(Clone)]
pub struct PathEngine {
    snapshot: Arc<Snapshot>,
    decoders: Arc<DecoderRegistry>,
    settings: WalkSettings,
    collector: Option<Arc<dyn LiveCollector>>,
}

impl PathEngine {
    pub fn new(snapshot: Arc<Snapshot>, decoders: Arc<DecoderRegistry>, settings: WalkSettings) -> Self {
        PathEngine {
            snapshot,
            decoders,
            settings,
            collector: None,
        }
    }

    pub fn with_collector(mut self, collector: Arc<dyn LiveCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    pub fn settings(&self) -> &WalkSettings {
        &self.settings
    }

    /// Trace `prefix` from `start`. `vrf` defaults to the global table.
    pub fn trace(&self, prefix: &str, start: &str, vrf: Option<&str>) -> TracerResult<TraceResult> {
        let prefix = parse_prefix(prefix).ok_or_else(|| TracerError::MalformedPrefix(prefix.to_string()))?;
        let request = match vrf {
            Some(vrf) => TraceRequest::new(prefix, start).in_vrf(vrf),
            None => TraceRequest::new(prefix, start),
        };
        self.trace_request(&request)
    }

    pub fn trace_request(&self, request: &TraceRequest) -> TracerResult<TraceResult> {
        self.run(request, None)
    }

    /// Independent requests traced in parallel; results come back in request order.
    pub fn trace_batch(&self, requests: &[TraceRequest]) -> Vec<TracerResult<TraceResult>> {
        requests.par_iter().map(|r| self.trace_request(r)).collect()
    }

    pub fn origin(&self, prefix: &str, start: &str, vrf: Option<&str>) -> TracerResult<OriginClassification> {
        let result = self.trace(prefix, start, vrf)?;
        let chosen = result
            .paths
            .iter()
            .find(|p| p.reached_origin())
            .or_else(|| result.primary());

        let routed = chosen.and_then(|p| p.hops().iter().rev().find(|h| h.route.is_some()));
        let origin_type = routed.and_then(|hop| {
            let route = hop.route.as_ref()?;
            let reached = chosen.is_some_and(|p| p.reached_origin());
            let off_network = reached && route.next_hop.is_some() && hop.next_device.is_none();
            match route.protocol {
                Protocol::Ibgp | Protocol::Ebgp if off_network => Some(Protocol::Ebgp),
                other => Some(other),
            }
        });

        Ok(OriginClassification {
            prefix: result.request.prefix,
            start: result.request.start.clone(),
            origin_device: chosen.and_then(|p| p.last_hop()).map(|h| h.device.clone()),
            origin_type,
            route: routed.and_then(|h| h.route.clone()),
            termination: chosen.map(|p| p.termination()),
            path_count: result.paths.len(),
            generation: result.generation,
        })
    }

    /// Run one walk, optionally against an exclusion view.
    pub(crate) fn run(&self, request: &TraceRequest, exclusion: Option<&Exclusion>) -> TracerResult<TraceResult> {
        let vrf = self.validate(request)?;
        let prefix = request.prefix.trunc();
        tracing::debug!(
            "Tracing {} from {} in {} (generation {})",
            prefix,
            request.start,
            vrf,
            self.snapshot.generation()
        );

        let mut walk = Walk {
            engine: self,
            view: self.snapshot.view(exclusion),
            prefix,
            collected: HashMap::new(),
            paths: Vec::new(),
            branches: Vec::new(),
            truncated: false,
            warnings: Vec::new(),
        };
        walk.run(Pending {
            hops: Vec::new(),
            visited: HashSet::new(),
            forks: Vec::new(),
            device: request.start.clone(),
            vrf,
            referred_via: None,
        });

        tracing::debug!("Trace of {} from {} produced {} paths", prefix, request.start, walk.paths.len());
        Ok(TraceResult {
            request: request.clone(),
            generation: self.snapshot.generation(),
            paths: walk.paths,
            branches: walk.branches,
            truncated: walk.truncated,
            warnings: walk.warnings,
        })
    }

    fn validate(&self, request: &TraceRequest) -> TracerResult<String> {
        let start = request.start.as_str();
        if !self.snapshot.knows_device(start) {
            return Err(TracerError::UnknownDevice(start.to_string()));
        }

        let vrf = request.vrf.clone().unwrap_or_else(|| DEFAULT_VRF.to_string());
        let declared = self
            .snapshot
            .inventory()
            .device(start)
            .is_some_and(|d| d.vrfs.contains(&vrf));
        if request.vrf.is_some()
            && self.snapshot.has_data(start)
            && !self.snapshot.index().has_vrf(start, &vrf)
            && !declared
        {
            return Err(TracerError::UnknownVrf {
                device: start.to_string(),
                vrf,
            });
        }
        Ok(vrf)
    }
}

impl std::fmt::Debug for PathEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathEngine")
            .field("generation", &self.snapshot.generation())
            .field("decoders", &self.decoders)
            .field("settings", &self.settings)
            .field("collector", &self.collector.is_some())
            .finish()
    }
}

/// State of one in-flight path.
#[derive(Debug, Clone)]
struct Pending {
    hops: Vec<Hop>,
    /// `(device, vrf)`; the prefix is fixed for the whole walk
    visited: HashSet<(String, String)>,
    forks: Vec<ForkChoice>,
    device: String,
    vrf: String,
    /// Next-hop address that led here
    referred_via: Option<IpAddr>,
}

/// Routing state fetched live for a device the snapshot lacks.
struct Collected {
    index: RouteIndex,
    labels: Vec<LabelBinding>,
    adjacencies: Vec<Adjacency>,
}

enum Task {
    Visit(Pending),
    Follow { pending: Pending, hop: Hop, entry: RouteEntry },
}

struct Walk<'a> {
    engine: &'a PathEngine,
    view: SnapshotView<'a>,
    prefix: IpNet,
    /// Live-collection results, fetched at most once per device per trace
    collected: HashMap<String, Option<Arc<Collected>>>,
    paths: Vec<Path>,
    branches: Vec<Branch>,
    truncated: bool,
    warnings: Vec<TraceWarning>,
}

impl<'a> Walk<'a> {
    fn run(&mut self, start: Pending) {
        let mut stack = vec![Task::Visit(start)];
        while let Some(task) = stack.pop() {
            match task {
                Task::Visit(pending) => self.visit(pending, &mut stack),
                Task::Follow {
                    pending,
                    hop,
                    entry,
                } => self.follow(pending, hop, entry, &mut stack),
            }
        }
    }

    fn snapshot(&self) -> &'a Snapshot {
        self.view.snapshot()
    }

    fn visit(&mut self, mut pending: Pending, stack: &mut Vec<Task>) {
        let engine = self.engine;
        let settings = &engine.settings;
        if pending.hops.len() >= settings.max_depth {
            tracing::debug!("Depth limit reached at {}", pending.device);
            return self.cut(pending, TerminationReason::DepthExceeded);
        }
        let key = (pending.device.clone(), pending.vrf.clone());
        if pending.visited.contains(&key) {
            tracing::debug!("Cycle at {} ({})", pending.device, pending.vrf);
            return self.cut(pending, TerminationReason::CycleDetected);
        }

        let mut hop = self.hop_skeleton(&pending);
        if self.view.excludes_device(&hop.device) {
            pending.hops.push(hop);
            return self.finish(pending.hops, pending.forks, TerminationReason::ExcludedNode);
        }

        let lookup = self.lookup(&mut hop, &pending.vrf);
        if lookup.entries.is_empty() {
            let reason = if lookup.excluded > 0 {
                TerminationReason::ExcludedNode
            } else {
                TerminationReason::NoRoute
            };
            pending.hops.push(hop);
            return self.finish(pending.hops, pending.forks, reason);
        }

        let mut entries = lookup.entries;
        if settings.prefer_active && entries.iter().any(|e| e.active) {
            entries.retain(|e| e.active);
        }
        let mut tier = equal_cost_tier(&entries, &settings.tie_break);
        let candidates = tier.len();
        let truncated = candidates > settings.max_ecmp_branches;
        if truncated {
            tier.truncate(settings.max_ecmp_branches.max(1));
            self.truncated = true;
            let warning = TraceWarning::EcmpTruncated {
                device: hop.device.clone(),
                available: candidates,
                kept: tier.len(),
            };
            tracing::warn!(
                "{} has {} equal-cost entries for {}, keeping {}",
                hop.device,
                candidates,
                self.prefix,
                tier.len()
            );
            hop.warnings.push(warning.clone());
            self.warn(warning);
        }

        let branch = if tier.len() > 1 {
            tracing::debug!("Forking {} ways at {}", tier.len(), hop.device);
            self.branches.push(Branch {
                device: hop.device.clone(),
                vrf: pending.vrf.clone(),
                depth: pending.hops.len(),
                candidates,
                selected: tier.clone(),
                truncated,
            });
            Some(self.branches.len() - 1)
        } else {
            None
        };

        pending.visited.insert(key);
        for (choice, entry) in tier.into_iter().enumerate().rev() {
            let mut sibling = pending.clone();
            if let Some(branch) = branch {
                sibling.forks.push(ForkChoice { branch, choice });
            }
            stack.push(Task::Follow {
                pending: sibling,
                hop: hop.clone(),
                entry,
            });
        }
    }

    /// Complete a hop with the chosen entry and decide where the path goes next.
    fn follow(&mut self, mut pending: Pending, mut hop: Hop, entry: RouteEntry, stack: &mut Vec<Task>) {
        let decoded = self.engine.decoders.decode(&entry.communities, entry.local_pref);
        hop.communities = decoded.labels;
        for community in decoded.malformed {
            let warning = TraceWarning::MalformedCommunity {
                device: hop.device.clone(),
                community,
            };
            hop.warnings.push(warning.clone());
            self.warn(warning);
        }
        let collected = self.collected.get(&hop.device).cloned().flatten();
        hop.labels = match &collected {
            Some(collected) => label_operations(&collected.labels, &self.prefix, entry.next_hop),
            None => self.snapshot().labels_for(&hop.device, &self.prefix, entry.next_hop),
        };

        let next_vrf = entry.next_vrf.clone().unwrap_or_else(|| pending.vrf.clone());
        let next_hop = entry.next_hop;
        hop.route = Some(entry);

        let Some(address) = next_hop else {
            pending.hops.push(hop);
            return self.finish(pending.hops, pending.forks, TerminationReason::OriginReached);
        };

        let adjacencies = collected.iter().flat_map(|c| c.adjacencies.iter());
        match self.snapshot().resolver().resolve_with(address, adjacencies) {
            Resolution::Owner(owner) if owner == hop.device => {
                pending.hops.push(hop);
                self.finish(pending.hops, pending.forks, TerminationReason::OriginReached)
            }
            Resolution::Owner(owner) => {
                tracing::debug!("{} -> {} via {}", hop.device, owner, address);
                hop.next_device = Some(owner.clone());
                pending.hops.push(hop);
                pending.device = owner;
                pending.vrf = next_vrf;
                pending.referred_via = Some(address);
                stack.push(Task::Visit(pending));
            }
            Resolution::Ambiguous(owners) => {
                tracing::warn!("Next-hop {} on {} has several owners", address, hop.device);
                let warning = TraceWarning::AmbiguousNextHop { address, owners };
                hop.warnings.push(warning.clone());
                self.warn(warning);
                pending.hops.push(hop);
                self.finish(pending.hops, pending.forks, TerminationReason::AmbiguousNextHop)
            }
            Resolution::Unknown => {
                let boundary = self.snapshot().classifier().infer_boundary(address);
                let room = pending.hops.len() + 1 < self.engine.settings.max_depth;
                match boundary {
                    Some(boundary) if !room => {
                        tracing::debug!(
                            "No room for inferred boundary {} after {}",
                            boundary.device,
                            hop.device
                        );
                        pending.hops.push(hop);
                        return self.finish(
                            pending.hops,
                            pending.forks,
                            TerminationReason::DepthExceeded,
                        );
                    }
                    Some(boundary) => {
                        hop.next_device = Some(boundary.device.clone());
                        pending.hops.push(hop);

                        let mut inferred = Hop::new(boundary.device.clone(), next_vrf);
                        inferred.role = Some(boundary.role);
                        inferred.semantics = self
                            .snapshot()
                            .classifier()
                            .semantics_of(Some(boundary.domain.as_str()));
                        inferred.domain = Some(boundary.domain.clone());
                        inferred.domain_source = Some(DomainSource::Inferred);
                        inferred.inferred = true;
                        let warning = TraceWarning::InferredBoundary {
                            device: boundary.device,
                            domain: boundary.domain,
                        };
                        inferred.warnings.push(warning.clone());
                        self.warn(warning);
                        pending.hops.push(inferred);
                    }
                    None => pending.hops.push(hop),
                }
                self.finish(pending.hops, pending.forks, TerminationReason::OriginReached)
            }
        }
    }

    fn hop_skeleton(&mut self, pending: &Pending) -> Hop {
        let snapshot = self.snapshot();
        let mut hop = Hop::new(pending.device.clone(), pending.vrf.clone());
        hop.role = snapshot
            .inventory()
            .device(&pending.device)
            .and_then(|d| d.role.clone());
        if let Some(assignment) = snapshot.classifier().classify(&pending.device, pending.referred_via) {
            hop.domain = Some(assignment.domain);
            hop.domain_source = Some(assignment.source);
        }
        hop.semantics = snapshot.classifier().semantics_of(hop.domain.as_deref());
        hop.bridges = snapshot.classifier().bridges_of(&pending.device).to_vec();

        if let Some(age_secs) = snapshot.stale_age(&pending.device) {
            let warning = TraceWarning::StaleSnapshot {
                device: pending.device.clone(),
                age_secs,
            };
            hop.warnings.push(warning.clone());
            self.warn(warning);
        }
        hop
    }

    fn lookup(&mut self, hop: &mut Hop, vrf: &str) -> ViewLookup {
        let engine = self.engine;
        let tie_break = &engine.settings.tie_break;
        if self.snapshot().has_data(&hop.device) {
            return self
                .view
                .lookup(&hop.device, vrf, &self.prefix, hop.semantics, tie_break);
        }

        let collected = self.collect(hop);
        match collected {
            Some(collected) => {
                let entries = collected.index.lookup_with(&hop.device, vrf, &self.prefix, tie_break);
                self.view.filter_entries(&hop.device, entries, hop.semantics)
            }
            None => ViewLookup::default(),
        }
    }

    /// Ask the live collector for a device the snapshot lacks; absence is not an error.
    fn collect(&mut self, hop: &mut Hop) -> Option<Arc<Collected>> {
        if let Some(cached) = self.collected.get(&hop.device) {
            return cached.clone();
        }

        let engine = self.engine;
        let result = match &engine.collector {
            None => {
                let warning = TraceWarning::MissingDeviceData {
                    device: hop.device.clone(),
                };
                hop.warnings.push(warning.clone());
                self.warn(warning);
                None
            }
            Some(collector) => match collector.collect(&hop.device).and_then(|snapshot| {
                if snapshot.device == hop.device {
                    Ok(snapshot)
                } else {
                    Err(CollectError::Failed(format!("returned data for {}", snapshot.device)))
                }
            }) {
                Ok(snapshot) => {
                    tracing::info!("Collected {} routes live from {}", snapshot.route_count(), hop.device);
                    Some(Arc::new(Collected {
                        index: RouteIndex::build([&snapshot]),
                        labels: snapshot.labels,
                        adjacencies: snapshot.adjacencies,
                    }))
                }
                Err(e) => {
                    tracing::warn!("Live collection from {} failed: {}", hop.device, e);
                    let warning = TraceWarning::CollectionFailed {
                        device: hop.device.clone(),
                        reason: e.to_string(),
                    };
                    hop.warnings.push(warning.clone());
                    self.warn(warning);
                    None
                }
            },
        };
        self.collected.insert(hop.device.clone(), result.clone());
        result
    }

    fn warn(&mut self, warning: TraceWarning) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    fn finish(&mut self, hops: Vec<Hop>, forks: Vec<ForkChoice>, reason: TerminationReason) {
        self.paths.push(Path::new(hops, reason, forks));
    }

    /// End a path without entering `pending.device`. The last hop keeps its route but no
    /// longer names a next device, since that device is not on the path.
    fn cut(&mut self, mut pending: Pending, reason: TerminationReason) {
        if let Some(last) = pending.hops.last_mut() {
            last.next_device = None;
        }
        let mut path = Path::new(pending.hops, reason, pending.forks);
        if reason == TerminationReason::CycleDetected {
            path = path.looping_to(pending.device);
        }
        self.paths.push(path);
    }
}
