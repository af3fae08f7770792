// Path model: hops, paths, forks and trace results

use crate::decoder::Labels;
use crate::domain::{DomainSource, RouteSemantics};
use crate::routes::{LabelOperation, Protocol, RouteEntry};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationReason {
    OriginReached,
    NoRoute,
    CycleDetected,
    DepthExceeded,
    ExcludedNode,
    /// The next-hop address is claimed by more than one device
    AmbiguousNextHop,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::OriginReached => "origin-reached",
            TerminationReason::NoRoute => "no-route",
            TerminationReason::CycleDetected => "cycle-detected",
            TerminationReason::DepthExceeded => "depth-exceeded",
            TerminationReason::ExcludedNode => "excluded-node",
            TerminationReason::AmbiguousNextHop => "ambiguous-next-hop",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Data-integrity and freshness conditions attached to hops and results.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TraceWarning {
    StaleSnapshot { device: String, age_secs: i64 },
    AmbiguousNextHop { address: IpAddr, owners: Vec<String> },
    MalformedCommunity { device: String, community: String },
    EcmpTruncated { device: String, available: usize, kept: usize },
    MissingDeviceData { device: String },
    CollectionFailed { device: String, reason: String },
    /// Boundary device placed from its address rather than the inventory
    InferredBoundary { device: String, domain: String },
}

/// One forwarding step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    pub device: String,
    pub role: Option<String>,
    pub domain: Option<String>,
    pub domain_source: Option<DomainSource>,
    pub vrf: String,
    /// Entry that produced this step; None when the path ended before one was chosen
    pub route: Option<RouteEntry>,
    pub semantics: RouteSemantics,
    /// Device the chosen entry forwards to
    pub next_device: Option<String>,
    #[serde(default)]
    pub labels: Vec<LabelOperation>,
    #[serde(default)]
    pub communities: Labels,
    /// Device identified from addressing only, never queried
    #[serde(default)]
    pub inferred: bool,
    /// Domains this device joins, for firewalls between domains
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bridges: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<TraceWarning>,
}

impl Hop {
    pub fn new(device: impl Into<String>, vrf: impl Into<String>) -> Self {
        Hop {
            device: device.into(),
            role: None,
            domain: None,
            domain_source: None,
            vrf: vrf.into(),
            route: None,
            semantics: RouteSemantics::default(),
            next_device: None,
            labels: Vec::new(),
            communities: Labels::new(),
            inferred: false,
            bridges: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn next_hop(&self) -> Option<IpAddr> {
        self.route.as_ref().and_then(|r| r.next_hop)
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.route.as_ref().map(|r| r.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCrossing {
    /// Device that traffic enters the new domain at
    pub device: String,
    pub from_domain: String,
    pub to_domain: String,
    /// Protocol of the route that forwarded traffic across
    pub protocol: Option<Protocol>,
    pub inferred: bool,
}

/// Crossings between adjacent hops whose domains are both known and differ.
pub fn derive_crossings(hops: &[Hop]) -> Vec<DomainCrossing> {
    hops.windows(2)
        .filter_map(|pair| {
            let (prev, next) = (&pair[0], &pair[1]);
            let from = prev.domain.as_ref()?;
            let to = next.domain.as_ref()?;
            if from == to {
                return None;
            }
            Some(DomainCrossing {
                device: next.device.clone(),
                from_domain: from.clone(),
                to_domain: to.clone(),
                protocol: prev.protocol(),
                inferred: next.domain_source == Some(DomainSource::Inferred),
            })
        })
        .collect()
}

/// A fork point: several equal-cost entries at one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub device: String,
    pub vrf: String,
    /// Hop index of the fork inside each sibling path
    pub depth: usize,
    pub candidates: usize,
    pub selected: Vec<RouteEntry>,
    pub truncated: bool,
}

/// Which sibling of which fork a path took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkChoice {
    pub branch: usize,
    pub choice: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    hops: Vec<Hop>,
    termination: TerminationReason,
    crossings: Vec<DomainCrossing>,
    forks: Vec<ForkChoice>,
    /// Device the last hop forwarded back to when the path ended in a loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loops_to: Option<String>,
}

impl Path {
    pub fn new(hops: Vec<Hop>, termination: TerminationReason, forks: Vec<ForkChoice>) -> Self {
        let crossings = derive_crossings(&hops);
        Path {
            hops,
            termination,
            crossings,
            forks,
            loops_to: None,
        }
    }

    pub fn looping_to(mut self, device: impl Into<String>) -> Self {
        self.loops_to = Some(device.into());
        self
    }

    pub fn loops_to(&self) -> Option<&str> {
        self.loops_to.as_deref()
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn termination(&self) -> TerminationReason {
        self.termination
    }

    pub fn crossings(&self) -> &[DomainCrossing] {
        &self.crossings
    }

    pub fn forks(&self) -> &[ForkChoice] {
        &self.forks
    }

    pub fn devices(&self) -> Vec<&str> {
        self.hops.iter().map(|h| h.device.as_str()).collect()
    }

    /// `(device, vrf, prefix)` per hop
    pub fn triples(&self, prefix: IpNet) -> Vec<(&str, &str, IpNet)> {
        self.hops
            .iter()
            .map(|h| (h.device.as_str(), h.vrf.as_str(), prefix))
            .collect()
    }

    pub fn last_hop(&self) -> Option<&Hop> {
        self.hops.last()
    }

    pub fn reached_origin(&self) -> bool {
        self.termination == TerminationReason::OriginReached
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    pub prefix: IpNet,
    pub start: String,
    pub vrf: Option<String>,
}

impl TraceRequest {
    pub fn new(prefix: IpNet, start: impl Into<String>) -> Self {
        TraceRequest {
            prefix,
            start: start.into(),
            vrf: None,
        }
    }

    pub fn in_vrf(mut self, vrf: impl Into<String>) -> Self {
        self.vrf = Some(vrf.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResult {
    pub request: TraceRequest,
    /// Snapshot generation the trace ran against
    pub generation: Uuid,
    pub paths: Vec<Path>,
    pub branches: Vec<Branch>,
    /// Some fork had more equal-cost entries than the fan-out cap
    pub truncated: bool,
    /// Conditions that apply to the whole trace, deduplicated
    pub warnings: Vec<TraceWarning>,
}

impl TraceResult {
    /// Best path by lookup ordering
    pub fn primary(&self) -> Option<&Path> {
        self.paths.first()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
