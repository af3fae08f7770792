// Failure simulation: re-run a baseline trace with devices or links taken out

use crate::error::{TracerError, TracerResult};
use crate::path::TraceResult;
use crate::walker::PathEngine;
use ipnet::IpNet;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Devices and links to treat as failed. Links are undirected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    devices: BTreeSet<String>,
    links: BTreeSet<(String, String)>,
}

impl Exclusion {
    pub fn of_devices<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Exclusion {
            devices: devices.into_iter().map(Into::into).collect(),
            links: BTreeSet::new(),
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.devices.insert(device.into());
        self
    }

    pub fn with_link(mut self, a: impl Into<String>, b: impl Into<String>) -> Self {
        self.links.insert(link_key(a.into(), b.into()));
        self
    }

    pub fn excludes_device(&self, device: &str) -> bool {
        self.devices.contains(device)
    }

    pub fn excludes_link(&self, a: &str, b: &str) -> bool {
        self.links
            .contains(&link_key(a.to_string(), b.to_string()))
    }

    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(String::as_str)
    }

    pub fn links(&self) -> impl Iterator<Item = (&str, &str)> {
        self.links.iter().map(|(a, b)| (a.as_str(), b.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.links.is_empty()
    }
}

fn link_key(a: String, b: String) -> (String, String) {
    if a <= b { (a, b) } else { (b, a) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpactStatus {
    /// Every path that reached an origin is gone
    Lost,
    /// Still reachable, over different devices
    Rerouted,
    Unaffected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefixImpact {
    pub prefix: IpNet,
    pub start: String,
    pub status: ImpactStatus,
    pub baseline_paths: usize,
    pub simulated_paths: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImpactSummary {
    pub lost: Vec<IpNet>,
    pub rerouted: Vec<IpNet>,
    pub unaffected: Vec<IpNet>,
}

impl ImpactSummary {
    pub fn from_impacts<'a>(impacts: impl IntoIterator<Item = &'a PrefixImpact>) -> Self {
        let mut summary = ImpactSummary::default();
        for impact in impacts {
            let bucket = match impact.status {
                ImpactStatus::Lost => &mut summary.lost,
                ImpactStatus::Rerouted => &mut summary.rerouted,
                ImpactStatus::Unaffected => &mut summary.unaffected,
            };
            bucket.push(impact.prefix);
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSimResult {
    pub exclusion: Exclusion,
    pub generation: Uuid,
    pub simulated: TraceResult,
    pub impact: PrefixImpact,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureSimBatch {
    pub results: Vec<FailureSimResult>,
    pub summary: ImpactSummary,
}

/// Classify how the simulated run differs from the baseline for the traced prefix.
pub fn assess(baseline: &TraceResult, simulated: &TraceResult) -> PrefixImpact {
    let reached = |result: &TraceResult| -> BTreeSet<Vec<String>> {
        result
            .paths
            .iter()
            .filter(|p| p.reached_origin())
            .map(|p| p.devices().iter().map(|d| d.to_string()).collect())
            .collect()
    };
    let before = reached(baseline);
    let after = reached(simulated);

    let status = if !before.is_empty() && after.is_empty() {
        ImpactStatus::Lost
    } else if before == after {
        ImpactStatus::Unaffected
    } else {
        ImpactStatus::Rerouted
    };

    PrefixImpact {
        prefix: baseline.request.prefix,
        start: baseline.request.start.clone(),
        status,
        baseline_paths: baseline.paths.len(),
        simulated_paths: simulated.paths.len(),
    }
}

impl PathEngine {
    /// Re-run `baseline`'s request with `exclusion` applied as a read-time filter.
    pub fn simulate_failure(&self, baseline: &TraceResult, exclusion: &Exclusion) -> TracerResult<FailureSimResult> {
        let current = self.snapshot().generation();
        if baseline.generation != current {
            return Err(TracerError::GenerationMismatch {
                baseline: baseline.generation,
                current,
            });
        }
        let named = exclusion
            .devices()
            .chain(exclusion.links().flat_map(|(a, b)| [a, b]));
        for device in named {
            if !self.snapshot().knows_device(device) {
                return Err(TracerError::UnknownDevice(device.to_string()));
            }
        }

        let simulated = self.run(&baseline.request, Some(exclusion))?;
        let impact = assess(baseline, &simulated);
        tracing::info!(
            "Simulated failure of {} devices for {}: {:?}",
            exclusion.devices().count(),
            impact.prefix,
            impact.status
        );

        Ok(FailureSimResult {
            exclusion: exclusion.clone(),
            generation: current,
            simulated,
            impact,
        })
    }

    /// Simulate the same exclusion against several baselines in parallel.
    pub fn simulate_failure_batch(
        &self,
        baselines: &[TraceResult],
        exclusion: &Exclusion,
    ) -> TracerResult<FailureSimBatch> {
        let results = baselines
            .par_iter()
            .map(|b| self.simulate_failure(b, exclusion))
            .collect::<TracerResult<Vec<_>>>()?;
        let summary = ImpactSummary::from_impacts(results.iter().map(|r| &r.impact));
        Ok(FailureSimBatch { results, summary })
    }
}
