// Forward/reverse asymmetry comparison

use crate::error::TracerResult;
use crate::path::{Path, TraceRequest, TraceResult};
use crate::walker::PathEngine;
use serde::Serialize;

/// First point at which a forward path and its paired reverse path disagree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Divergence {
    pub forward_path: usize,
    pub reverse_path: usize,
    /// Hop index in forward order
    pub index: usize,
    /// None when that side's sequence ended first
    pub forward_device: Option<String>,
    pub reverse_device: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsymmetryResult {
    pub symmetric: bool,
    pub divergences: Vec<Divergence>,
    pub forward_paths: usize,
    pub reverse_paths: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReverseTrace {
    pub forward: TraceResult,
    pub reverse: TraceResult,
    pub asymmetry: AsymmetryResult,
}

/// Pair forward path `i` with reverse path `i` and compare device sequences, the reverse
/// one read back to front.
pub fn compare(forward: &TraceResult, reverse: &TraceResult) -> AsymmetryResult {
    let pairs = forward.paths.len().max(reverse.paths.len());
    let divergences: Vec<Divergence> = (0..pairs)
        .filter_map(|i| diverge(i, forward.paths.get(i), reverse.paths.get(i)))
        .collect();

    AsymmetryResult {
        symmetric: divergences.is_empty(),
        divergences,
        forward_paths: forward.paths.len(),
        reverse_paths: reverse.paths.len(),
    }
}

fn diverge(i: usize, forward: Option<&Path>, reverse: Option<&Path>) -> Option<Divergence> {
    let forward: Vec<&str> = forward.map(Path::devices).unwrap_or_default();
    let mut reverse: Vec<&str> = reverse.map(Path::devices).unwrap_or_default();
    reverse.reverse();

    let longest = forward.len().max(reverse.len());
    let index = (0..longest).find(|&k| forward.get(k) != reverse.get(k))?;
    Some(Divergence {
        forward_path: i,
        reverse_path: i,
        index,
        forward_device: forward.get(index).map(|d| d.to_string()),
        reverse_device: reverse.get(index).map(|d| d.to_string()),
    })
}

impl PathEngine {
    /// Trace both directions independently, in parallel, and compare them.
    pub fn trace_reverse(&self, forward: &TraceRequest, reverse: &TraceRequest) -> TracerResult<ReverseTrace> {
        let (forward, reverse) = rayon::join(|| self.trace_request(forward), || self.trace_request(reverse));
        let (forward, reverse) = (forward?, reverse?);
        let asymmetry = compare(&forward, &reverse);
        if !asymmetry.symmetric {
            tracing::info!(
                "{} -> {} is asymmetric ({} divergences)",
                forward.request.start,
                reverse.request.start,
                asymmetry.divergences.len()
            );
        }

        Ok(ReverseTrace {
            forward,
            reverse,
            asymmetry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::Protocol;
    use crate::testutil::{Fixture, net};

    // a owns 10.10.0.0/24, c owns 10.30.0.0/24, b and d are transit
    fn topology() -> Fixture {
        Fixture::new()
            .device("a", None, "10.0.0.1")
            .device("b", None, "10.0.0.2")
            .device("c", None, "10.0.0.3")
            .device("d", None, "10.0.0.4")
            .route("a", "10.30.0.0/24", Some("10.0.0.2"), Protocol::Ebgp)
            .route("b", "10.30.0.0/24", Some("10.0.0.3"), Protocol::Ebgp)
            .route("c", "10.30.0.0/24", None, Protocol::Connected)
            .route("b", "10.10.0.0/24", Some("10.0.0.1"), Protocol::Ebgp)
            .route("d", "10.10.0.0/24", Some("10.0.0.1"), Protocol::Static)
            .route("a", "10.10.0.0/24", None, Protocol::Connected)
    }

    fn requests() -> (TraceRequest, TraceRequest) {
        (
            TraceRequest::new(net("10.30.0.0/24"), "a"),
            TraceRequest::new(net("10.10.0.0/24"), "c"),
        )
    }

    #[test]
    fn test_symmetric_paths() {
        let engine = topology()
            .route("c", "10.10.0.0/24", Some("10.0.0.2"), Protocol::Ebgp)
            .engine();
        let (forward, reverse) = requests();

        let result = engine.trace_reverse(&forward, &reverse).unwrap();
        assert_eq!(result.forward.paths[0].devices(), vec!["a", "b", "c"]);
        assert_eq!(result.reverse.paths[0].devices(), vec!["c", "b", "a"]);
        assert!(result.asymmetry.symmetric);
        assert!(result.asymmetry.divergences.is_empty());
    }

    #[test]
    fn test_asymmetric_static_route() {
        let engine = topology()
            .route("c", "10.10.0.0/24", Some("10.0.0.4"), Protocol::Static)
            .engine();
        let (forward, reverse) = requests();

        let result = engine.trace_reverse(&forward, &reverse).unwrap();
        assert!(!result.asymmetry.symmetric);
        assert_eq!(result.asymmetry.divergences.len(), 1);
        let divergence = &result.asymmetry.divergences[0];
        assert_eq!(divergence.index, 1);
        assert_eq!(divergence.forward_device.as_deref(), Some("b"));
        assert_eq!(divergence.reverse_device.as_deref(), Some("d"));
    }

    #[test]
    fn test_unpaired_path_diverges_at_start() {
        let engine = topology()
            .route("c", "10.10.0.0/24", Some("10.0.0.2"), Protocol::Ebgp)
            .route("c", "10.10.0.0/24", Some("10.0.0.4"), Protocol::Ebgp)
            .engine();
        let forward = engine.trace("10.30.0.0/24", "a", None).unwrap();
        let reverse = engine.trace("10.10.0.0/24", "c", None).unwrap();

        let asymmetry = compare(&forward, &reverse);
        assert_eq!(asymmetry.reverse_paths, 2);
        assert_eq!(asymmetry.divergences.len(), 1);
        assert_eq!(asymmetry.divergences[0].forward_path, 1);
        assert_eq!(asymmetry.divergences[0].index, 0);
        assert_eq!(asymmetry.divergences[0].forward_device, None);
    }
}
