// Multi-domain forwarding path reconstruction over collected routing state

pub mod compare;
pub mod config;
pub mod decoder;
pub mod domain;
pub mod error;
pub mod inventory;
pub mod path;
pub mod resolver;
pub mod routes;
pub mod simulate;
pub mod snapshot;
pub mod walker;

#[cfg(test)]
mod testutil;

pub use compare::{AsymmetryResult, Divergence, ReverseTrace, compare};
pub use decoder::{CommunityDecoder, DecoderRegistry, SiteCommunityDecoder};
pub use error::{TracerError, TracerResult};
pub use path::{Hop, Path, TerminationReason, TraceRequest, TraceResult, TraceWarning};
pub use simulate::{Exclusion, FailureSimResult, ImpactStatus};
pub use snapshot::{DirectorySource, Snapshot, SnapshotSource, SnapshotStore};
pub use walker::{LiveCollector, OriginClassification, PathEngine, WalkSettings};
