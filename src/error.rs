// Error types for the path tracer
//
// Only invalid requests and unreadable input data are errors. Dead ends found while
// walking (no route, loops, depth, ambiguous owners, stale data) are part of the
// trace result.

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum TracerError {
    #[error("Malformed prefix: {0}")]
    MalformedPrefix(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown VRF {vrf} on device {device}")]
    UnknownVrf { device: String, vrf: String },

    #[error("Baseline was traced against snapshot generation {baseline}, current generation is {current}")]
    GenerationMismatch {
        baseline: uuid::Uuid,
        current: uuid::Uuid,
    },

    #[error("Inventory error: {0}")]
    Inventory(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias using TracerError
pub type TracerResult<T> = Result<T, TracerError>;

impl TracerError {
    /// Convert error to operator-facing message
    pub fn user_message(&self) -> String {
        match self {
            TracerError::MalformedPrefix(raw) => {
                format!("'{}' is not a valid prefix. Use CIDR notation such as 10.0.0.0/8 or a host address.", raw)
            }
            TracerError::UnknownDevice(device) => {
                format!("Device '{}' is neither in the inventory nor in the loaded snapshot.", device)
            }
            TracerError::UnknownVrf { device, vrf } => {
                format!("VRF '{}' does not exist on '{}'. Check the device's collected tables.", vrf, device)
            }
            TracerError::GenerationMismatch { .. } => {
                "The snapshot was reloaded since the baseline trace. Re-run the baseline first.".to_string()
            }
            TracerError::Inventory(_) => {
                "Inventory could not be loaded. Check the inventory file.".to_string()
            }
            TracerError::Snapshot(_) => {
                "Snapshot data could not be loaded. Check the snapshot directory.".to_string()
            }
            TracerError::Io(_) => {
                "File system error. Check paths and permissions.".to_string()
            }
            TracerError::Json(_) | TracerError::Toml(_) => {
                "Data format error. Check the snapshot and inventory files.".to_string()
            }
        }
    }

    /// Errors caused by the request itself, rejected before any walking happens
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            TracerError::MalformedPrefix(_)
                | TracerError::UnknownDevice(_)
                | TracerError::UnknownVrf { .. }
                | TracerError::GenerationMismatch { .. }
        )
    }
}

/// Failure reported by a live-collection fallback
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    #[error("device {0} unreachable")]
    Unreachable(String),

    #[error("collection failed: {0}")]
    Failed(String),
}
