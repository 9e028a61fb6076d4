use thiserror::Error;

use crate::docker::RuntimeError;
use crate::models::{StoreError, WorkspaceId};

/// Failures surfaced by the orchestrator's public operations.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Container runtime is unavailable")]
    RuntimeUnavailable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Failed to create volume for workspace {workspace_id}: {reason}")]
    VolumeCreationFailed { workspace_id: WorkspaceId, reason: String },

    #[error("No free port in range {start}-{end}")]
    NoFreePort { start: u16, end: u16 },

    #[error("Failed to build image {tag}: {message}")]
    ImageBuildFailed { tag: String, message: String },

    #[error("Failed to provision workspace {workspace_id}: {reason}")]
    ProvisionFailed { workspace_id: WorkspaceId, reason: String },

    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Invalid resource limits: {0}")]
    InvalidLimits(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable identifier for the API boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::RuntimeUnavailable => "runtime_unavailable",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::VolumeCreationFailed { .. } => "volume_creation_failed",
            OrchestratorError::NoFreePort { .. } => "no_free_port",
            OrchestratorError::ImageBuildFailed { .. } => "image_build_failed",
            OrchestratorError::ProvisionFailed { .. } => "provision_failed",
            OrchestratorError::CleanupFailed(_) => "cleanup_failed",
            OrchestratorError::InvalidLimits(_) => "invalid_limits",
            OrchestratorError::Runtime(_) => "runtime_error",
            OrchestratorError::Store(_) => "store_error",
        }
    }
}

impl From<RuntimeError> for OrchestratorError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(_) => OrchestratorError::RuntimeUnavailable,
            RuntimeError::NotFound(what) => OrchestratorError::NotFound(what),
            other => OrchestratorError::Runtime(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
