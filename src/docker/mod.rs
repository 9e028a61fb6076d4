mod archive;
mod cleanup;
mod client;
mod connector;
mod container;
mod image;
mod lifecycle;
mod ports;
mod runtime;
mod stats;
mod volume;

#[cfg(test)]
pub mod fake;

pub use archive::{package_directory, FileInjector, PROJECT_DIR};
pub use cleanup::CleanupCoordinator;
pub use client::DockerClient;
pub use connector::{DockerFactory, RuntimeConnector, RuntimeFactory, Transport};
pub use container::{ContainerTemplate, SERVICE_PORT};
pub use image::{BuildSpec, ImageResolver, ResolvedImage, DEFAULT_BASE_IMAGE};
pub use lifecycle::{
    Orchestrator, OrchestratorSettings, Outcome, Transition, WorkspaceState, DEFAULT_LOG_TAIL,
};
pub use ports::{PortAllocator, PortPolicy};
pub use runtime::{
    Bind, BuildOutput, ContainerDetails, ContainerListing, ContainerRuntime, ContainerSpec,
    HealthCheck, RuntimeError, RuntimeState, StatsSample, VolumeInfo,
};
pub use stats::StatusReport;
pub use volume::{PruneReport, VolumeManager};

use serde::Serialize;

use crate::models::WorkspaceId;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkspaceEvent {
    Provisioned { workspace_id: WorkspaceId, container_id: String, port: u16 },
    Started { workspace_id: WorkspaceId, container_id: String },
    Stopped { workspace_id: WorkspaceId },
    Deleted { workspace_id: WorkspaceId },
    Failed { workspace_id: WorkspaceId, reason: String },
    BuildProgress { tag: String, line: String },
}
