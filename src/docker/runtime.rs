use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Port already allocated: {0}")]
    PortInUse(String),

    #[error("Runtime API error: {0}")]
    Api(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

/// Container state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Unknown,
}

impl RuntimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeState::Created => "created",
            RuntimeState::Running => "running",
            RuntimeState::Paused => "paused",
            RuntimeState::Restarting => "restarting",
            RuntimeState::Removing => "removing",
            RuntimeState::Exited => "exited",
            RuntimeState::Dead => "dead",
            RuntimeState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub state: RuntimeState,
    /// Health check status, `"none"` when the container has no health check.
    pub health: String,
}

#[derive(Debug, Clone)]
pub struct ContainerListing {
    pub published_ports: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Bind {
    pub fn to_spec(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{}", self.source, self.target, mode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub test: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: i64,
}

/// Everything the runtime needs to create and start a workspace container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub binds: Vec<Bind>,
    pub working_dir: String,
    pub service_port: u16,
    pub host_port: u16,
    pub cpu_period: i64,
    pub cpu_quota: i64,
    pub memory_bytes: i64,
    pub restart_policy: String,
    pub health_check: HealthCheck,
}

/// Cumulative counters from one stats read, with the previous sample's counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSample {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_total: u64,
    pub presystem_total: u64,
    pub online_cpus: Option<u64>,
    pub percpu_count: usize,
    pub memory_usage: u64,
    pub memory_limit: u64,
}

/// One line of streamed image-build output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutput {
    Progress(String),
    Error(String),
}

/// The subset of the container runtime API the orchestrator speaks.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn ping(&self) -> Result<(), RuntimeError>;

    // Containers
    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerDetails, RuntimeError>;
    /// Create and start in one call. Returns the container id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;
    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError>;
    async fn list_containers(&self) -> Result<Vec<ContainerListing>, RuntimeError>;
    async fn upload_archive(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), RuntimeError>;
    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError>;
    async fn logs(&self, id: &str, tail: usize) -> Result<String, RuntimeError>;

    // Volumes
    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo, RuntimeError>;
    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError>;
    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RuntimeError>;
    async fn remove_volume(&self, name: &str, force: bool) -> Result<(), RuntimeError>;

    // Images
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;
    /// Streams build output for a tar build context holding a `Dockerfile`.
    fn build_image<'a>(
        &'a self,
        tag: &'a str,
        context: Vec<u8>,
    ) -> BoxStream<'a, Result<BuildOutput, RuntimeError>>;
}
