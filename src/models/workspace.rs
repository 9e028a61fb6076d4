use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::OrchestratorError;

pub type WorkspaceId = u32;

/// Name of the container backing a workspace.
pub fn container_name(id: WorkspaceId) -> String {
    format!("workspace_{}", id)
}

/// Name of the persistent volume backing a workspace.
pub fn volume_name(id: WorkspaceId) -> String {
    format!("workspace-{}", id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    NotCreated,
    Created,
    Running,
    Stopped,
    Failed,
    DockerUnavailable,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::NotCreated => "not_created",
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Failed => "failed",
            ContainerStatus::DockerUnavailable => "docker_unavailable",
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_created" => Ok(ContainerStatus::NotCreated),
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "stopped" => Ok(ContainerStatus::Stopped),
            "failed" => Ok(ContainerStatus::Failed),
            "docker_unavailable" => Ok(ContainerStatus::DockerUnavailable),
            _ => Err(format!("Unknown container status: {}", s)),
        }
    }
}

/// Memory limit as written by users ("4g", "512m"), kept alongside its byte value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MemorySize {
    raw: String,
    bytes: i64,
}

impl MemorySize {
    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for MemorySize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim().to_lowercase();
        let unit_start = raw
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(raw.len());
        let (digits, unit) = raw.split_at(unit_start);

        let value: i64 = digits
            .parse()
            .map_err(|_| format!("Invalid memory size: {}", s))?;
        let multiplier: i64 = match unit.trim_end_matches('b') {
            "" if unit.is_empty() || unit == "b" => 1,
            "k" => 1024,
            "m" => 1024 * 1024,
            "g" => 1024 * 1024 * 1024,
            "t" => 1024 * 1024 * 1024 * 1024,
            _ => return Err(format!("Invalid memory unit in {}", s)),
        };
        if value <= 0 {
            return Err(format!("Memory size must be positive: {}", s));
        }
        let bytes = value
            .checked_mul(multiplier)
            .ok_or_else(|| format!("Memory size overflows: {}", s))?;

        Ok(Self { raw, bytes })
    }
}

impl TryFrom<String> for MemorySize {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<MemorySize> for String {
    fn from(value: MemorySize) -> Self {
        value.raw
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedLimits")]
pub struct ResourceLimits {
    pub cpu_count: u32,
    pub memory: MemorySize,
}

#[derive(Deserialize)]
struct UncheckedLimits {
    cpu_count: u32,
    memory: MemorySize,
}

impl TryFrom<UncheckedLimits> for ResourceLimits {
    type Error = OrchestratorError;

    fn try_from(value: UncheckedLimits) -> Result<Self, Self::Error> {
        Self::checked(value.cpu_count, value.memory)
    }
}

impl ResourceLimits {
    pub fn new(cpu_count: u32, memory: &str) -> Result<Self, OrchestratorError> {
        let memory = memory.parse().map_err(OrchestratorError::InvalidLimits)?;
        Self::checked(cpu_count, memory)
    }

    fn checked(cpu_count: u32, memory: MemorySize) -> Result<Self, OrchestratorError> {
        if cpu_count == 0 {
            return Err(OrchestratorError::InvalidLimits(
                "cpu_count must be at least 1".to_string(),
            ));
        }
        Ok(Self { cpu_count, memory })
    }

    /// CFS quota for `cpu_count` CPUs against `period` microseconds.
    pub fn cpu_quota(&self, period: i64) -> i64 {
        i64::from(self.cpu_count) * period
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_count: 2,
            memory: MemorySize {
                raw: "4g".to_string(),
                bytes: 4 * 1024 * 1024 * 1024,
            },
        }
    }
}

/// What the orchestrator needs to know about a workspace.
///
/// Implemented by [`WorkspaceDescriptor`]; embedding applications can implement
/// it on their own workspace types instead.
pub trait WorkspaceHandle: Send + Sync {
    fn id(&self) -> WorkspaceId;
    fn owner(&self) -> &str;
    fn language(&self) -> &str;
    fn limits(&self) -> &ResourceLimits;
    fn template_path(&self) -> &Path;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceDescriptor {
    pub id: WorkspaceId,
    pub owner: String,
    pub language: String,
    pub limits: ResourceLimits,
    pub template_path: PathBuf,
    #[serde(default)]
    pub git_branch: Option<String>,
    #[serde(default)]
    pub git_commit: Option<String>,
}

impl WorkspaceDescriptor {
    /// Limits may only change while the workspace is not running.
    pub fn set_limits(
        &mut self,
        limits: ResourceLimits,
        record: &ContainerRecord,
    ) -> Result<(), OrchestratorError> {
        if record.is_running || record.status == ContainerStatus::Running {
            return Err(OrchestratorError::InvalidLimits(format!(
                "workspace {} must be stopped before its limits change",
                self.id
            )));
        }
        self.limits = limits;
        Ok(())
    }
}

impl WorkspaceHandle for WorkspaceDescriptor {
    fn id(&self) -> WorkspaceId {
        self.id
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn language(&self) -> &str {
        &self.language
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn template_path(&self) -> &Path {
        &self.template_path
    }
}

/// Container-related fields persisted on a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub status: ContainerStatus,
    pub port: Option<u16>,
    pub password: Option<String>,
    pub url: Option<String>,
    pub is_running: bool,
    pub last_accessed: Option<DateTime<Utc>>,
}

impl Default for ContainerRecord {
    fn default() -> Self {
        Self {
            container_id: None,
            container_name: None,
            status: ContainerStatus::NotCreated,
            port: None,
            password: None,
            url: None,
            is_running: false,
            last_accessed: None,
        }
    }
}

impl ContainerRecord {
    /// Terminal state after a failed provision.
    pub fn mark_failed(&mut self) {
        self.container_id = None;
        self.container_name = None;
        self.status = ContainerStatus::Failed;
        self.port = None;
        self.url = None;
        self.password = None;
        self.is_running = false;
    }

    /// State after a delete: nothing left on the runtime.
    pub fn clear(&mut self) {
        *self = Self {
            last_accessed: self.last_accessed,
            ..Self::default()
        };
    }

    pub fn mark_running(&mut self) {
        self.status = ContainerStatus::Running;
        self.is_running = true;
        self.last_accessed = Some(Utc::now());
    }

    pub fn mark_stopped(&mut self) {
        self.status = ContainerStatus::Stopped;
        self.is_running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_memory_sizes() {
        assert_eq!("4g".parse::<MemorySize>().unwrap().bytes(), 4 * 1024 * 1024 * 1024);
        assert_eq!("512M".parse::<MemorySize>().unwrap().bytes(), 512 * 1024 * 1024);
        assert_eq!("2gb".parse::<MemorySize>().unwrap().bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!("1024".parse::<MemorySize>().unwrap().bytes(), 1024);
        assert!("".parse::<MemorySize>().is_err());
        assert!("4x".parse::<MemorySize>().is_err());
        assert!("0g".parse::<MemorySize>().is_err());
    }

    #[test]
    fn rejects_zero_cpus() {
        assert!(ResourceLimits::new(0, "4g").is_err());
        let limits = ResourceLimits::new(2, "4g").unwrap();
        assert_eq!(limits.cpu_quota(100_000), 200_000);
    }

    #[test]
    fn deserialized_limits_are_validated() {
        let limits: ResourceLimits =
            serde_json::from_str(r#"{"cpu_count": 4, "memory": "8g"}"#).unwrap();
        assert_eq!(limits, ResourceLimits::new(4, "8g").unwrap());

        assert!(serde_json::from_str::<ResourceLimits>(r#"{"cpu_count": 0, "memory": "4g"}"#).is_err());
        assert!(serde_json::from_str::<ResourceLimits>(r#"{"cpu_count": 2, "memory": "lots"}"#).is_err());
    }

    #[test]
    fn limits_change_only_while_stopped() {
        let mut descriptor = WorkspaceDescriptor {
            id: 1,
            owner: "alice".to_string(),
            language: "python".to_string(),
            limits: ResourceLimits::default(),
            template_path: PathBuf::from("/tmp/ws/1"),
            git_branch: None,
            git_commit: None,
        };
        let mut record = ContainerRecord::default();
        record.mark_running();

        let bigger = ResourceLimits::new(4, "8g").unwrap();
        assert!(descriptor.set_limits(bigger.clone(), &record).is_err());

        record.mark_stopped();
        descriptor.set_limits(bigger.clone(), &record).unwrap();
        assert_eq!(descriptor.limits, bigger);
    }

    #[test]
    fn failed_record_drops_runtime_fields() {
        let mut record = ContainerRecord {
            container_id: Some("abc".into()),
            container_name: Some(container_name(3)),
            status: ContainerStatus::Created,
            port: Some(8003),
            password: Some("secret".into()),
            url: Some("http://localhost:8003".into()),
            is_running: true,
            last_accessed: None,
        };
        record.mark_failed();
        assert_eq!(record.container_id, None);
        assert_eq!(record.container_name, None);
        assert_eq!(record.status, ContainerStatus::Failed);
        assert_eq!(record.port, None);
        assert_eq!(record.password, None);
        assert!(!record.is_running);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            ContainerStatus::NotCreated,
            ContainerStatus::Running,
            ContainerStatus::DockerUnavailable,
        ] {
            assert_eq!(status.as_str().parse::<ContainerStatus>().unwrap(), status);
        }
    }
}
