use serde::Serialize;
use tracing::warn;

use super::runtime::{ContainerRuntime, RuntimeError, StatsSample};
use crate::error::{OrchestratorError, Result};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Point-in-time view of a container for status pages.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub status: String,
    pub health: String,
    pub cpu_percent: f64,
    pub memory_usage_mb: f64,
    pub memory_limit_mb: f64,
    pub memory_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    fn empty(status: &str) -> Self {
        Self {
            status: status.to_string(),
            health: "unknown".to_string(),
            cpu_percent: 0.0,
            memory_usage_mb: 0.0,
            memory_limit_mb: 0.0,
            memory_percent: 0.0,
            error: None,
        }
    }

    pub fn runtime_unavailable() -> Self {
        Self::empty("docker_unavailable")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::empty("error")
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// CPU usage over the sample window, scaled by the number of online CPUs.
pub fn cpu_percent(sample: &StatsSample) -> f64 {
    let cpu_delta = sample.cpu_total.saturating_sub(sample.precpu_total) as f64;
    let system_delta = sample.system_total.saturating_sub(sample.presystem_total) as f64;
    if system_delta <= 0.0 {
        return 0.0;
    }

    let cpus = match sample.online_cpus {
        Some(n) if n > 0 => n,
        _ if sample.percpu_count > 0 => sample.percpu_count as u64,
        _ => 1,
    };

    round2(cpu_delta / system_delta * 100.0 * cpus as f64)
}

pub fn memory_percent(sample: &StatsSample) -> f64 {
    if sample.memory_limit == 0 {
        return 0.0;
    }
    round2(sample.memory_usage as f64 / sample.memory_limit as f64 * 100.0)
}

/// Reads state, health and one stats snapshot for `container_id`.
///
/// A missing container is `NotFound`. Any other failure to read the container
/// is folded into a report with status `error`.
pub async fn collect(runtime: &dyn ContainerRuntime, container_id: &str) -> Result<StatusReport> {
    let details = match runtime.inspect_container(container_id).await {
        Ok(details) => details,
        Err(RuntimeError::NotFound(_)) => {
            return Err(OrchestratorError::NotFound(format!("container {}", container_id)))
        }
        Err(RuntimeError::Unavailable(_)) => return Err(OrchestratorError::RuntimeUnavailable),
        Err(e) => {
            warn!("Failed to inspect container {}: {}", container_id, e);
            return Ok(StatusReport::error(e.to_string()));
        }
    };

    let sample = match runtime.stats(container_id).await {
        Ok(sample) => sample,
        Err(RuntimeError::NotFound(_)) => {
            return Err(OrchestratorError::NotFound(format!("container {}", container_id)))
        }
        Err(RuntimeError::Unavailable(_)) => return Err(OrchestratorError::RuntimeUnavailable),
        Err(e) => {
            warn!("Failed to read stats for container {}: {}", container_id, e);
            return Ok(StatusReport::error(e.to_string()));
        }
    };

    Ok(StatusReport {
        status: details.state.as_str().to_string(),
        health: details.health,
        cpu_percent: cpu_percent(&sample),
        memory_usage_mb: round2(sample.memory_usage as f64 / BYTES_PER_MB),
        memory_limit_mb: round2(sample.memory_limit as f64 / BYTES_PER_MB),
        memory_percent: memory_percent(&sample),
        error: None,
    })
}
