use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use super::runtime::{ContainerRuntime, RuntimeError};
use crate::error::{OrchestratorError, Result};
use crate::models::{volume_name, WorkspaceId};

pub const VOLUME_PREFIX: &str = "workspace-";
pub const LABEL_WORKSPACE_ID: &str = "workspace_id";
pub const LABEL_CREATED_AT: &str = "created_at";

#[derive(Debug, Default, Serialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub errors: Vec<(String, String)>,
}

/// Per-workspace named volumes on the runtime.
pub struct VolumeManager;

impl VolumeManager {
    pub fn new() -> Self {
        Self
    }

    pub async fn ensure_volume(
        &self,
        runtime: &dyn ContainerRuntime,
        workspace_id: WorkspaceId,
    ) -> Result<String> {
        let name = volume_name(workspace_id);

        match runtime.inspect_volume(&name).await {
            Ok(_) => return Ok(name),
            Err(e) if e.is_not_found() => {}
            Err(RuntimeError::Unavailable(_)) => return Err(OrchestratorError::RuntimeUnavailable),
            Err(e) => {
                return Err(OrchestratorError::VolumeCreationFailed {
                    workspace_id,
                    reason: e.to_string(),
                })
            }
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_WORKSPACE_ID.to_string(), workspace_id.to_string());
        labels.insert(LABEL_CREATED_AT.to_string(), Utc::now().to_rfc3339());

        if let Err(e) = runtime.create_volume(&name, labels).await {
            // Another provision may have created it first
            if runtime.inspect_volume(&name).await.is_ok() {
                info!("Volume {} appeared concurrently, reusing it", name);
                return Ok(name);
            }
            return Err(OrchestratorError::VolumeCreationFailed {
                workspace_id,
                reason: e.to_string(),
            });
        }

        info!("Created volume {} for workspace {}", name, workspace_id);
        Ok(name)
    }

    /// Removes the workspace's volume. A missing volume counts as removed.
    pub async fn remove_volume(
        &self,
        runtime: &dyn ContainerRuntime,
        workspace_id: WorkspaceId,
    ) -> Result<()> {
        let name = volume_name(workspace_id);
        match runtime.remove_volume(&name, true).await {
            Ok(()) => {
                info!("Removed volume {} for workspace {}", name, workspace_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn prune_older_than(
        &self,
        runtime: &dyn ContainerRuntime,
        days: i64,
    ) -> Result<PruneReport> {
        self.prune_before(runtime, Utc::now() - Duration::days(days)).await
    }

    pub async fn prune_before(
        &self,
        runtime: &dyn ContainerRuntime,
        cutoff: DateTime<Utc>,
    ) -> Result<PruneReport> {
        let mut report = PruneReport::default();

        for volume in runtime.list_volumes().await? {
            if !volume.name.starts_with(VOLUME_PREFIX) {
                continue;
            }
            let Some(created_at) = volume.labels.get(LABEL_CREATED_AT) else {
                continue;
            };
            let Some(created_at) = parse_created_at(created_at) else {
                warn!("Skipping volume {} with unreadable created_at {:?}", volume.name, created_at);
                continue;
            };
            if created_at >= cutoff {
                continue;
            }

            match runtime.remove_volume(&volume.name, true).await {
                Ok(()) => {
                    info!("Pruned volume {} created at {}", volume.name, created_at);
                    report.removed.push(volume.name);
                }
                Err(e) => {
                    warn!("Failed to prune volume {}: {}", volume.name, e);
                    report.errors.push((volume.name, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

impl Default for VolumeManager {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
fn parse_created_at(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
