use std::time::Duration;
use tracing::{error, info, warn};

use super::runtime::ContainerRuntime;
use crate::error::OrchestratorError;
use crate::models::{WorkspaceId, WorkspaceStore};

/// Rolls back a provision that failed part way.
pub struct CleanupCoordinator {
    stop_grace: Duration,
}

impl CleanupCoordinator {
    pub fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }

    /// Removes `container` if one was created and resets the record to `failed`.
    ///
    /// Each step runs regardless of the previous one; failures are logged as
    /// `CleanupFailed` and never returned.
    pub async fn cleanup_failed_provision(
        &self,
        runtime: Option<&dyn ContainerRuntime>,
        store: &dyn WorkspaceStore,
        workspace_id: WorkspaceId,
        container: Option<&str>,
    ) {
        info!("Cleaning up failed provision of workspace {}", workspace_id);

        if let (Some(runtime), Some(container)) = (runtime, container) {
            if let Err(e) = runtime.stop_container(container, self.stop_grace).await {
                if !e.is_not_found() {
                    warn!("Failed to stop container {} during cleanup: {}", container, e);
                }
            }
            match runtime.remove_container(container, true).await {
                Ok(()) => info!("Removed container {} of workspace {}", container, workspace_id),
                Err(e) if e.is_not_found() => {}
                Err(e) => log_failure(format!("removing container {}: {}", container, e)),
            }
        }

        let mut record = match store.load(workspace_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load record of workspace {} during cleanup: {}", workspace_id, e);
                Default::default()
            }
        };
        record.mark_failed();
        if let Err(e) = store.save(workspace_id, &record).await {
            log_failure(format!("saving record of workspace {}: {}", workspace_id, e));
        }
    }
}

fn log_failure(reason: String) {
    error!("{}", OrchestratorError::CleanupFailed(reason));
}
