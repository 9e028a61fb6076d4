use serde::Serialize;
use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::archive::FileInjector;
use super::cleanup::CleanupCoordinator;
use super::connector::RuntimeConnector;
use super::container::ContainerTemplate;
use super::image::{ImageResolver, ResolvedImage, DEFAULT_BASE_IMAGE};
use super::ports::{PortAllocator, PortPolicy};
use super::runtime::{ContainerRuntime, RuntimeError, RuntimeState};
use super::stats::{self, StatusReport};
use super::volume::{PruneReport, VolumeManager};
use super::WorkspaceEvent;
use crate::error::{OrchestratorError, Result};
use crate::models::{
    container_name, ContainerRecord, ContainerStatus, WorkspaceHandle, WorkspaceId, WorkspaceStore,
};

pub const DEFAULT_LOG_TAIL: usize = 100;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Host name used in access URLs.
    pub public_host: String,
    pub port_range: Range<u16>,
    pub port_policy: PortPolicy,
    /// Attempts at creating a container when the runtime rejects the port.
    pub port_retries: u32,
    pub stop_grace: Duration,
    pub base_image: String,
    pub ssh_dir: Option<PathBuf>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            public_host: "localhost".to_string(),
            port_range: 8000..10000,
            port_policy: PortPolicy::Deterministic,
            port_retries: 5,
            stop_grace: Duration::from_secs(10),
            base_image: DEFAULT_BASE_IMAGE.to_string(),
            ssh_dir: dirs::home_dir().map(|home| home.join(".ssh")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Applied,
    /// Nothing to do; the workspace was already in the requested state.
    AlreadyInState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub outcome: Outcome,
    pub record: ContainerRecord,
}

impl Transition {
    fn applied(record: ContainerRecord) -> Self {
        Self {
            outcome: Outcome::Applied,
            record,
        }
    }

    fn unchanged(record: ContainerRecord) -> Self {
        Self {
            outcome: Outcome::AlreadyInState,
            record,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkspaceState {
    NotCreated,
    /// The recorded container no longer exists.
    NotFound,
    DockerUnavailable,
    Present(StatusReport),
}

/// Drives workspace containers through their lifecycle.
///
/// Transitions for one workspace are serialized; different workspaces proceed
/// independently.
pub struct Orchestrator {
    connector: Arc<RuntimeConnector>,
    store: Arc<dyn WorkspaceStore>,
    settings: OrchestratorSettings,
    images: ImageResolver,
    volumes: VolumeManager,
    ports: PortAllocator,
    injector: FileInjector,
    template: ContainerTemplate,
    cleanup: CleanupCoordinator,
    locks: Mutex<HashMap<WorkspaceId, Arc<tokio::sync::Mutex<()>>>>,
    event_sender: Option<mpsc::UnboundedSender<WorkspaceEvent>>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<RuntimeConnector>,
        store: Arc<dyn WorkspaceStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            images: ImageResolver::with_defaults(&settings.base_image),
            ports: PortAllocator::new(settings.port_range.clone(), settings.port_policy),
            template: ContainerTemplate::new(settings.ssh_dir.clone()),
            cleanup: CleanupCoordinator::new(settings.stop_grace),
            volumes: VolumeManager::new(),
            injector: FileInjector::new(),
            locks: Mutex::new(HashMap::new()),
            event_sender: None,
            connector,
            store,
            settings,
        }
    }

    /// Starts publishing lifecycle events, replacing any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<WorkspaceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.event_sender = Some(tx);
        rx
    }

    pub fn is_available(&self) -> bool {
        self.connector.is_available()
    }

    fn emit(&self, event: WorkspaceEvent) {
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event);
        }
    }

    fn lock_for(&self, id: WorkspaceId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id).or_default().clone()
    }

    fn access_url(&self, port: u16, password: &str) -> String {
        format!("http://{}:{}/?password={}", self.settings.public_host, port, password)
    }

    /// Drops the cached connection when `err` says the runtime went away.
    async fn observe(&self, err: OrchestratorError) -> OrchestratorError {
        if matches!(err, OrchestratorError::RuntimeUnavailable) {
            self.connector.invalidate().await;
        }
        err
    }

    async fn runtime_failure(&self, err: RuntimeError) -> OrchestratorError {
        self.observe(err.into()).await
    }

    /// Runtime handle for a mutating operation. When the runtime is unreachable
    /// the record is marked `docker_unavailable` before the error is returned.
    async fn runtime_for_update(
        &self,
        id: WorkspaceId,
        record: &mut ContainerRecord,
    ) -> Result<Arc<dyn ContainerRuntime>> {
        match self.connector.runtime().await {
            Ok(runtime) => Ok(runtime),
            Err(e) => Err(self.record_failure(id, record, e).await?),
        }
    }

    /// Marks the record `docker_unavailable` when `err` says the runtime went
    /// away. Returns `err` for the caller to propagate.
    async fn record_failure(
        &self,
        id: WorkspaceId,
        record: &mut ContainerRecord,
        err: OrchestratorError,
    ) -> Result<OrchestratorError> {
        if matches!(err, OrchestratorError::RuntimeUnavailable) {
            warn!("Runtime unavailable for workspace {}", id);
            record.status = ContainerStatus::DockerUnavailable;
            record.is_running = false;
            self.store.save(id, record).await?;
        }
        Ok(err)
    }

    pub async fn provision(&self, workspace: &dyn WorkspaceHandle) -> Result<Transition> {
        let lock = self.lock_for(workspace.id());
        let _guard = lock.lock().await;
        self.provision_locked(workspace).await
    }

    async fn provision_locked(&self, workspace: &dyn WorkspaceHandle) -> Result<Transition> {
        let id = workspace.id();
        let mut record = self.store.load(id).await?;
        let runtime = self.runtime_for_update(id, &mut record).await?;
        self.provision_on(runtime.as_ref(), workspace, record).await
    }

    async fn provision_on(
        &self,
        runtime: &dyn ContainerRuntime,
        workspace: &dyn WorkspaceHandle,
        mut record: ContainerRecord,
    ) -> Result<Transition> {
        let id = workspace.id();
        info!("Provisioning workspace {} ({})", id, workspace.language());

        // A container left from an earlier provision is removed on failure too.
        let mut container = record.container_id.clone();
        match self
            .try_provision(runtime, workspace, &mut record, &mut container)
            .await
        {
            Ok(()) => {
                info!(
                    "Workspace {} running in container {} on port {}",
                    id,
                    record.container_id.as_deref().unwrap_or_default(),
                    record.port.unwrap_or_default()
                );
                Ok(Transition::applied(record))
            }
            Err(e) => {
                error!("Provisioning workspace {} failed: {}", id, e);
                self.cleanup
                    .cleanup_failed_provision(Some(runtime), self.store.as_ref(), id, container.as_deref())
                    .await;
                self.emit(WorkspaceEvent::Failed {
                    workspace_id: id,
                    reason: e.to_string(),
                });
                Err(self.observe(e).await)
            }
        }
    }

    /// `container` is set as soon as a container may exist, so a failure after
    /// that point can remove it.
    async fn try_provision(
        &self,
        runtime: &dyn ContainerRuntime,
        workspace: &dyn WorkspaceHandle,
        record: &mut ContainerRecord,
        container: &mut Option<String>,
    ) -> Result<()> {
        let id = workspace.id();
        let image = self
            .images
            .resolve(runtime, workspace.language(), self.event_sender.as_ref())
            .await?;
        self.volumes.ensure_volume(runtime, id).await?;

        let name = container_name(id);
        self.remove_existing(runtime, id, &name).await?;

        let password = record
            .password
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let (container_id, port) = self
            .run_with_port_retry(runtime, workspace, &image, record.port, &password, container)
            .await?;
        *container = Some(container_id.clone());

        record.container_id = Some(container_id.clone());
        record.container_name = Some(name);
        record.status = ContainerStatus::Created;
        record.port = Some(port);
        record.password = Some(password.clone());
        record.url = None;
        record.is_running = false;
        self.store.save(id, record).await?;

        self.injector
            .inject(runtime, id, &container_id, workspace.template_path())
            .await?;

        record.url = Some(self.access_url(port, &password));
        record.mark_running();
        self.store.save(id, record).await?;

        self.emit(WorkspaceEvent::Provisioned {
            workspace_id: id,
            container_id,
            port,
        });
        Ok(())
    }

    async fn remove_existing(
        &self,
        runtime: &dyn ContainerRuntime,
        id: WorkspaceId,
        name: &str,
    ) -> Result<()> {
        let existing = match runtime.inspect_container(name).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        info!("Removing existing container {} of workspace {}", existing.id, id);
        match runtime.remove_container(&existing.id, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn run_with_port_retry(
        &self,
        runtime: &dyn ContainerRuntime,
        workspace: &dyn WorkspaceHandle,
        image: &ResolvedImage,
        preferred: Option<u16>,
        password: &str,
        container: &mut Option<String>,
    ) -> Result<(String, u16)> {
        let id = workspace.id();
        let mut excluded = self.ports.published_ports(runtime).await?;
        let mut preferred = preferred;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let port = self.ports.allocate(id, preferred, &excluded)?;
            let spec = self.template.render(workspace, image, port, password);
            *container = Some(spec.name.clone());

            match runtime.run_container(&spec).await {
                Ok(container_id) => return Ok((container_id, port)),
                Err(RuntimeError::PortInUse(message)) if attempt < self.settings.port_retries => {
                    warn!(
                        "Port {} rejected for workspace {} (attempt {}): {}",
                        port, id, attempt, message
                    );
                    excluded.insert(port);
                    preferred = None;
                }
                Err(RuntimeError::Unavailable(_)) => return Err(OrchestratorError::RuntimeUnavailable),
                Err(e) => {
                    return Err(OrchestratorError::ProvisionFailed {
                        workspace_id: id,
                        reason: format!("failed to create container: {}", e),
                    })
                }
            }
        }
    }

    pub async fn start(&self, workspace: &dyn WorkspaceHandle) -> Result<Transition> {
        let id = workspace.id();
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.load(id).await?;
        let runtime = self.runtime_for_update(id, &mut record).await?;

        let Some(container_id) = record.container_id.clone() else {
            info!("Workspace {} has no container, provisioning", id);
            return self.provision_on(runtime.as_ref(), workspace, record).await;
        };

        match runtime.inspect_container(&container_id).await {
            Ok(details) if details.state == RuntimeState::Running => {
                record.mark_running();
                self.store.save(id, &record).await?;
                Ok(Transition::unchanged(record))
            }
            Ok(_) => {
                if let Err(e) = runtime.start_container(&container_id).await {
                    return Err(self.runtime_failure(e).await);
                }
                info!("Started container {} for workspace {}", container_id, id);
                record.mark_running();
                self.store.save(id, &record).await?;
                self.emit(WorkspaceEvent::Started {
                    workspace_id: id,
                    container_id,
                });
                Ok(Transition::applied(record))
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    "Container {} of workspace {} no longer exists, re-provisioning",
                    container_id, id
                );
                self.provision_on(runtime.as_ref(), workspace, record).await
            }
            Err(e) => Err(self.runtime_failure(e).await),
        }
    }

    pub async fn stop(&self, id: WorkspaceId) -> Result<Transition> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;
        self.stop_locked(id).await
    }

    async fn stop_locked(&self, id: WorkspaceId) -> Result<Transition> {
        let mut record = self.store.load(id).await?;
        let Some(container_id) = record.container_id.clone() else {
            return Ok(Transition::unchanged(record));
        };

        let runtime = self.runtime_for_update(id, &mut record).await?;
        let outcome = match runtime.inspect_container(&container_id).await {
            Ok(details)
                if matches!(
                    details.state,
                    RuntimeState::Running | RuntimeState::Restarting | RuntimeState::Paused
                ) =>
            {
                if let Err(e) = runtime
                    .stop_container(&container_id, self.settings.stop_grace)
                    .await
                {
                    if !e.is_not_found() {
                        let e = self.runtime_failure(e).await;
                        return Err(self.record_failure(id, &mut record, e).await?);
                    }
                }
                info!("Stopped container {} for workspace {}", container_id, id);
                Outcome::Applied
            }
            Ok(_) => Outcome::AlreadyInState,
            Err(e) if e.is_not_found() => {
                warn!("Container {} of workspace {} is already gone", container_id, id);
                Outcome::AlreadyInState
            }
            Err(e) => {
                let e = self.runtime_failure(e).await;
                return Err(self.record_failure(id, &mut record, e).await?);
            }
        };

        record.mark_stopped();
        self.store.save(id, &record).await?;
        if outcome == Outcome::Applied {
            self.emit(WorkspaceEvent::Stopped { workspace_id: id });
        }
        Ok(Transition { outcome, record })
    }

    /// Stop, then a full re-provision that keeps the port and credential.
    pub async fn restart(&self, workspace: &dyn WorkspaceHandle) -> Result<Transition> {
        let lock = self.lock_for(workspace.id());
        let _guard = lock.lock().await;

        self.stop_locked(workspace.id()).await?;
        self.provision_locked(workspace).await
    }

    /// Errors from the runtime are returned after the record is cleared.
    pub async fn delete(&self, id: WorkspaceId, remove_volume: bool) -> Result<Transition> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.load(id).await?;
        let mut result = Ok(());

        if let Some(container_id) = record.container_id.clone() {
            result = self.remove_container(id, &container_id).await;
        }

        if remove_volume {
            match self.connector.runtime().await {
                Ok(runtime) => {
                    if let Err(e) = self.volumes.remove_volume(runtime.as_ref(), id).await {
                        warn!("Failed to remove volume of workspace {}: {}", id, e);
                    }
                }
                Err(e) => warn!("Skipping volume removal for workspace {}: {}", id, e),
            }
        }

        let outcome = if record.container_id.is_some() {
            Outcome::Applied
        } else {
            Outcome::AlreadyInState
        };
        record.clear();
        self.store.save(id, &record).await?;
        info!("Deleted workspace {} container", id);
        self.emit(WorkspaceEvent::Deleted { workspace_id: id });

        result.map(|()| Transition { outcome, record })
    }

    async fn remove_container(&self, id: WorkspaceId, container_id: &str) -> Result<()> {
        let runtime = self.connector.runtime().await?;

        let details = match runtime.inspect_container(container_id).await {
            Ok(details) => details,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(self.runtime_failure(e).await),
        };

        if details.state == RuntimeState::Running {
            if let Err(e) = runtime
                .stop_container(container_id, self.settings.stop_grace)
                .await
            {
                warn!("Failed to stop container {} before removal: {}", container_id, e);
            }
        }

        match runtime.remove_container(container_id, true).await {
            Ok(()) => {
                info!("Removed container {} of workspace {}", container_id, id);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(self.runtime_failure(e).await),
        }
    }

    /// State, health and resource usage of one container.
    pub async fn status(&self, container_id: &str) -> Result<StatusReport> {
        let runtime = match self.connector.runtime().await {
            Ok(runtime) => runtime,
            Err(_) => return Ok(StatusReport::runtime_unavailable()),
        };

        match stats::collect(runtime.as_ref(), container_id).await {
            Err(OrchestratorError::RuntimeUnavailable) => {
                self.connector.invalidate().await;
                Ok(StatusReport::runtime_unavailable())
            }
            other => other,
        }
    }

    /// Status of a workspace's container, reconciling the record when the
    /// container has disappeared.
    pub async fn workspace_status(&self, id: WorkspaceId) -> Result<WorkspaceState> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut record = self.store.load(id).await?;
        let Some(container_id) = record.container_id.clone() else {
            return Ok(WorkspaceState::NotCreated);
        };

        match self.status(&container_id).await {
            Ok(report) if report.status == "docker_unavailable" => Ok(WorkspaceState::DockerUnavailable),
            Ok(report) => {
                let running = report.status == RuntimeState::Running.as_str();
                if report.error.is_none() && running != record.is_running {
                    if running {
                        record.mark_running();
                    } else {
                        record.mark_stopped();
                    }
                    self.store.save(id, &record).await?;
                }
                Ok(WorkspaceState::Present(report))
            }
            Err(OrchestratorError::NotFound(_)) => {
                warn!(
                    "Container {} of workspace {} not found, clearing record",
                    container_id, id
                );
                record.container_id = None;
                record.container_name = None;
                record.url = None;
                record.mark_stopped();
                self.store.save(id, &record).await?;
                Ok(WorkspaceState::NotFound)
            }
            Err(e) => Err(e),
        }
    }

    /// Timestamped log tail. Failures are rendered into the returned text.
    pub async fn logs(&self, container_id: &str, tail: usize) -> String {
        let runtime = match self.connector.runtime().await {
            Ok(runtime) => runtime,
            Err(e) => return format!("Error getting logs: {}", e),
        };

        match runtime.logs(container_id, tail).await {
            Ok(text) => text,
            Err(e) => {
                let e = self.runtime_failure(e).await;
                format!("Error getting logs: {}", e)
            }
        }
    }

    pub async fn prune_volumes(&self, older_than_days: i64) -> Result<PruneReport> {
        let runtime = self.connector.runtime().await?;
        match self.volumes.prune_older_than(runtime.as_ref(), older_than_days).await {
            Ok(report) => Ok(report),
            Err(e) => Err(self.observe(e).await),
        }
    }

    /// Builds the toolchain image for `language`, replacing an existing tag.
    pub async fn build_image(&self, language: &str) -> Result<ResolvedImage> {
        let runtime = self.connector.runtime().await?;
        match self
            .images
            .rebuild(runtime.as_ref(), language, self.event_sender.as_ref())
            .await
        {
            Ok(image) => Ok(image),
            Err(e) => Err(self.observe(e).await),
        }
    }
}
