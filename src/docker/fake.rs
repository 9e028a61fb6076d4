//! In-memory runtime used by the unit tests.

use async_trait::async_trait;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::runtime::{
    BuildOutput, ContainerDetails, ContainerListing, ContainerRuntime, ContainerSpec,
    RuntimeError, RuntimeState, StatsSample, VolumeInfo,
};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub port: u16,
    pub spec: Option<ContainerSpec>,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    next_id: u64,
    containers: HashMap<String, FakeContainer>,
    volumes: HashMap<String, HashMap<String, String>>,
    images: HashSet<String>,
    busy_ports: HashSet<u16>,
    fail_uploads: bool,
    fail_volume_create: bool,
    failing_volume_removals: HashSet<String>,
    build_script: Vec<BuildOutput>,
    build_delay: Duration,
    builds: usize,
    last_build_context: Vec<u8>,
    stats: StatsSample,
    stats_error: Option<String>,
    remove_container_calls: usize,
    uploads: Vec<(String, String, Vec<u8>)>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn guard(&self) -> Result<MutexGuard<'_, State>, RuntimeError> {
        let state = self.state();
        if state.unreachable {
            return Err(RuntimeError::Unavailable("fake runtime unreachable".to_string()));
        }
        Ok(state)
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state().unreachable = !reachable;
    }

    pub fn insert_container(&self, name: &str, port: u16, running: bool) -> String {
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: name.to_string(),
                running,
                port,
                spec: None,
            },
        );
        id
    }

    pub fn insert_volume(&self, name: &str, labels: &[(&str, &str)]) {
        self.state().volumes.insert(
            name.to_string(),
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }

    pub fn add_image(&self, reference: &str) {
        self.state().images.insert(reference.to_string());
    }

    pub fn occupy_port(&self, port: u16) {
        self.state().busy_ports.insert(port);
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state().fail_uploads = fail;
    }

    pub fn fail_volume_create(&self, fail: bool) {
        self.state().fail_volume_create = fail;
    }

    pub fn fail_volume_removal(&self, name: &str) {
        self.state().failing_volume_removals.insert(name.to_string());
    }

    pub fn set_build_script(&self, script: Vec<BuildOutput>, delay: Duration) {
        let mut state = self.state();
        state.build_script = script;
        state.build_delay = delay;
    }

    pub fn set_stats(&self, stats: StatsSample) {
        self.state().stats = stats;
    }

    pub fn set_stats_error(&self, message: &str) {
        self.state().stats_error = Some(message.to_string());
    }

    pub fn container(&self, id_or_name: &str) -> Option<FakeContainer> {
        let state = self.state();
        find(&state, id_or_name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state().containers.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn volume_labels(&self, name: &str) -> Option<HashMap<String, String>> {
        self.state().volumes.get(name).cloned()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state().images.contains(reference)
    }

    pub fn builds(&self) -> usize {
        self.state().builds
    }

    pub fn last_build_context(&self) -> Vec<u8> {
        self.state().last_build_context.clone()
    }

    pub fn remove_container_calls(&self) -> usize {
        self.state().remove_container_calls
    }

    pub fn uploads(&self) -> Vec<(String, String, Vec<u8>)> {
        self.state().uploads.clone()
    }
}

fn find<'a>(state: &'a State, id_or_name: &str) -> Option<&'a FakeContainer> {
    state
        .containers
        .get(id_or_name)
        .or_else(|| state.containers.values().find(|c| c.name == id_or_name))
}

fn find_id(state: &State, id_or_name: &str) -> Result<String, RuntimeError> {
    find(state, id_or_name)
        .map(|c| c.id.clone())
        .ok_or_else(|| RuntimeError::NotFound(format!("No such container: {}", id_or_name)))
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.guard().map(|_| ())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerDetails, RuntimeError> {
        let state = self.guard()?;
        let id = find_id(&state, id_or_name)?;
        let container = &state.containers[&id];
        Ok(ContainerDetails {
            id: container.id.clone(),
            name: container.name.clone(),
            state: if container.running {
                RuntimeState::Running
            } else {
                RuntimeState::Exited
            },
            health: "healthy".to_string(),
        })
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let mut state = self.guard()?;
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::Conflict(format!("name {} in use", spec.name)));
        }
        if state.busy_ports.contains(&spec.host_port)
            || state.containers.values().any(|c| c.port == spec.host_port)
        {
            return Err(RuntimeError::PortInUse(format!(
                "Bind for 0.0.0.0:{} failed: port is already allocated",
                spec.host_port
            )));
        }

        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                name: spec.name.clone(),
                running: true,
                port: spec.host_port,
                spec: Some(spec.clone()),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let mut state = self.guard()?;
        let id = find_id(&state, id)?;
        if let Some(c) = state.containers.get_mut(&id) {
            c.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut state = self.guard()?;
        let id = find_id(&state, id)?;
        if let Some(c) = state.containers.get_mut(&id) {
            c.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let mut state = self.guard()?;
        state.remove_container_calls += 1;
        let id = find_id(&state, id)?;
        if state.containers[&id].running && !force {
            return Err(RuntimeError::Conflict(format!("container {} is running", id)));
        }
        state.containers.remove(&id);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerListing>, RuntimeError> {
        let state = self.guard()?;
        Ok(state
            .containers
            .values()
            .map(|c| ContainerListing {
                published_ports: vec![c.port],
            })
            .collect())
    }

    async fn upload_archive(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), RuntimeError> {
        let mut state = self.guard()?;
        let id = find_id(&state, id)?;
        if state.fail_uploads {
            return Err(RuntimeError::Api(format!("upload to {} rejected", id)));
        }
        state.uploads.push((id, path.to_string(), tar));
        Ok(())
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        let state = self.guard()?;
        find_id(&state, id)?;
        if let Some(message) = &state.stats_error {
            return Err(RuntimeError::Api(message.clone()));
        }
        Ok(state.stats.clone())
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, RuntimeError> {
        let state = self.guard()?;
        let id = find_id(&state, id)?;
        Ok(format!("2024-01-01T00:00:00Z tail={} container={}\n", tail, id))
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo, RuntimeError> {
        let state = self.guard()?;
        state
            .volumes
            .get(name)
            .map(|labels| VolumeInfo {
                name: name.to_string(),
                labels: labels.clone(),
            })
            .ok_or_else(|| RuntimeError::NotFound(format!("No such volume: {}", name)))
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let mut state = self.guard()?;
        if state.fail_volume_create {
            return Err(RuntimeError::Api(format!("cannot create {}", name)));
        }
        if state.volumes.contains_key(name) {
            return Err(RuntimeError::Conflict(format!("volume {} exists", name)));
        }
        state.volumes.insert(name.to_string(), labels);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let state = self.guard()?;
        Ok(state
            .volumes
            .iter()
            .map(|(name, labels)| VolumeInfo {
                name: name.clone(),
                labels: labels.clone(),
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.guard()?;
        if state.failing_volume_removals.contains(name) {
            return Err(RuntimeError::Api(format!("volume {} is in use", name)));
        }
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(format!("No such volume: {}", name)))
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        Ok(self.guard()?.images.contains(reference))
    }

    fn build_image<'a>(
        &'a self,
        tag: &'a str,
        context: Vec<u8>,
    ) -> BoxStream<'a, Result<BuildOutput, RuntimeError>> {
        let (script, delay) = {
            let mut state = self.state();
            state.builds += 1;
            state.last_build_context = context;
            (state.build_script.clone(), state.build_delay)
        };
        let succeeded = !script.iter().any(|o| matches!(o, BuildOutput::Error(_)));

        let lines = stream::iter(script.into_iter().map(Some));
        let finish = stream::once(async move {
            tokio::time::sleep(delay).await;
            if succeeded {
                self.state().images.insert(tag.to_string());
            }
            None
        });

        lines
            .chain(finish)
            .filter_map(|item| future::ready(item.map(Ok)))
            .boxed()
    }
}
