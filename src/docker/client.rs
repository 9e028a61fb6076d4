use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::BuildImageOptions;
use bollard::models::{
    ContainerInspectResponse, ContainerStateStatusEnum, HealthConfig, HealthStatusEnum,
    HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::future;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::runtime::{
    BuildOutput, ContainerDetails, ContainerListing, ContainerRuntime, ContainerSpec,
    RuntimeError, RuntimeState, StatsSample, VolumeInfo,
};

/// Docker Engine implementation of [`ContainerRuntime`].
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn map_err(context: &str, err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError { status_code: 404, message } => {
            RuntimeError::NotFound(format!("{}: {}", context, message))
        }
        BollardError::DockerResponseServerError { status_code: 409, message } => {
            RuntimeError::Conflict(format!("{}: {}", context, message))
        }
        BollardError::DockerResponseServerError { message, .. }
            if message.contains("port is already allocated")
                || message.contains("address already in use") =>
        {
            RuntimeError::PortInUse(message)
        }
        BollardError::DockerResponseServerError { message, .. } => {
            RuntimeError::Api(format!("{}: {}", context, message))
        }
        BollardError::IOError { err } => RuntimeError::Unavailable(format!("{}: {}", context, err)),
        BollardError::RequestTimeoutError => {
            RuntimeError::Unavailable(format!("{}: request timed out", context))
        }
        other => RuntimeError::Api(format!("{}: {}", context, other)),
    }
}

fn restart_policy(name: &str) -> RestartPolicyNameEnum {
    match name {
        "always" => RestartPolicyNameEnum::ALWAYS,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        "no" => RestartPolicyNameEnum::NO,
        _ => RestartPolicyNameEnum::UNLESS_STOPPED,
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let service_port = format!("{}/tcp", spec.service_port);

    let mut exposed_ports = HashMap::new();
    exposed_ports.insert(service_port.clone(), HashMap::new());

    let mut port_bindings = HashMap::new();
    port_bindings.insert(
        service_port,
        Some(vec![PortBinding {
            host_ip: None,
            host_port: Some(spec.host_port.to_string()),
        }]),
    );

    let host_config = HostConfig {
        binds: Some(spec.binds.iter().map(|b| b.to_spec()).collect()),
        port_bindings: Some(port_bindings),
        cpu_period: Some(spec.cpu_period),
        cpu_quota: Some(spec.cpu_quota),
        memory: Some(spec.memory_bytes),
        restart_policy: Some(RestartPolicy {
            name: Some(restart_policy(&spec.restart_policy)),
            maximum_retry_count: None,
        }),
        ..Default::default()
    };

    let health = &spec.health_check;
    Config {
        image: Some(spec.image.clone()),
        env: Some(spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()),
        labels: Some(spec.labels.clone().into_iter().collect()),
        working_dir: Some(spec.working_dir.clone()),
        exposed_ports: Some(exposed_ports),
        tty: Some(true),
        healthcheck: Some(HealthConfig {
            test: Some(health.test.clone()),
            interval: Some(health.interval.as_nanos() as i64),
            timeout: Some(health.timeout.as_nanos() as i64),
            retries: Some(health.retries),
            ..Default::default()
        }),
        host_config: Some(host_config),
        ..Default::default()
    }
}

fn details_from_inspect(info: ContainerInspectResponse) -> ContainerDetails {
    let state = info.state.as_ref();
    let runtime_state = match state.and_then(|s| s.status.as_ref()) {
        Some(ContainerStateStatusEnum::CREATED) => RuntimeState::Created,
        Some(ContainerStateStatusEnum::RUNNING) => RuntimeState::Running,
        Some(ContainerStateStatusEnum::PAUSED) => RuntimeState::Paused,
        Some(ContainerStateStatusEnum::RESTARTING) => RuntimeState::Restarting,
        Some(ContainerStateStatusEnum::REMOVING) => RuntimeState::Removing,
        Some(ContainerStateStatusEnum::EXITED) => RuntimeState::Exited,
        Some(ContainerStateStatusEnum::DEAD) => RuntimeState::Dead,
        _ => RuntimeState::Unknown,
    };
    let health = match state
        .and_then(|s| s.health.as_ref())
        .and_then(|h| h.status.as_ref())
    {
        Some(HealthStatusEnum::STARTING) => "starting",
        Some(HealthStatusEnum::HEALTHY) => "healthy",
        Some(HealthStatusEnum::UNHEALTHY) => "unhealthy",
        _ => "none",
    };

    ContainerDetails {
        id: info.id.unwrap_or_default(),
        name: info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        state: runtime_state,
        health: health.to_string(),
    }
}

fn sample_from_stats(stats: &Stats) -> StatsSample {
    StatsSample {
        cpu_total: stats.cpu_stats.cpu_usage.total_usage,
        precpu_total: stats.precpu_stats.cpu_usage.total_usage,
        system_total: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        presystem_total: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        online_cpus: stats.cpu_stats.online_cpus,
        percpu_count: stats
            .cpu_stats
            .cpu_usage
            .percpu_usage
            .as_ref()
            .map(Vec::len)
            .unwrap_or(0),
        memory_usage: stats.memory_stats.usage.unwrap_or(0),
        memory_limit: stats.memory_stats.limit.unwrap_or(0),
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(())
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<ContainerDetails, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id_or_name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| map_err(id_or_name, e))?;
        Ok(details_from_inspect(info))
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| map_err(&spec.name, e))?;

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            warn!("Start failed for {}, removing created container", spec.name);
            let remove = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(remove_err) = self.docker.remove_container(&response.id, Some(remove)).await {
                warn!("Failed to remove container {}: {}", response.id, remove_err);
            }
            return Err(map_err(&spec.name, e));
        }

        info!("Created and started container {} with ID: {}", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| map_err(id, e))?;

        info!("Started container: {}", id);
        Ok(())
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {}
            Err(e) => return Err(map_err(id, e)),
        }

        info!("Stopped container: {}", id);
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))?;

        info!("Removed container: {}", id);
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerListing>, RuntimeError> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| map_err("list containers", e))?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerListing {
                published_ports: c
                    .ports
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|p| p.public_port)
                    .collect(),
            })
            .collect())
    }

    async fn upload_archive(&self, id: &str, path: &str, tar: Vec<u8>) -> Result<(), RuntimeError> {
        let options = UploadToContainerOptions {
            path: path.to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), tar.into())
            .await
            .map_err(|e| map_err(id, e))
    }

    async fn stats(&self, id: &str) -> Result<StatsSample, RuntimeError> {
        // one_shot would leave the pre-sample counters empty
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };

        let mut stream = self.docker.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(sample_from_stats(&stats)),
            Some(Err(e)) => Err(map_err(id, e)),
            None => Err(RuntimeError::Api(format!("{}: no stats available", id))),
        }
    }

    async fn logs(&self, id: &str, tail: usize) -> Result<String, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = String::new();

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(msg) => logs.push_str(&msg.to_string()),
                Err(e) => return Err(map_err(id, e)),
            }
        }

        Ok(logs)
    }

    async fn inspect_volume(&self, name: &str) -> Result<VolumeInfo, RuntimeError> {
        let volume = self
            .docker
            .inspect_volume(name)
            .await
            .map_err(|e| map_err(name, e))?;

        Ok(VolumeInfo {
            name: volume.name,
            labels: volume.labels,
        })
    }

    async fn create_volume(
        &self,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            labels,
            ..Default::default()
        };

        self.docker
            .create_volume(options)
            .await
            .map_err(|e| map_err(name, e))?;

        info!("Created volume: {}", name);
        Ok(())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeInfo>, RuntimeError> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await
            .map_err(|e| map_err("list volumes", e))?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeInfo {
                name: v.name,
                labels: v.labels,
            })
            .collect())
    }

    async fn remove_volume(&self, name: &str, force: bool) -> Result<(), RuntimeError> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await
            .map_err(|e| map_err(name, e))?;

        info!("Removed volume: {}", name);
        Ok(())
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(reference).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(map_err(reference, e)),
        }
    }

    fn build_image<'a>(
        &'a self,
        tag: &'a str,
        context: Vec<u8>,
    ) -> BoxStream<'a, Result<BuildOutput, RuntimeError>> {
        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: tag.to_string(),
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        self.docker
            .build_image(options, None, Some(context.into()))
            .filter_map(move |item| {
                let output = match item {
                    Ok(info) => {
                        if let Some(error) = info.error {
                            Some(Ok(BuildOutput::Error(error)))
                        } else {
                            info.stream
                                .or(info.status)
                                .map(|line| line.trim().to_string())
                                .filter(|line| !line.is_empty())
                                .map(|line| Ok(BuildOutput::Progress(line)))
                        }
                    }
                    Err(e) => {
                        debug!("Build stream error for {}: {}", tag, e);
                        Some(Err(map_err(tag, e)))
                    }
                };
                future::ready(output)
            })
            .boxed()
    }
}
