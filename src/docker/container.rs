use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

use super::archive::PROJECT_DIR;
use super::image::ResolvedImage;
use super::runtime::{Bind, ContainerSpec, HealthCheck};
use crate::models::{container_name, volume_name, WorkspaceHandle};

pub const SERVICE_PORT: u16 = 8080;
pub const CPU_PERIOD: i64 = 100_000;
pub const SSH_MOUNT: &str = "/home/coder/.ssh";
pub const RESTART_POLICY: &str = "unless-stopped";

pub const LABEL_MANAGED: &str = "workspace.managed";
pub const LABEL_WORKSPACE: &str = "workspace.id";
pub const LABEL_OWNER: &str = "workspace.owner";

/// Host-wide settings shared by every workspace container.
#[derive(Debug, Clone)]
pub struct ContainerTemplate {
    /// Host SSH directory, bind-mounted read-only when it exists.
    pub ssh_dir: Option<PathBuf>,
    pub service_port: u16,
    pub cpu_period: i64,
}

impl ContainerTemplate {
    pub fn new(ssh_dir: Option<PathBuf>) -> Self {
        Self {
            ssh_dir,
            service_port: SERVICE_PORT,
            cpu_period: CPU_PERIOD,
        }
    }

    fn ssh_bind(&self) -> Option<Bind> {
        let dir = self.ssh_dir.as_ref()?;
        if !dir.is_dir() {
            debug!("SSH directory {} not present, skipping mount", dir.display());
            return None;
        }
        Some(Bind {
            source: dir.to_string_lossy().into_owned(),
            target: SSH_MOUNT.to_string(),
            read_only: true,
        })
    }

    fn health_check(&self) -> HealthCheck {
        HealthCheck {
            test: vec![
                "CMD-SHELL".to_string(),
                format!("wget -q --spider http://localhost:{} || exit 1", self.service_port),
            ],
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(3),
            retries: 3,
        }
    }

    /// Container spec for `workspace` running `image`, published on `host_port`.
    pub fn render(
        &self,
        workspace: &dyn WorkspaceHandle,
        image: &ResolvedImage,
        host_port: u16,
        password: &str,
    ) -> ContainerSpec {
        let id = workspace.id();

        let mut env = image.env.clone();
        env.insert("WORKSPACE_ID".to_string(), id.to_string());
        env.insert("PASSWORD".to_string(), password.to_string());
        env.insert("DEFAULT_WORKSPACE".to_string(), PROJECT_DIR.to_string());
        env.insert("DOCKER_USER".to_string(), workspace.owner().to_string());
        env.insert(
            "GIT_SSH_COMMAND".to_string(),
            "ssh -o StrictHostKeyChecking=no".to_string(),
        );
        env.insert("SHELL".to_string(), "/bin/bash".to_string());

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_WORKSPACE.to_string(), id.to_string());
        labels.insert(LABEL_OWNER.to_string(), workspace.owner().to_string());

        let mut binds = vec![Bind {
            source: volume_name(id),
            target: PROJECT_DIR.to_string(),
            read_only: false,
        }];
        binds.extend(self.ssh_bind());

        let limits = workspace.limits();

        ContainerSpec {
            name: container_name(id),
            image: image.reference.clone(),
            env,
            labels,
            binds,
            working_dir: PROJECT_DIR.to_string(),
            service_port: self.service_port,
            host_port,
            cpu_period: self.cpu_period,
            cpu_quota: limits.cpu_quota(self.cpu_period),
            memory_bytes: limits.memory.bytes(),
            restart_policy: RESTART_POLICY.to_string(),
            health_check: self.health_check(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceLimits, WorkspaceDescriptor};

    fn workspace() -> WorkspaceDescriptor {
        WorkspaceDescriptor {
            id: 7,
            owner: "alice".to_string(),
            language: "go".to_string(),
            limits: ResourceLimits::new(2, "4g").unwrap(),
            template_path: PathBuf::from("/srv/templates/7"),
            git_branch: None,
            git_commit: None,
        }
    }

    fn go_image() -> ResolvedImage {
        let mut env = BTreeMap::new();
        env.insert("GOROOT".to_string(), "/usr/local/go".to_string());
        ResolvedImage {
            reference: "ide-go:latest".to_string(),
            env,
        }
    }

    #[test]
    fn renders_limits_mounts_and_env() {
        let template = ContainerTemplate::new(None);
        let spec = template.render(&workspace(), &go_image(), 8007, "s3cret");

        assert_eq!(spec.name, "workspace_7");
        assert_eq!(spec.image, "ide-go:latest");
        assert_eq!(spec.host_port, 8007);
        assert_eq!(spec.service_port, 8080);
        assert_eq!(spec.cpu_period, 100_000);
        assert_eq!(spec.cpu_quota, 200_000);
        assert_eq!(spec.memory_bytes, 4 * 1024 * 1024 * 1024);
        assert_eq!(spec.restart_policy, "unless-stopped");
        assert_eq!(spec.working_dir, "/home/coder/project");

        assert_eq!(spec.binds.len(), 1);
        assert_eq!(spec.binds[0].to_spec(), "workspace-7:/home/coder/project:rw");

        assert_eq!(spec.env["WORKSPACE_ID"], "7");
        assert_eq!(spec.env["PASSWORD"], "s3cret");
        assert_eq!(spec.env["DOCKER_USER"], "alice");
        assert_eq!(spec.env["GOROOT"], "/usr/local/go");
        assert!(spec.health_check.test[1].contains("localhost:8080"));
    }

    #[test]
    fn ssh_directory_is_mounted_read_only_when_present() {
        let ssh = tempfile::tempdir().unwrap();
        let template = ContainerTemplate::new(Some(ssh.path().to_path_buf()));
        let spec = template.render(&workspace(), &go_image(), 8007, "pw");

        assert_eq!(spec.binds.len(), 2);
        assert_eq!(spec.binds[1].target, SSH_MOUNT);
        assert!(spec.binds[1].read_only);

        let missing = ContainerTemplate::new(Some(PathBuf::from("/nonexistent/.ssh")));
        assert_eq!(missing.render(&workspace(), &go_image(), 8007, "pw").binds.len(), 1);
    }
}
