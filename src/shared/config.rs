use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::docker::{OrchestratorSettings, PortPolicy, Transport, DEFAULT_BASE_IMAGE};

/// Process configuration, read from `WORKSPACE_*` environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Directory holding one template tree per workspace id.
    pub template_root: PathBuf,
    pub base_image: String,
    pub base_port: u16,
    pub port_range_end: u16,
    pub port_policy: PortPolicy,
    pub public_host: String,
    pub connect_timeout: Duration,
    pub stop_grace: Duration,
    pub port_retries: u32,
    pub tcp_fallback: String,
    pub ssh_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl OrchestratorConfig {
    /// Loads `.env` when present, then the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            template_root: get("WORKSPACE_TEMPLATE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/var/lib/workspaces/templates")),
            base_image: get("WORKSPACE_BASE_IMAGE").unwrap_or_else(|| DEFAULT_BASE_IMAGE.to_string()),
            base_port: parse(&get, "WORKSPACE_BASE_PORT", 8000)?,
            port_range_end: parse(&get, "WORKSPACE_PORT_RANGE_END", 10000)?,
            port_policy: parse(&get, "WORKSPACE_PORT_POLICY", PortPolicy::Deterministic)?,
            public_host: get("WORKSPACE_PUBLIC_HOST").unwrap_or_else(|| "localhost".to_string()),
            connect_timeout: Duration::from_secs(parse(&get, "WORKSPACE_CONNECT_TIMEOUT_SECS", 5)?),
            stop_grace: Duration::from_secs(parse(&get, "WORKSPACE_STOP_GRACE_SECS", 10)?),
            port_retries: parse(&get, "WORKSPACE_PORT_RETRIES", 5)?,
            tcp_fallback: get("WORKSPACE_DOCKER_TCP").unwrap_or_else(|| "tcp://localhost:2375".to_string()),
            ssh_dir: get("WORKSPACE_SSH_DIR")
                .map(PathBuf::from)
                .or_else(|| dirs::home_dir().map(|home| home.join(".ssh"))),
            database_url: get("DATABASE_URL"),
            log_dir: get("WORKSPACE_LOG_DIR").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.base_port >= self.port_range_end {
            return Err(anyhow!(
                "WORKSPACE_BASE_PORT ({}) must be below WORKSPACE_PORT_RANGE_END ({})",
                self.base_port,
                self.port_range_end
            ));
        }
        if self.connect_timeout.is_zero() || self.connect_timeout > Duration::from_secs(5) {
            return Err(anyhow!("WORKSPACE_CONNECT_TIMEOUT_SECS must be between 1 and 5"));
        }
        if self.port_retries == 0 {
            return Err(anyhow!("WORKSPACE_PORT_RETRIES must be at least 1"));
        }
        Ok(())
    }

    pub fn transports(&self) -> Vec<Transport> {
        Transport::default_candidates(&self.tcp_fallback)
    }

    /// Template tree for one workspace.
    pub fn template_path(&self, workspace_id: u32) -> PathBuf {
        self.template_root.join(workspace_id.to_string())
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            public_host: self.public_host.clone(),
            port_range: self.base_port..self.port_range_end,
            port_policy: self.port_policy,
            port_retries: self.port_retries,
            stop_grace: self.stop_grace,
            base_image: self.base_image.clone(),
            ssh_dir: self.ssh_dir.clone(),
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow!("{}", e))
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<OrchestratorConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrchestratorConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config(&[]).unwrap();
        assert_eq!(config.base_port, 8000);
        assert_eq!(config.port_range_end, 10000);
        assert_eq!(config.port_policy, PortPolicy::Deterministic);
        assert_eq!(config.public_host, "localhost");
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.stop_grace, Duration::from_secs(10));
        assert_eq!(config.port_retries, 5);
        assert_eq!(config.base_image, DEFAULT_BASE_IMAGE);
        assert!(config.database_url.is_none());
        assert_eq!(
            config.transports().last(),
            Some(&Transport::Tcp("tcp://localhost:2375".to_string()))
        );
    }

    #[test]
    fn reads_overrides() {
        let config = config(&[
            ("WORKSPACE_BASE_PORT", "9000"),
            ("WORKSPACE_PORT_RANGE_END", "9100"),
            ("WORKSPACE_PORT_POLICY", "Scan"),
            ("WORKSPACE_PUBLIC_HOST", "ide.example.com"),
            ("WORKSPACE_TEMPLATE_ROOT", "/srv/templates"),
            ("WORKSPACE_SSH_DIR", "/etc/workspace-ssh"),
            ("DATABASE_URL", "postgres://localhost/workspaces"),
        ])
        .unwrap();

        assert_eq!(config.port_policy, PortPolicy::Scan);
        assert_eq!(config.template_path(42), PathBuf::from("/srv/templates/42"));
        assert_eq!(config.ssh_dir, Some(PathBuf::from("/etc/workspace-ssh")));

        let settings = config.orchestrator_settings();
        assert_eq!(settings.port_range, 9000..9100);
        assert_eq!(settings.public_host, "ide.example.com");
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(config(&[("WORKSPACE_BASE_PORT", "eighty")]).is_err());
        assert!(config(&[("WORKSPACE_PORT_POLICY", "random")]).is_err());
        assert!(config(&[("WORKSPACE_BASE_PORT", "10000")]).is_err());
        assert!(config(&[("WORKSPACE_CONNECT_TIMEOUT_SECS", "30")]).is_err());
    }
}
