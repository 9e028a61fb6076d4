use async_trait::async_trait;
use bollard::{Docker, API_DEFAULT_VERSION};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::client::DockerClient;
use super::runtime::{ContainerRuntime, RuntimeError};
use crate::error::OrchestratorError;

/// A way of reaching the runtime daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// Platform default socket, honouring `DOCKER_HOST`.
    LocalDefaults,
    NamedPipe(String),
    Tcp(String),
}

impl Transport {
    /// Default, then named pipe, then TCP.
    pub fn default_candidates(tcp_fallback: &str) -> Vec<Transport> {
        vec![
            Transport::LocalDefaults,
            Transport::NamedPipe("//./pipe/docker_engine".to_string()),
            Transport::Tcp(tcp_fallback.to_string()),
        ]
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::LocalDefaults => write!(f, "local defaults"),
            Transport::NamedPipe(path) => write!(f, "named pipe {}", path),
            Transport::Tcp(addr) => write!(f, "tcp {}", addr),
        }
    }
}

/// Opens a (not yet verified) runtime handle over one transport.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn open(
        &self,
        transport: &Transport,
        timeout: Duration,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError>;
}

pub struct DockerFactory;

#[async_trait]
impl RuntimeFactory for DockerFactory {
    async fn open(
        &self,
        transport: &Transport,
        timeout: Duration,
    ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let docker = match transport {
            Transport::LocalDefaults => Docker::connect_with_local_defaults(),
            Transport::NamedPipe(path) => connect_named_pipe(path, timeout)?,
            Transport::Tcp(addr) => {
                Docker::connect_with_http(addr, timeout.as_secs(), API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(Arc::new(DockerClient::new(docker.with_timeout(timeout))))
    }
}

#[cfg(windows)]
fn connect_named_pipe(
    path: &str,
    timeout: Duration,
) -> Result<Result<Docker, bollard::errors::Error>, RuntimeError> {
    Ok(Docker::connect_with_named_pipe(path, timeout.as_secs(), API_DEFAULT_VERSION))
}

#[cfg(not(windows))]
fn connect_named_pipe(
    path: &str,
    _timeout: Duration,
) -> Result<Result<Docker, bollard::errors::Error>, RuntimeError> {
    Err(RuntimeError::Unavailable(format!(
        "named pipe {} is only supported on Windows",
        path
    )))
}

/// Owns the shared runtime connection.
///
/// The first call after a failure reconnects; concurrent callers wait on the
/// same attempt instead of starting their own.
pub struct RuntimeConnector {
    factory: Arc<dyn RuntimeFactory>,
    candidates: Vec<Transport>,
    timeout: Duration,
    current: RwLock<Option<Arc<dyn ContainerRuntime>>>,
    available: AtomicBool,
}

impl RuntimeConnector {
    pub fn new(factory: Arc<dyn RuntimeFactory>, candidates: Vec<Transport>, timeout: Duration) -> Self {
        Self {
            factory,
            candidates,
            timeout,
            current: RwLock::new(None),
            available: AtomicBool::new(false),
        }
    }

    pub fn docker(candidates: Vec<Transport>, timeout: Duration) -> Self {
        Self::new(Arc::new(DockerFactory), candidates, timeout)
    }

    /// Wraps an already connected runtime.
    pub fn with_runtime(runtime: Arc<dyn ContainerRuntime>) -> Self {
        struct Fixed(Arc<dyn ContainerRuntime>);

        #[async_trait]
        impl RuntimeFactory for Fixed {
            async fn open(
                &self,
                _transport: &Transport,
                _timeout: Duration,
            ) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
                Ok(self.0.clone())
            }
        }

        Self::new(
            Arc::new(Fixed(runtime)),
            vec![Transport::LocalDefaults],
            Duration::from_secs(5),
        )
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub async fn runtime(&self) -> Result<Arc<dyn ContainerRuntime>, OrchestratorError> {
        if let Some(runtime) = self.current.read().await.as_ref() {
            return Ok(runtime.clone());
        }

        let mut current = self.current.write().await;
        if let Some(runtime) = current.as_ref() {
            return Ok(runtime.clone());
        }

        for (i, transport) in self.candidates.iter().enumerate() {
            info!("Trying runtime connection method {} ({})", i + 1, transport);
            match self.try_connect(transport).await {
                Ok(runtime) => {
                    info!("Runtime connection established via {}", transport);
                    *current = Some(runtime.clone());
                    self.available.store(true, Ordering::SeqCst);
                    return Ok(runtime);
                }
                Err(e) => warn!("Connection method {} failed: {}", i + 1, e),
            }
        }

        self.available.store(false, Ordering::SeqCst);
        warn!("All runtime connection methods failed, container management disabled");
        Err(OrchestratorError::RuntimeUnavailable)
    }

    async fn try_connect(&self, transport: &Transport) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
        let attempt = async {
            let runtime = self.factory.open(transport, self.timeout).await?;
            runtime.ping().await?;
            Ok(runtime)
        };

        tokio::time::timeout(self.timeout, attempt)
            .await
            .map_err(|_| RuntimeError::Unavailable(format!("{} timed out", transport)))?
    }

    /// Drops the cached connection so the next call reconnects.
    pub async fn invalidate(&self) {
        let mut current = self.current.write().await;
        if current.take().is_some() {
            warn!("Runtime connection lost, will reconnect on next use");
        }
        self.available.store(false, Ordering::SeqCst);
    }
}
