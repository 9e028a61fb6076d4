use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::runtime::{BuildOutput, ContainerRuntime, RuntimeError};
use super::WorkspaceEvent;
use crate::error::{OrchestratorError, Result};

pub const DEFAULT_BASE_IMAGE: &str = "codercom/code-server:latest";
const SYSTEM_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const EDITOR_USER: &str = "coder";
const EDITOR_HOME: &str = "/home/coder";

/// A toolchain image layered on the editor base image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    pub base_image: String,
    /// Toolchain root/path/bin variables, exported to the image and the container.
    pub env: BTreeMap<String, String>,
    /// Run as root, joined into one layer.
    pub setup_steps: Vec<String>,
    /// Run as the editor user once the environment is in place.
    pub verify_steps: Vec<String>,
}

impl BuildSpec {
    pub fn go(base_image: &str) -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            format!("/usr/local/go/bin:{EDITOR_HOME}/go/bin:{EDITOR_HOME}/.local/bin:{SYSTEM_PATH}"),
        );
        env.insert("GOROOT".to_string(), "/usr/local/go".to_string());
        env.insert("GOPATH".to_string(), format!("{EDITOR_HOME}/go"));
        env.insert("GOBIN".to_string(), format!("{EDITOR_HOME}/go/bin"));

        Self {
            base_image: base_image.to_string(),
            env,
            setup_steps: vec![
                "apt-get update".to_string(),
                "apt-get install -y --no-install-recommends wget ca-certificates git curl".to_string(),
                "wget -q https://golang.org/dl/go1.21.0.linux-amd64.tar.gz".to_string(),
                "rm -rf /usr/local/go && tar -C /usr/local -xzf go1.21.0.linux-amd64.tar.gz".to_string(),
                "rm go1.21.0.linux-amd64.tar.gz".to_string(),
                format!("mkdir -p {EDITOR_HOME}/go/bin {EDITOR_HOME}/go/pkg {EDITOR_HOME}/go/src"),
                format!("chown -R {EDITOR_USER}:{EDITOR_USER} {EDITOR_HOME}/go"),
                "rm -rf /var/lib/apt/lists/*".to_string(),
            ],
            verify_steps: vec!["which go".to_string(), "go version".to_string()],
        }
    }

    pub fn rust(base_image: &str) -> Self {
        let mut env = BTreeMap::new();
        env.insert(
            "PATH".to_string(),
            format!("{EDITOR_HOME}/.cargo/bin:{EDITOR_HOME}/.local/bin:{SYSTEM_PATH}"),
        );
        env.insert("CARGO_HOME".to_string(), format!("{EDITOR_HOME}/.cargo"));
        env.insert("RUSTUP_HOME".to_string(), format!("{EDITOR_HOME}/.rustup"));

        Self {
            base_image: base_image.to_string(),
            env,
            setup_steps: vec![
                "apt-get update".to_string(),
                "apt-get install -y --no-install-recommends ca-certificates curl git build-essential"
                    .to_string(),
                "curl --proto =https --tlsv1.2 -sSf https://sh.rustup.rs | sh -s -- -y --no-modify-path --profile minimal"
                    .to_string(),
                format!("chown -R {EDITOR_USER}:{EDITOR_USER} {EDITOR_HOME}/.cargo {EDITOR_HOME}/.rustup"),
                "rm -rf /var/lib/apt/lists/*".to_string(),
            ],
            verify_steps: vec!["rustc --version".to_string(), "cargo --version".to_string()],
        }
    }

    pub fn render_dockerfile(&self) -> String {
        let mut lines = vec![format!("FROM {}", self.base_image), String::new(), "USER root".to_string()];

        for (key, value) in &self.env {
            lines.push(format!("ENV {}={}", key, value));
        }

        if !self.setup_steps.is_empty() {
            let mut steps = vec!["set -ex".to_string()];
            steps.extend(self.setup_steps.iter().cloned());
            lines.push(format!("RUN {}", steps.join(" && \\\n    ")));
        }

        // Login shells in the editor terminal read these instead of the image env
        if !self.env.is_empty() {
            let exports: Vec<String> = self
                .env
                .iter()
                .flat_map(|(key, value)| {
                    let export = format!("export {}={}", key, value);
                    [
                        format!("echo '{}' >> /etc/profile", export),
                        format!("echo '{}' >> {}/.bashrc", export, EDITOR_HOME),
                    ]
                })
                .collect();
            lines.push(format!("RUN {}", exports.join(" && \\\n    ")));
        }

        lines.push(format!("USER {}", EDITOR_USER));

        if !self.verify_steps.is_empty() {
            lines.push(format!(
                "RUN bash -c 'source /etc/profile && {}'",
                self.verify_steps.join(" && ")
            ));
        }

        lines.push(String::new());
        lines.join("\n")
    }
}

/// Image reference a workspace runs, with the environment its toolchain needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub reference: String,
    pub env: BTreeMap<String, String>,
}

/// Maps languages to images, building toolchain images on first use.
pub struct ImageResolver {
    base_image: String,
    recipes: HashMap<String, BuildSpec>,
    build_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ImageResolver {
    pub fn new(base_image: &str) -> Self {
        Self {
            base_image: base_image.to_string(),
            recipes: HashMap::new(),
            build_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolver with the built-in `go` and `rust` recipes.
    pub fn with_defaults(base_image: &str) -> Self {
        let mut resolver = Self::new(base_image);
        resolver.register("go", BuildSpec::go(base_image));
        resolver.register("rust", BuildSpec::rust(base_image));
        resolver
    }

    pub fn register(&mut self, language: &str, spec: BuildSpec) {
        self.recipes.insert(language.to_lowercase(), spec);
    }

    pub fn recipe(&self, language: &str) -> Option<&BuildSpec> {
        self.recipes.get(&language.to_lowercase())
    }

    pub fn tag_for(language: &str) -> String {
        format!("ide-{}:latest", language.to_lowercase())
    }

    pub async fn resolve(
        &self,
        runtime: &dyn ContainerRuntime,
        language: &str,
        events: Option<&mpsc::UnboundedSender<WorkspaceEvent>>,
    ) -> Result<ResolvedImage> {
        let Some(spec) = self.recipe(language) else {
            return Ok(ResolvedImage {
                reference: self.base_image.clone(),
                env: BTreeMap::new(),
            });
        };
        let tag = Self::tag_for(language);
        let resolved = ResolvedImage {
            reference: tag.clone(),
            env: spec.env.clone(),
        };

        if runtime.image_exists(&tag).await? {
            debug!("Found existing image {}", tag);
            return Ok(resolved);
        }

        let lock = self.build_lock(&tag);
        let _guard = lock.lock().await;

        // A concurrent resolve may have finished the build while we waited
        if runtime.image_exists(&tag).await? {
            info!("Image {} was built by a concurrent request", tag);
            return Ok(resolved);
        }

        self.run_build(runtime, &tag, spec, events).await?;
        Ok(resolved)
    }

    /// Builds the language's image even when the tag already exists.
    pub async fn rebuild(
        &self,
        runtime: &dyn ContainerRuntime,
        language: &str,
        events: Option<&mpsc::UnboundedSender<WorkspaceEvent>>,
    ) -> Result<ResolvedImage> {
        let Some(spec) = self.recipe(language) else {
            info!("Language {} uses the base image, nothing to build", language);
            return Ok(ResolvedImage {
                reference: self.base_image.clone(),
                env: BTreeMap::new(),
            });
        };
        let tag = Self::tag_for(language);

        let lock = self.build_lock(&tag);
        let _guard = lock.lock().await;
        self.run_build(runtime, &tag, spec, events).await?;

        Ok(ResolvedImage {
            reference: tag,
            env: spec.env.clone(),
        })
    }

    fn build_lock(&self, tag: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .build_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(tag.to_string()).or_default().clone()
    }

    async fn run_build(
        &self,
        runtime: &dyn ContainerRuntime,
        tag: &str,
        spec: &BuildSpec,
        events: Option<&mpsc::UnboundedSender<WorkspaceEvent>>,
    ) -> Result<()> {
        let dockerfile = spec.render_dockerfile();
        info!("Building image {}", tag);
        debug!("Dockerfile for {}:\n{}", tag, dockerfile);

        let context = build_context(&dockerfile).map_err(|e| OrchestratorError::ImageBuildFailed {
            tag: tag.to_string(),
            message: format!("failed to package build context: {}", e),
        })?;

        let mut stream = runtime.build_image(tag, context);
        while let Some(item) = stream.next().await {
            match item {
                Ok(BuildOutput::Progress(line)) => {
                    debug!("[{}] {}", tag, line);
                    if let Some(events) = events {
                        let _ = events.send(WorkspaceEvent::BuildProgress {
                            tag: tag.to_string(),
                            line,
                        });
                    }
                }
                Ok(BuildOutput::Error(message)) => {
                    error!("Build of {} failed: {}", tag, message);
                    return Err(OrchestratorError::ImageBuildFailed {
                        tag: tag.to_string(),
                        message,
                    });
                }
                Err(RuntimeError::Unavailable(reason)) => {
                    error!("Runtime went away while building {}: {}", tag, reason);
                    return Err(OrchestratorError::RuntimeUnavailable);
                }
                Err(e) => {
                    error!("Build of {} failed: {}", tag, e);
                    return Err(OrchestratorError::ImageBuildFailed {
                        tag: tag.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
        drop(stream);

        if !runtime.image_exists(tag).await? {
            return Err(OrchestratorError::ImageBuildFailed {
                tag: tag.to_string(),
                message: "build finished but the image was not found".to_string(),
            });
        }

        info!("Successfully built image {}", tag);
        Ok(())
    }
}

/// Tar archive holding a single `Dockerfile`.
fn build_context(dockerfile: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", dockerfile.as_bytes())?;
    builder.into_inner()
}
