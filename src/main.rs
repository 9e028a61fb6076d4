use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use workspace_orchestrator::database::PgWorkspaceStore;
use workspace_orchestrator::docker::{
    Orchestrator, RuntimeConnector, WorkspaceEvent, DEFAULT_LOG_TAIL,
};
use workspace_orchestrator::models::{
    FileWorkspaceStore, ResourceLimits, WorkspaceDescriptor, WorkspaceId, WorkspaceStore,
};
use workspace_orchestrator::shared::{init_logging, OrchestratorConfig};

#[derive(Parser)]
#[command(name = "wsctl")]
#[command(about = "Manage per-user development workspace containers", long_about = None)]
struct Cli {
    /// JSON file holding workspace records (ignored when DATABASE_URL is set)
    #[arg(long, global = true, env = "WORKSPACE_RECORDS")]
    records: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct WorkspaceArgs {
    /// Workspace id
    id: WorkspaceId,

    /// Owner passed to the container as DOCKER_USER
    #[arg(long, env = "USER", default_value = "coder")]
    owner: String,

    /// Template language; toolchain languages get a custom image
    #[arg(short, long, default_value = "python")]
    language: String,

    #[arg(long, default_value_t = 2)]
    cpus: u32,

    /// Memory limit, e.g. 4g or 512m
    #[arg(long, default_value = "4g")]
    memory: String,

    /// Source tree copied into the container (defaults to <template root>/<id>)
    #[arg(long)]
    template: Option<PathBuf>,
}

impl WorkspaceArgs {
    fn descriptor(self, config: &OrchestratorConfig) -> Result<WorkspaceDescriptor> {
        let limits = ResourceLimits::new(self.cpus, &self.memory)?;
        Ok(WorkspaceDescriptor {
            template_path: self
                .template
                .unwrap_or_else(|| config.template_path(self.id)),
            id: self.id,
            owner: self.owner,
            language: self.language,
            limits,
            git_branch: None,
            git_commit: None,
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create (or recreate) a workspace container and copy its files in
    Provision(WorkspaceArgs),

    /// Start a stopped workspace, provisioning it if its container is gone
    Start(WorkspaceArgs),

    /// Stop a workspace's container
    Stop { id: WorkspaceId },

    /// Stop and re-provision a workspace, keeping its port and password
    Restart(WorkspaceArgs),

    /// Remove a workspace's container
    Delete {
        id: WorkspaceId,

        /// Also remove the workspace volume
        #[arg(long)]
        remove_volume: bool,
    },

    /// Show workspace status, or a single container's with --container
    Status {
        #[arg(required_unless_present = "container")]
        id: Option<WorkspaceId>,

        #[arg(long, conflicts_with = "id")]
        container: Option<String>,
    },

    /// Print the tail of a container's log
    Logs {
        container_id: String,

        #[arg(short, long, default_value_t = DEFAULT_LOG_TAIL)]
        tail: usize,
    },

    /// Remove workspace volumes older than the given age
    PruneVolumes {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Build (or rebuild) the toolchain image for a language
    BuildImage { language: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open_store(config: &OrchestratorConfig, records: Option<PathBuf>) -> Result<Arc<dyn WorkspaceStore>> {
    if let Some(url) = &config.database_url {
        info!("Using PostgreSQL workspace records");
        let store = PgWorkspaceStore::connect(url)
            .await
            .context("Failed to connect to DATABASE_URL")?;
        return Ok(Arc::new(store));
    }

    let path = records.unwrap_or_else(FileWorkspaceStore::default_path);
    debug!("Using workspace records at {}", path.display());
    Ok(Arc::new(FileWorkspaceStore::new(path)))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OrchestratorConfig::from_env()?;
    let _guards = init_logging(config.log_dir.as_deref(), "wsctl")?;

    let cli = Cli::parse();

    let store = open_store(&config, cli.records).await?;
    let connector = Arc::new(RuntimeConnector::docker(
        config.transports(),
        config.connect_timeout,
    ));
    let mut orchestrator = Orchestrator::new(connector, store, config.orchestrator_settings());

    let mut events = orchestrator.subscribe();
    let event_logger = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                WorkspaceEvent::BuildProgress { tag, line } => debug!("[{}] {}", tag, line),
                WorkspaceEvent::Failed { workspace_id, reason } => {
                    error!("Workspace {} failed: {}", workspace_id, reason)
                }
                other => info!("{:?}", other),
            }
        }
    });

    let outcome = run(&orchestrator, &config, cli.command).await;

    drop(orchestrator);
    let _ = event_logger.await;

    if let Err(e) = &outcome {
        if let Some(err) = e.downcast_ref::<workspace_orchestrator::OrchestratorError>() {
            eprintln!(
                "{}",
                serde_json::json!({ "kind": err.kind(), "message": err.to_string() })
            );
            std::process::exit(1);
        }
    }
    outcome
}

async fn run(orchestrator: &Orchestrator, config: &OrchestratorConfig, command: Commands) -> Result<()> {
    match command {
        Commands::Provision(args) => {
            let workspace = args.descriptor(config)?;
            print_json(&orchestrator.provision(&workspace).await?)
        }
        Commands::Start(args) => {
            let workspace = args.descriptor(config)?;
            print_json(&orchestrator.start(&workspace).await?)
        }
        Commands::Stop { id } => print_json(&orchestrator.stop(id).await?),
        Commands::Restart(args) => {
            let workspace = args.descriptor(config)?;
            print_json(&orchestrator.restart(&workspace).await?)
        }
        Commands::Delete { id, remove_volume } => {
            print_json(&orchestrator.delete(id, remove_volume).await?)
        }
        Commands::Status { id, container } => match (id, container) {
            (_, Some(container)) => print_json(&orchestrator.status(&container).await?),
            (Some(id), None) => print_json(&orchestrator.workspace_status(id).await?),
            (None, None) => anyhow::bail!("either a workspace id or --container is required"),
        },
        Commands::Logs { container_id, tail } => {
            print!("{}", orchestrator.logs(&container_id, tail).await);
            Ok(())
        }
        Commands::PruneVolumes { days } => print_json(&orchestrator.prune_volumes(days).await?),
        Commands::BuildImage { language } => {
            let image = orchestrator.build_image(&language).await?;
            print_json(&serde_json::json!({
                "image": image.reference,
                "env": image.env,
            }))
        }
    }
}
