//! SnapMesh snapshot metadata node tool
//!
//! Opens the node's snapshot metadata store and runs one control-plane
//! operation against it: exporting the handshake payload, reconciling with a
//! peer's payload, replaying missed operations or evaluating quorum.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use snapmesh_common::config::ServiceManagerKind;
use snapmesh_common::{Config, NodeId};
use snapmesh_meta_store::MetaStore;
use snapmesh_snapshot::{
    BackendRegistry, NoopController, ServiceController, SnapshotNode, SystemdController,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "snapmesh-meta")]
#[command(about = "SnapMesh snapshot metadata node tool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/snapmesh/snapmesh.toml")]
    config: String,

    /// Node ID (UUID), overrides the persisted one
    #[arg(long, env = "SNAPMESH_NODE_ID")]
    node_id: Option<String>,

    /// Data directory holding the metadata store
    #[arg(long)]
    data_dir: Option<String>,

    /// Server quorum ratio in percent
    #[arg(long)]
    server_quorum_ratio: Option<u32>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write this node's handshake payload
    Export {
        /// Output file, stdout if omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Emit the flat key-value layout instead of the typed form
        #[arg(long)]
        flat: bool,
    },
    /// Reconcile with a peer's handshake payload
    Reconcile {
        /// Peer payload (typed or flat JSON)
        #[arg(long)]
        peer: PathBuf,
    },
    /// Replay this node's pending missed operations
    Replay,
    /// Start or stop local snapshot bricks to match their volumes
    RestartBricks,
    /// List snapshots
    List,
    /// Show the missed-operation log
    Missed,
    /// Evaluate the quorum gate
    Quorum {
        /// Reachability snapshot (JSON)
        #[arg(long)]
        view: PathBuf,
        /// Volume definitions (JSON), one per file
        #[arg(long)]
        volume: Vec<PathBuf>,
        /// Operation to check
        #[arg(long, value_enum, default_value = "create")]
        op: OpArg,
        /// Check a forced create
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OpArg {
    Create,
    Clone,
    Delete,
    Restore,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load config file if it exists
    let mut config: Config = if std::path::Path::new(&args.config).exists() {
        let config_str = std::fs::read_to_string(&args.config)
            .with_context(|| format!("Failed to read {}", args.config))?;
        toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file {}", args.config))?
    } else {
        Config::default()
    };

    // Merge CLI args with config file (CLI takes precedence)
    if let Some(node_id) = args.node_id {
        config.node.id = Some(node_id);
    }
    if let Some(data_dir) = args.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(ratio) = args.server_quorum_ratio {
        config.quorum.server_quorum_ratio = Some(ratio);
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Config file: {}", args.config);
    info!("Data directory: {}", config.node.data_dir.display());

    std::fs::create_dir_all(&config.node.data_dir).with_context(|| {
        format!(
            "Failed to create data directory {}",
            config.node.data_dir.display()
        )
    })?;
    let store = Arc::new(MetaStore::open(config.node.data_dir.join("meta.redb"))?);
    let node_id = resolve_node_id(&config, &store)?;
    info!("Node ID: {}", node_id);

    let services: Arc<dyn ServiceController> = match config.services.controller {
        ServiceManagerKind::Systemd => {
            Arc::new(SystemdController::new(config.node.data_dir.join("vols")))
        }
        ServiceManagerKind::None => Arc::new(NoopController),
    };
    let backends = BackendRegistry::with_system_backends(config.snapshot.default_backend);
    let node = Arc::new(SnapshotNode::open(
        node_id, &config, store, backends, services,
    )?);

    match args.command {
        Commands::Export { output, flat } => commands::export(&node, output.as_deref(), flat),
        Commands::Reconcile { peer } => commands::reconcile(node, &peer).await,
        Commands::Replay => commands::replay(node).await,
        Commands::RestartBricks => commands::restart_bricks(node).await,
        Commands::List => {
            commands::list(&node);
            Ok(())
        }
        Commands::Missed => {
            commands::missed(&node);
            Ok(())
        }
        Commands::Quorum {
            view,
            volume,
            op,
            force,
        } => commands::quorum(&config, &view, &volume, op.into_snapshot_op(force)),
    }
}

impl OpArg {
    const fn into_snapshot_op(self, force: bool) -> snapmesh_quorum::SnapshotOp {
        use snapmesh_quorum::SnapshotOp;
        match self {
            Self::Create => SnapshotOp::Create { force },
            Self::Clone => SnapshotOp::Clone,
            Self::Delete => SnapshotOp::Delete,
            Self::Restore => SnapshotOp::Restore,
        }
    }
}

/// Node ID from config, else the persisted one, else a new persisted one
fn resolve_node_id(config: &Config, store: &MetaStore) -> Result<NodeId> {
    if let Some(id) = &config.node.id {
        let node_id: NodeId = id
            .parse()
            .with_context(|| format!("Invalid node id {id}"))?;
        store.put_node_id(node_id)?;
        return Ok(node_id);
    }
    if let Some(node_id) = store.load_node_id()? {
        return Ok(node_id);
    }
    let node_id = NodeId::new();
    info!("Generated new node ID {}", node_id);
    store.put_node_id(node_id)?;
    Ok(node_id)
}
