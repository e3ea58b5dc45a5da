//! helmsman: converge a file-backed live system to a directory of object
//! definitions, in the order given by a dependency manifest.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use helmsman::{
    AuditLogger, Controller, ControllerConfig, DirectoryRenderer, Engine, EngineConfig,
    FileManifestSource, FsLiveSystem, OwnerRef, PropagationPolicy, ReadinessRegistry,
    ReconcileResult, cancel,
};

/// helmsman reconciliation engine
#[derive(Parser, Debug)]
#[command(name = "helmsman", version, about)]
struct Args {
    /// Directory with desired object definitions (*.yaml, *.yml, *.json)
    #[arg(long)]
    objects: PathBuf,

    /// Dependency manifest (YAML)
    #[arg(long)]
    manifest: PathBuf,

    /// State directory of the file-backed live system
    #[arg(long, default_value = "/var/lib/helmsman")]
    state_dir: PathBuf,

    /// Owner of the managed objects, as Kind/name
    #[arg(long)]
    owner: OwnerRef,

    /// Maximum number of objects reconciled concurrently
    #[arg(long, default_value = "5")]
    concurrency: usize,

    /// Requeue delay in seconds while objects are not ready
    #[arg(long, default_value = "10")]
    requeue_secs: u64,

    /// Deletion propagation for pruned objects
    #[arg(long, value_enum, default_value = "foreground")]
    propagation: PropagationPolicy,

    /// Resync interval in seconds once converged
    #[arg(long, default_value = "300")]
    resync_secs: u64,

    /// Run a single pass and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helmsman=info,audit=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting helmsman for {}", args.owner);
    info!("Objects: {}", args.objects.display());
    info!("State directory: {}", args.state_dir.display());

    let live = FsLiveSystem::open(&args.state_dir)
        .await
        .with_context(|| format!("Failed to open state directory {}", args.state_dir.display()))?;

    let engine = Engine::new(
        Arc::new(DirectoryRenderer::new(&args.objects)),
        Arc::new(FileManifestSource::new(&args.manifest)),
        Arc::new(live),
        ReadinessRegistry::kubernetes(),
        EngineConfig {
            concurrency: args.concurrency,
            not_ready_requeue: Duration::from_secs(args.requeue_secs),
            propagation: args.propagation,
        },
    )
    .with_audit(AuditLogger::new());

    let controller = Controller::new(
        Arc::new(engine),
        ControllerConfig {
            resync_interval: Duration::from_secs(args.resync_secs),
            ..Default::default()
        },
    );

    let (handle, token) = cancel::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl-C, finishing running tasks");
            handle.cancel();
        }
    });

    if args.once {
        match controller.run_once(&args.owner, &token).await? {
            ReconcileResult::Converged => info!("All objects ready"),
            ReconcileResult::PartiallyReady { pending, .. } => {
                for p in &pending {
                    info!("Pending {}: {}", p.object, p.reason);
                }
            }
        }
        return Ok(());
    }

    controller.run(&args.owner, token).await;
    Ok(())
}
