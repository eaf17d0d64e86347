use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cacheplane::cli::{format_startup, Args};
use cacheplane::cluster::{ClusterSeed, InMemoryCluster};
use cacheplane::config::{default_config_path, load_config_file, load_seed_file, ControllerConfig};
use cacheplane::engine::EngineContext;
use cacheplane::placement::NodePlacementLabeler;
use cacheplane::ports::{PortAllocatorHandle, ValuesConfigMapScanner};
use cacheplane::reconciler::{spawn_reconciler, Reconciler};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified
    if let Some(ref env_file) = args.env_file {
        if let Err(e) = dotenvy::from_path(env_file) {
            error!("Failed to load env file {}: {}", env_file.display(), e);
            process::exit(1);
        }
    }

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<ControllerConfig> {
    let config = match &args.config {
        Some(path) => load_config_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => {
            let path = default_config_path();
            if path.exists() {
                load_config_file(&path)
                    .with_context(|| format!("Failed to load config file {}", path.display()))?
            } else {
                ControllerConfig::default()
            }
        }
    };
    Ok(args.apply_overrides(config))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    info!("{}", format_startup(&config, &args).trim_end());

    let seed = match &args.seed {
        Some(path) => load_seed_file(path)
            .with_context(|| format!("Failed to load seed file {}", path.display()))?,
        None => {
            warn!("No seed file given, starting with an empty cluster");
            ClusterSeed::default()
        }
    };
    let cluster = Arc::new(InMemoryCluster::from_seed(seed).with_simulated_scheduler());

    // Reserved ports come from the values of runtimes that already exist
    let ports = Arc::new(PortAllocatorHandle::new().with_seed(config.port_allocation_seed));
    ports
        .setup(
            config.port_range,
            config.port_allocation_strategy,
            &ValuesConfigMapScanner::new(cluster.clone()),
        )
        .await
        .context("Failed to set up the port allocator")?;

    let labeler =
        NodePlacementLabeler::new(cluster.clone()).with_retry(config.label_retry_policy());
    let ctx = EngineContext::new(cluster.clone(), cluster.clone(), ports)
        .with_labeler(labeler)
        .with_settings(config.engine_settings());
    let reconciler = Reconciler::new(ctx);

    if args.once {
        let summary = reconciler.reconcile_all().await?;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let shutdown = spawn_reconciler(reconciler, config.reconciler_config());
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("Shutting down");
    let _ = shutdown.send(());
    Ok(())
}
