//! turndownd — the cluster turndown daemon.
//!
//! Single binary that assembles the turndown subsystems:
//! - Kubernetes client and cloud provider detection
//! - Compute provider adapter (GKE, EKS or self-managed AWS)
//! - Turndown strategy and manager
//! - Schedule store (redb) and scheduler loop
//! - HTTP control surface
//!
//! # Usage
//!
//! ```text
//! turndownd run --node-name $NODE_NAME --data-dir /var/configs
//! turndownd detect
//! ```

mod cli;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use turndown_api::{ApiState, build_router};
use turndown_manager::{AgentHost, TurndownManager, strategy_for};
use turndown_provider::{
    ComputeProvider, KubeApiClient, KubeClient, MetadataClient, PollPolicy, Provider,
    ProviderSettings, detect,
};
use turndown_scheduler::TurndownScheduler;
use turndown_state::StateStore;

use crate::cli::{Cli, Command, RunArgs};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,turndownd=debug,turndown=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Detect => {
            let (kube, metadata) = connect_cluster().await?;
            let kind = detect(metadata.on_gce().await, kube.as_ref()).await?;
            println!("{kind}");
            Ok(())
        }
    }
}

/// Kubernetes client and metadata source. Failure here is fatal.
async fn connect_cluster() -> anyhow::Result<(Arc<dyn KubeClient>, MetadataClient)> {
    let kube = KubeApiClient::try_default()
        .await
        .context("no usable Kubernetes client")?;
    let metadata = MetadataClient::from_env()?;
    Ok((Arc::new(kube), metadata))
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    let node_name = config
        .agent
        .node_name
        .clone()
        .context("node name is required (--node-name or NODE_NAME)")?;
    info!(node = %node_name, "cluster turndown starting");

    // ── Provider ───────────────────────────────────────────────

    let (kube, metadata) = connect_cluster().await?;
    let kind = detect(metadata.on_gce().await, kube.as_ref())
        .await
        .context("cloud provider detection failed")?;
    info!(provider = %kind, "cloud provider detected");

    let poll = PollPolicy::new(config.poll_interval()?, config.poll_timeout()?);
    let settings = ProviderSettings::from_config(&config, node_name.clone(), poll);
    let provider: Arc<dyn ComputeProvider> =
        Arc::new(Provider::connect(kind, kube.clone(), metadata, settings).await?);

    // ── Manager and scheduler ──────────────────────────────────

    let strategy = strategy_for(provider, kube, poll);
    info!(strategy = strategy.name(), "turndown strategy selected");

    std::fs::create_dir_all(&config.storage.data_dir)?;
    let store_path = config.store_path();
    let store = StateStore::open(&store_path)?;
    info!(path = ?store_path, "state store opened");

    let host = AgentHost {
        node_name,
        namespace: config.agent.namespace.clone(),
        deployment: config.agent.deployment.clone(),
    };
    let manager = Arc::new(TurndownManager::new(strategy, store.clone(), host)?);
    info!(phase = %manager.phase(), "turndown manager initialized");

    let scheduler = Arc::new(TurndownScheduler::new(store.clone(), manager));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let interval = config.check_interval()?;
    let scheduler_handle = tokio::spawn(scheduler.clone().run(interval, shutdown_rx));

    // ── Control surface ────────────────────────────────────────

    let router = build_router(ApiState {
        store,
        scheduler,
        provider: kind,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "control surface listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = scheduler_handle.await;

    info!("cluster turndown stopped");
    Ok(())
}
