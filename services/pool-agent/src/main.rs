//! frost pool agent
//!
//! Per-host daemon that keeps a warm pool of frozen, pre-provisioned
//! runner containers. Every tick it reconciles the observed pool against
//! the declared pool size per image and resource class, creating the
//! shortfall and sweeping zombies, stale images, and disabled classes.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use frost_lxd::connect_host;
use frost_pool_agent::agent::Agent;
use frost_pool_agent::config;
use frost_pool_agent::featureflag::FeatureFlags;

#[derive(Parser)]
#[command(name = "frost-pool-agent")]
struct Args {
    /// Config file path.
    #[arg(long, default_value = "/etc/frost/pool-agent.toml")]
    config: PathBuf,

    /// Metrics textfile path.
    #[arg(
        long,
        default_value = "/var/lib/node_exporter/textfile_collector/pool_agent.prom"
    )]
    metrics: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting frost pool agent");

    let params = config::Params::from_env()?;
    let pool_config = config::Config::load(&args.config)?;
    let flags = FeatureFlags::from_env();

    let host = connect_host(&params.host)
        .await
        .context("connect to local LXD host")?;

    let agent = Arc::new(Agent::new(
        host.client,
        pool_config,
        params,
        flags,
        args.config.clone(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_agent = agent.clone();
    let metrics_shutdown = shutdown_rx.clone();
    let metrics_path = args.metrics.clone();
    let metrics_handle = tokio::spawn(async move {
        metrics_agent.run_metrics(metrics_path, metrics_shutdown).await;
    });

    let run_agent = agent.clone();
    let run_shutdown = shutdown_rx;
    let agent_handle = tokio::spawn(async move { run_agent.run(run_shutdown).await });

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    agent_handle.await??;
    metrics_handle.await?;

    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}
