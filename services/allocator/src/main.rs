//! frost allocator
//!
//! Request-oriented control plane service: turns a job request into a
//! bound container by claiming a frozen pool member, thawing it, pushing
//! the setup script, and handing back the instance name. Tears the
//! container down when the job completes.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use frost_allocator::{cache_refresh, config, metrics, server::AllocatorService};
use frost_proto::allocator::v1::AllocatorServer;
use frost_store::{Memory, RedisStore, ResourceCache, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(config::Config::from_env()?);

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting frost allocator");
    metrics::install_lxd_observer();

    let store: Arc<dyn Store> = if config.cluster_enable {
        info!(hosts = ?config.redis_hosts, "cluster mode enabled, using redis store");
        Arc::new(
            RedisStore::connect(&config.redis_hosts)
                .await
                .map_err(|e| anyhow::anyhow!("connect redis: {e}"))?,
        )
    } else {
        Arc::new(Memory::new())
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let refresh_handle = tokio::spawn(cache_refresh::run(
        config.clone(),
        ResourceCache::new(store.clone()),
        shutdown_rx,
    ));

    tokio::spawn(metrics::serve(config.metrics_port));

    let service = AllocatorService::new(config.clone(), store);
    let addr = format!("0.0.0.0:{}", config.listen_port).parse()?;
    info!(addr = %addr, "listening for gRPC");

    tonic::transport::Server::builder()
        .add_service(AllocatorServer::new(service))
        .serve_with_shutdown(addr, shutdown_signal())
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = refresh_handle.await;

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
