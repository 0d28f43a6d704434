//! frost scheduler
//!
//! Out-of-band placement service. Keeps a refreshed view of every host's
//! capacity in the shared store, answers "which host should take this
//! (cpu, memory) request" over HTTP, and tracks short-lived reservations
//! so bursts do not overcommit a single host.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use frost_scheduler::engine::Scheduler;
use frost_scheduler::manager::ResourceManager;
use frost_scheduler::{config, http};
use frost_store::{Memory, RedisStore, Store};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting frost scheduler");

    let store: Arc<dyn Store> = if config.redis_hosts.is_empty() {
        info!("using in-process store");
        Arc::new(Memory::new())
    } else {
        info!(hosts = ?config.redis_hosts, "using redis store");
        Arc::new(
            RedisStore::connect(&config.redis_hosts)
                .await
                .map_err(|e| anyhow::anyhow!("connect redis: {e}"))?,
        )
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = ResourceManager::new(config.hosts.clone(), store.clone(), config.probe_interval);
    let manager_handle = tokio::spawn(manager.run(shutdown_rx));

    let scheduler = Scheduler::new(store);
    let app = http::router(scheduler);

    let addr = format!("0.0.0.0:{}", config.listen_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = manager_handle.await;

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
