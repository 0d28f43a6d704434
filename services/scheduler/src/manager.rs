//! Background loops: host snapshot refresh and the reservation janitor.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use frost_lxd::{connect_host, scrape_host, HostConfigMap};
use frost_store::{ResourceCache, Store, DEFAULT_SNAPSHOT_TTL};

use crate::metrics;
use crate::reservations;

/// How often the janitor rewrites the reservation lists.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

pub struct ResourceManager {
    hosts: Arc<HostConfigMap>,
    cache: ResourceCache,
    store: Arc<dyn Store>,
    interval: Duration,
}

impl ResourceManager {
    pub fn new(hosts: Arc<HostConfigMap>, store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            hosts,
            cache: ResourceCache::new(store.clone()),
            store,
            interval,
        }
    }

    /// Run until shutdown: scrape every host into the store on a fixed
    /// interval, and sweep stale reservations every 30 s.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "starting resource manager"
        );

        self.update_all().await;

        let mut refresh = tokio::time::interval(self.interval);
        refresh.tick().await;
        let mut janitor = tokio::time::interval(JANITOR_INTERVAL);
        janitor.tick().await;

        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    self.update_all().await;
                }
                _ = janitor.tick() => {
                    match reservations::sweep(&self.store).await {
                        Ok(0) => debug!("no stale reservations found"),
                        Ok(cleaned) => info!(cleaned, "swept stale reservations"),
                        Err(e) => warn!(error = %e, "reservation sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("resource manager shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn update_all(&self) {
        debug!("updating all host snapshots");

        let configs = self.hosts.all();
        let results = join_all(configs.iter().map(|config| {
            let cache = self.cache.clone();
            async move {
                let host = match connect_host(config).await {
                    Ok(host) => host,
                    Err(e) => {
                        warn!(host = %config.host, error = %e, "failed to connect host");
                        return Err(());
                    }
                };
                let (resource, _) = match scrape_host(host.client.as_ref(), &config.host).await {
                    Ok(scraped) => scraped,
                    Err(e) => {
                        warn!(host = %config.host, error = %e, "failed to scrape host");
                        return Err(());
                    }
                };
                metrics::record_host(&config.host, &resource);
                if let Err(e) = cache
                    .set_snapshot(&config.host, &resource, DEFAULT_SNAPSHOT_TTL)
                    .await
                {
                    warn!(host = %config.host, error = %e, "failed to store snapshot");
                    return Err(());
                }
                Ok(())
            }
        }))
        .await;

        let refreshed = results.iter().filter(|r| r.is_ok()).count();
        debug!(refreshed, total = configs.len(), "finished updating host snapshots");
    }
}
