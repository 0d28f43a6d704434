//! Periodic snapshot refresh.
//!
//! Only hosts whose cache entry is missing or expired get scraped; live
//! entries are left to the scheduler's own refresh loop. After each pass
//! the fleet-wide metric families are rebuilt from the cache.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use frost_lxd::{connect_hosts, scrape_host, HostConfig};
use frost_store::{ResourceCache, DEFAULT_SNAPSHOT_TTL};

use crate::config::Config;
use crate::metrics;

pub async fn run(config: Arc<Config>, cache: ResourceCache, mut shutdown: watch::Receiver<bool>) {
    info!(
        period_secs = config.cache_period.as_secs(),
        "starting snapshot refresh loop"
    );

    let mut ticker = tokio::time::interval(config.cache_period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh_once(&config, &cache).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("snapshot refresh loop shutting down");
                    return;
                }
            }
        }
    }
}

async fn refresh_once(config: &Config, cache: &ResourceCache) {
    let cached: HashSet<String> = match cache.list_snapshots().await {
        Ok(snapshots) => snapshots.into_iter().map(|(host, _)| host).collect(),
        Err(e) => {
            warn!(error = %e, "failed to list cached snapshots");
            return;
        }
    };

    let uncached: Vec<HostConfig> = config
        .hosts
        .all()
        .into_iter()
        .filter(|c| !cached.contains(&c.host))
        .collect();

    if !uncached.is_empty() {
        debug!(count = uncached.len(), "refreshing uncached hosts");
        let (hosts, errors) = connect_hosts(&uncached).await;
        metrics::record_connect_errors(&errors);

        for host in hosts {
            let (resource, _) = match scrape_host(host.client.as_ref(), &host.config.host).await {
                Ok(scraped) => scraped,
                Err(e) => {
                    warn!(host = %host.config.host, error = %e, "failed to scrape host");
                    continue;
                }
            };
            if let Err(e) = cache
                .set_snapshot(&host.config.host, &resource, DEFAULT_SNAPSHOT_TTL)
                .await
            {
                warn!(host = %host.config.host, error = %e, "failed to store snapshot");
            }
        }
    }

    match cache.list_snapshots().await {
        Ok(snapshots) => metrics::record_fleet(&snapshots),
        Err(e) => warn!(error = %e, "failed to rebuild fleet metrics"),
    }
}
