use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use frost_lxd::HostConfigMap;

#[derive(Clone)]
pub struct Config {
    pub hosts: Arc<HostConfigMap>,
    pub listen_port: u16,
    pub redis_hosts: Vec<String>,
    pub probe_interval: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let hosts_json =
            std::env::var("FROST_HOSTS").context("FROST_HOSTS is not set")?;
        let hosts = HostConfigMap::from_json(&hosts_json).context("parse FROST_HOSTS")?;

        let listen_port = std::env::var("FROST_SCHEDULER_PORT")
            .ok()
            .map(|s| s.parse().context("parse FROST_SCHEDULER_PORT"))
            .transpose()?
            .unwrap_or(8090);

        let redis_hosts = std::env::var("FROST_REDIS_HOSTS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let probe_interval_sec: u64 = std::env::var("FROST_PROBE_INTERVAL_SEC")
            .ok()
            .map(|s| s.parse().context("parse FROST_PROBE_INTERVAL_SEC"))
            .transpose()?
            .unwrap_or(30);

        let log_level = std::env::var("FROST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            hosts: Arc::new(hosts),
            listen_port,
            redis_hosts,
            probe_interval: Duration::from_secs(probe_interval_sec),
            log_level,
        })
    }
}
