//! Connection establishment and the process-wide connection cache.
//!
//! A connection that exists in the cache is reused; otherwise a fresh TLS
//! connection is established with a short timeout and verified against the
//! API root. Handles that time out are evicted by whoever observed the
//! failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::join_all;
use tracing::warn;

use crate::client::{HostClient, LxdClient};
use crate::config::HostConfig;
use crate::error::LxdError;

/// Deadline for establishing (and verifying) a fresh connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A connected host: shared client handle, its descriptor, and the
/// host-wide mutex that serialises mutating API call sequences.
#[derive(Clone)]
pub struct LxdHost {
    pub client: Arc<dyn HostClient>,
    pub config: HostConfig,
    pub api_lock: Arc<tokio::sync::Mutex<()>>,
}

/// A host that could not be connected, with the reason.
pub struct ConnectError {
    pub config: HostConfig,
    pub error: LxdError,
}

fn connection_cache() -> &'static Mutex<HashMap<String, Arc<LxdClient>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, Arc<LxdClient>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn api_locks() -> &'static Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();
    LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// The per-host API mutex, shared by every `LxdHost` for the same address.
pub fn host_api_lock(host: &str) -> Arc<tokio::sync::Mutex<()>> {
    api_locks()
        .lock()
        .expect("api lock map poisoned")
        .entry(host.to_string())
        .or_default()
        .clone()
}

/// Drop a cached connection handle, forcing the next connect to redial.
pub fn evict_host(host: &str) {
    connection_cache()
        .lock()
        .expect("connection cache poisoned")
        .remove(host);
}

/// Connect to one host, reusing the cached handle when present.
pub async fn connect_host(config: &HostConfig) -> Result<LxdHost, LxdError> {
    let cached = connection_cache()
        .lock()
        .expect("connection cache poisoned")
        .get(&config.host)
        .cloned();

    let client = match cached {
        Some(client) => client,
        None => {
            let client = Arc::new(LxdClient::new(config)?);
            match tokio::time::timeout(CONNECT_TIMEOUT, client.ping()).await {
                Err(_) => return Err(LxdError::ConnectTimeout),
                Ok(Err(e)) => return Err(e),
                Ok(Ok(())) => {}
            }
            connection_cache()
                .lock()
                .expect("connection cache poisoned")
                .insert(config.host.clone(), client.clone());
            client
        }
    };

    Ok(LxdHost {
        client,
        config: config.clone(),
        api_lock: host_api_lock(&config.host),
    })
}

/// Connect to many hosts in parallel. Hosts that fail to connect are
/// returned separately and their cached handles evicted.
pub async fn connect_hosts(configs: &[HostConfig]) -> (Vec<LxdHost>, Vec<ConnectError>) {
    let attempts = join_all(configs.iter().map(|config| async move {
        (config.clone(), connect_host(config).await)
    }))
    .await;

    let mut connected = Vec::new();
    let mut failed = Vec::new();
    for (config, attempt) in attempts {
        match attempt {
            Ok(host) => connected.push(host),
            Err(error) => {
                warn!(host = %config.host, error = %error, "failed to connect LXD host");
                evict_host(&config.host);
                failed.push(ConnectError { config, error });
            }
        }
    }

    (connected, failed)
}
