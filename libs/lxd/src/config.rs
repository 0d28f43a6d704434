//! Host descriptors and the fleet host map.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::Deserialize;

use crate::error::LxdError;

/// Connection material for a single fleet host. Created from config at
/// startup, one descriptor per host.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Stable API address, e.g. `https://10.0.0.1:8443`.
    pub host: String,
    /// Client certificate, PEM.
    pub client_cert: String,
    /// Client key, PEM.
    pub client_key: String,
}

/// JSON shape of one entry in the hosts environment variable.
#[derive(Debug, Deserialize)]
struct HostEntry {
    host: String,
    client_cert: String,
    client_key: String,
}

/// Mapping of host address to descriptor.
#[derive(Debug, Default)]
pub struct HostConfigMap {
    inner: RwLock<HashMap<String, HostConfig>>,
}

impl HostConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the hosts JSON (`[{"host", "client_cert", "client_key"}]`,
    /// cert/key being file paths) and read the certificate material.
    pub fn from_json(json: &str) -> Result<Self, LxdError> {
        let entries: Vec<HostEntry> = serde_json::from_str(json)
            .map_err(|e| LxdError::Invalid(format!("hosts JSON: {e}")))?;

        let map = Self::new();
        for entry in entries {
            let client_cert = std::fs::read_to_string(&entry.client_cert)
                .map_err(|e| LxdError::Invalid(format!("read {}: {e}", entry.client_cert)))?;
            let client_key = std::fs::read_to_string(&entry.client_key)
                .map_err(|e| LxdError::Invalid(format!("read {}: {e}", entry.client_key)))?;
            map.store(HostConfig {
                host: entry.host,
                client_cert,
                client_key,
            });
        }
        Ok(map)
    }

    pub fn store(&self, config: HostConfig) {
        self.inner
            .write()
            .expect("host config map poisoned")
            .insert(config.host.clone(), config);
    }

    pub fn load(&self, host: &str) -> Option<HostConfig> {
        self.inner
            .read()
            .expect("host config map poisoned")
            .get(host)
            .cloned()
    }

    pub fn all(&self) -> Vec<HostConfig> {
        self.inner
            .read()
            .expect("host config map poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("host config map poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
