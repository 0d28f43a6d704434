//! Shared snapshot store.
//!
//! One process-wide mutable surface: a key/value store with per-entry TTL
//! and leased advisory locks. Two backends exist, an in-process map for
//! single-node deployments and Redis for cluster mode. The typed
//! [`ResourceCache`] sits on top for host capacity snapshots.
//!
//! Key layout:
//! - `host-<id>`: JSON capacity snapshot, native TTL
//! - `scheduled:<id>`: JSON reservation list, native TTL
//! - `lock-<name>`: advisory lease (backend-internal)

pub mod cache;
pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use cache::{ResourceCache, DEFAULT_SNAPSHOT_TTL};
pub use memory::Memory;
pub use redis_store::RedisStore;

/// Lease duration for advisory locks. A crashed holder cannot deadlock
/// the store: the lease simply expires.
pub const LOCK_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StoreError {
    /// The key has no live entry.
    #[error("cache entry not found")]
    NotFound,

    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A stored payload could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Capability interface over the shared store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch a live entry and its remaining TTL.
    async fn get(&self, key: &str) -> Result<(String, Duration), StoreError>;

    /// Replace an entry and reset its TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Enumerate live entries (advisory locks excluded).
    async fn list(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// Attempt to take the leased advisory lock for `name` without
    /// blocking. Returns whether the lock was obtained.
    async fn try_lock(&self, name: &str) -> Result<bool, StoreError>;

    async fn unlock(&self, name: &str) -> Result<(), StoreError>;
}

/// Store key for a host capacity snapshot.
pub fn host_key(host: &str) -> String {
    format!("host-{host}")
}

/// Inverse of [`host_key`].
pub fn host_from_key(key: &str) -> Option<&str> {
    key.strip_prefix("host-")
}

/// Store key for a host's reservation list.
pub fn scheduled_key(host: &str) -> String {
    format!("scheduled:{host}")
}

/// Inverse of [`scheduled_key`].
pub fn host_from_scheduled_key(key: &str) -> Option<&str> {
    key.strip_prefix("scheduled:")
}
