//! Typed host-snapshot layer over the raw store.

use std::sync::Arc;
use std::time::Duration;

use frost_lxd::Resource;

use crate::{host_from_key, host_key, Store, StoreError};

/// TTL applied to host snapshots unless the writer says otherwise. The
/// refresh loops run every few seconds, so an entry this old means the
/// host has been unreachable for a while.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(60);

/// Snapshot store shared by placement and allocation. Snapshots are
/// shared by value: every read hands out an owned copy.
#[derive(Clone)]
pub struct ResourceCache {
    store: Arc<dyn Store>,
}

impl ResourceCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Fetch a host snapshot and its remaining TTL.
    pub async fn get_snapshot(&self, host: &str) -> Result<(Resource, Duration), StoreError> {
        let (raw, ttl) = self.store.get(&host_key(host)).await?;
        let resource: Resource = serde_json::from_str(&raw)?;
        Ok((resource, ttl))
    }

    pub async fn set_snapshot(
        &self,
        host: &str,
        resource: &Resource,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let raw = serde_json::to_string(resource)?;
        self.store.set(&host_key(host), &raw, ttl).await
    }

    /// Enumerate all live host snapshots.
    pub async fn list_snapshots(&self) -> Result<Vec<(String, Resource)>, StoreError> {
        let mut snapshots = Vec::new();
        for (key, raw) in self.store.list().await? {
            let Some(host) = host_from_key(&key) else {
                continue;
            };
            match serde_json::from_str::<Resource>(&raw) {
                Ok(resource) => snapshots.push((host.to_string(), resource)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "skipping undecodable snapshot");
                }
            }
        }
        Ok(snapshots)
    }

    pub async fn try_lock(&self, host: &str) -> Result<bool, StoreError> {
        self.store.try_lock(host).await
    }

    pub async fn unlock(&self, host: &str) -> Result<(), StoreError> {
        self.store.unlock(host).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Memory;
    use chrono::Utc;

    fn resource(cpu_total: u64, cpu_used: u64) -> Resource {
        Resource {
            cpu_total,
            memory_total: 16_000_000_000,
            cpu_used,
            memory_used: 0,
            instances: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let cache = ResourceCache::new(Arc::new(Memory::new()));
        cache
            .set_snapshot("h1", &resource(8, 2), DEFAULT_SNAPSHOT_TTL)
            .await
            .unwrap();

        let (got, ttl) = cache.get_snapshot("h1").await.unwrap();
        assert_eq!(got.cpu_total, 8);
        assert_eq!(got.cpu_used, 2);
        assert!(ttl <= DEFAULT_SNAPSHOT_TTL);
    }

    #[tokio::test]
    async fn test_list_ignores_foreign_keys() {
        let cache = ResourceCache::new(Arc::new(Memory::new()));
        cache
            .set_snapshot("h1", &resource(8, 0), DEFAULT_SNAPSHOT_TTL)
            .await
            .unwrap();
        cache
            .store()
            .set("scheduled:h1", "[]", DEFAULT_SNAPSHOT_TTL)
            .await
            .unwrap();

        let snapshots = cache.list_snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].0, "h1");
    }

    #[tokio::test]
    async fn test_miss_is_not_found() {
        let cache = ResourceCache::new(Arc::new(Memory::new()));
        assert!(matches!(
            cache.get_snapshot("h1").await,
            Err(StoreError::NotFound)
        ));
    }
}
