//! Redis store backend for cluster mode.
//!
//! Entries use native TTLs; advisory locks are `SET NX EX` leases so a
//! crashed holder cannot deadlock the cache.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::{Store, StoreError, LOCK_TTL};

const KEY_PREFIX: &str = "frost:";

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn storage_key(key: &str) -> String {
    format!("{KEY_PREFIX}{key}")
}

fn lock_key(name: &str) -> String {
    format!("{KEY_PREFIX}lock-{name}")
}

pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connect to the first reachable address.
    pub async fn connect(addresses: &[String]) -> Result<Self, StoreError> {
        let mut last_error = StoreError::Backend("no redis addresses configured".to_string());
        for address in addresses {
            let client = match redis::Client::open(address.as_str()) {
                Ok(client) => client,
                Err(e) => {
                    last_error = backend(e);
                    continue;
                }
            };
            match client.get_connection_manager().await {
                Ok(conn) => return Ok(Self { conn }),
                Err(e) => last_error = backend(e),
            }
        }
        Err(last_error)
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<(String, Duration), StoreError> {
        let mut conn = self.conn.clone();
        let key = storage_key(key);

        let value: Option<String> = conn.get(&key).await.map_err(backend)?;
        let value = value.ok_or(StoreError::NotFound)?;

        let ttl_secs: i64 = conn.ttl(&key).await.map_err(backend)?;
        let ttl = Duration::from_secs(ttl_secs.max(0) as u64);
        Ok((value, ttl))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(storage_key(key), value, ttl.as_secs().max(1))
            .await
            .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(storage_key(key)).await.map_err(backend)
    }

    async fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = conn
            .keys(format!("{KEY_PREFIX}*"))
            .await
            .map_err(backend)?;

        let mut entries = Vec::new();
        for key in keys {
            let Some(bare) = key.strip_prefix(KEY_PREFIX) else {
                continue;
            };
            if bare.starts_with("lock-") {
                continue;
            }
            // Entries can expire between KEYS and GET.
            let value: Option<String> = conn.get(&key).await.map_err(backend)?;
            if let Some(value) = value {
                entries.push((bare.to_string(), value));
            }
        }
        Ok(entries)
    }

    async fn try_lock(&self, name: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock_key(name))
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(LOCK_TTL.as_secs())
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(lock_key(name)).await.map_err(backend)
    }
}
