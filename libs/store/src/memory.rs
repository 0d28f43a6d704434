//! In-process store backend for single-node deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::{Store, StoreError, LOCK_TTL};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// Concurrent map with monotonic TTL eviction and leased advisory locks.
#[derive(Default)]
pub struct Memory {
    entries: Mutex<HashMap<String, Entry>>,
    locks: Mutex<HashMap<String, Instant>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for Memory {
    async fn get(&self, key: &str) -> Result<(String, Duration), StoreError> {
        let mut entries = self.entries.lock().expect("store map poisoned");
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok((
                entry.value.clone(),
                entry.expires_at - Instant::now(),
            )),
            Some(_) => {
                entries.remove(key);
                Err(StoreError::NotFound)
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.lock().expect("store map poisoned").insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().expect("store map poisoned").remove(key);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<(String, String)>, StoreError> {
        let mut entries = self.entries.lock().expect("store map poisoned");
        let now = Instant::now();
        entries.retain(|_, entry| entry.expires_at > now);
        Ok(entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }

    async fn try_lock(&self, name: &str) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock().expect("lock map poisoned");
        let now = Instant::now();
        match locks.get(name) {
            Some(lease) if *lease > now => Ok(false),
            _ => {
                locks.insert(name.to_string(), now + LOCK_TTL);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, name: &str) -> Result<(), StoreError> {
        self.locks.lock().expect("lock map poisoned").remove(name);
        Ok(())
    }
}
