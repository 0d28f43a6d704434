//! Reservation ledger.
//!
//! A reservation records that a placement decision intends to consume
//! capacity, so a burst of requests does not pile onto one host before its
//! snapshot refreshes. Entries are append-only and keyed only by their own
//! timestamp; readers filter stale entries on the fly and the janitor
//! rewrite is idempotent under concurrent writers.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use frost_store::{host_from_scheduled_key, scheduled_key, Store, StoreError};

/// Hard TTL on stored reservation lists.
pub const RESERVATION_TTL: std::time::Duration = std::time::Duration::from_secs(120);
/// Entries older than this are ignored by readers.
pub const RESERVATION_FILTER_TTL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub cpu: u64,
    pub memory: u64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReservationStats {
    pub host_name: String,
    pub total_cpu: u64,
    pub total_memory: u64,
    pub count: usize,
    pub oldest_request: Option<DateTime<Utc>>,
}

fn filter_ttl() -> ChronoDuration {
    ChronoDuration::from_std(RESERVATION_FILTER_TTL).expect("filter ttl in range")
}

fn hard_ttl() -> ChronoDuration {
    ChronoDuration::from_std(RESERVATION_TTL).expect("hard ttl in range")
}

/// All still-valid reservations, keyed by host.
pub async fn list_active(
    store: &Arc<dyn Store>,
) -> Result<HashMap<String, Vec<Reservation>>, StoreError> {
    let now = Utc::now();
    let mut active = HashMap::new();

    for (key, raw) in store.list().await? {
        let Some(host) = host_from_scheduled_key(&key) else {
            continue;
        };
        let entries: Vec<Reservation> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key = %key, error = %e, "skipping undecodable reservation list");
                continue;
            }
        };

        let valid: Vec<Reservation> = entries
            .into_iter()
            .filter(|r| now - r.time < filter_ttl())
            .collect();
        if !valid.is_empty() {
            active.insert(host.to_string(), valid);
        }
    }

    Ok(active)
}

/// Append a reservation for `host`. Expected to run under the host's
/// advisory store lock.
pub async fn append(
    store: &Arc<dyn Store>,
    host: &str,
    cpu: u64,
    memory: u64,
) -> Result<(), StoreError> {
    let key = scheduled_key(host);
    let mut entries: Vec<Reservation> = match store.get(&key).await {
        Ok((raw, _)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!(key = %key, error = %e, "resetting undecodable reservation list");
            Vec::new()
        }),
        Err(StoreError::NotFound) => Vec::new(),
        Err(e) => return Err(e),
    };

    entries.push(Reservation {
        cpu,
        memory,
        time: Utc::now(),
    });

    let raw = serde_json::to_string(&entries)?;
    store.set(&key, &raw, RESERVATION_TTL).await
}

/// Janitor pass: rewrite every reservation list keeping only entries
/// younger than the hard TTL, deleting lists that became empty. Returns
/// how many keys were rewritten or deleted.
pub async fn sweep(store: &Arc<dyn Store>) -> Result<usize, StoreError> {
    let now = Utc::now();
    let mut cleaned = 0;

    for (key, raw) in store.list().await? {
        if host_from_scheduled_key(&key).is_none() {
            continue;
        }
        let entries: Vec<Reservation> = match serde_json::from_str(&raw) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(key = %key, error = %e, "skipping undecodable reservation list");
                continue;
            }
        };

        let valid: Vec<Reservation> = entries
            .iter()
            .filter(|r| now - r.time < hard_ttl())
            .cloned()
            .collect();

        if valid.is_empty() {
            store.delete(&key).await?;
            cleaned += 1;
        } else if valid.len() < entries.len() {
            let raw = serde_json::to_string(&valid)?;
            store.set(&key, &raw, RESERVATION_TTL).await?;
            cleaned += 1;
        }
    }

    Ok(cleaned)
}

/// Aggregate per-host statistics for the active reservations.
pub fn stats(
    reservations: &HashMap<String, Vec<Reservation>>,
) -> HashMap<String, ReservationStats> {
    let mut out = HashMap::new();
    for (host, entries) in reservations {
        let mut stat = ReservationStats {
            host_name: host.clone(),
            total_cpu: 0,
            total_memory: 0,
            count: 0,
            oldest_request: None,
        };
        for entry in entries {
            stat.total_cpu += entry.cpu;
            stat.total_memory += entry.memory;
            stat.count += 1;
            if stat.oldest_request.is_none_or(|oldest| entry.time < oldest) {
                stat.oldest_request = Some(entry.time);
            }
        }
        out.insert(host.clone(), stat);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use frost_store::Memory;

    fn store() -> Arc<dyn Store> {
        Arc::new(Memory::new())
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let store = store();
        append(&store, "h1", 2, 1024).await.unwrap();
        append(&store, "h1", 4, 2048).await.unwrap();
        append(&store, "h2", 1, 512).await.unwrap();

        let active = list_active(&store).await.unwrap();
        assert_eq!(active.get("h1").unwrap().len(), 2);
        assert_eq!(active.get("h2").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_filters_stale_entries() {
        let store = store();
        let stale = vec![Reservation {
            cpu: 2,
            memory: 1024,
            time: Utc::now() - ChronoDuration::seconds(90),
        }];
        store
            .set(
                &scheduled_key("h1"),
                &serde_json::to_string(&stale).unwrap(),
                RESERVATION_TTL,
            )
            .await
            .unwrap();

        let active = list_active(&store).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_deletes_empty_and_rewrites_partial() {
        let store = store();
        let mixed = vec![
            Reservation {
                cpu: 2,
                memory: 1024,
                time: Utc::now() - ChronoDuration::seconds(150),
            },
            Reservation {
                cpu: 4,
                memory: 2048,
                time: Utc::now(),
            },
        ];
        store
            .set(
                &scheduled_key("h1"),
                &serde_json::to_string(&mixed).unwrap(),
                RESERVATION_TTL,
            )
            .await
            .unwrap();
        let dead = vec![Reservation {
            cpu: 8,
            memory: 4096,
            time: Utc::now() - ChronoDuration::seconds(300),
        }];
        store
            .set(
                &scheduled_key("h2"),
                &serde_json::to_string(&dead).unwrap(),
                RESERVATION_TTL,
            )
            .await
            .unwrap();

        let cleaned = sweep(&store).await.unwrap();
        assert_eq!(cleaned, 2);

        let active = list_active(&store).await.unwrap();
        assert_eq!(active.get("h1").unwrap().len(), 1);
        assert!(!active.contains_key("h2"));
        assert!(store.get(&scheduled_key("h2")).await.is_err());
    }

    #[tokio::test]
    async fn test_stats_aggregates() {
        let mut reservations = HashMap::new();
        let older = Utc::now() - ChronoDuration::seconds(30);
        reservations.insert(
            "h1".to_string(),
            vec![
                Reservation {
                    cpu: 2,
                    memory: 1024,
                    time: older,
                },
                Reservation {
                    cpu: 4,
                    memory: 2048,
                    time: Utc::now(),
                },
            ],
        );

        let stats = stats(&reservations);
        let h1 = stats.get("h1").unwrap();
        assert_eq!(h1.total_cpu, 6);
        assert_eq!(h1.total_memory, 3072);
        assert_eq!(h1.count, 2);
        assert_eq!(h1.oldest_request, Some(older));
    }
}
