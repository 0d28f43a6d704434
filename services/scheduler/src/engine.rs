//! Host selection.
//!
//! Hosts are filtered on adjusted free capacity, scored on load, and ties
//! are broken uniformly at random. The random tie-break is what keeps a
//! burst of requests from piling onto a single host between snapshot
//! refreshes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use frost_lxd::Resource;
use frost_store::{ResourceCache, Store};

use crate::reservations::{self, Reservation};

/// How many times host selection retries when the advisory lock for the
/// chosen host is contended.
pub const MAX_SCHED_RETRIES: usize = 3;
/// Delay between lock acquisition retries.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub cpu: u64,
    pub memory: u64,
    #[serde(default)]
    pub target_hosts: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ScheduleResponse {
    pub host: String,
}

/// Placement engine: stateless aside from store access.
#[derive(Clone)]
pub struct Scheduler {
    cache: ResourceCache,
    store: Arc<dyn Store>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            cache: ResourceCache::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    /// Pick the best host for a request, record a reservation for it, and
    /// return its id. `None` means no host qualifies right now.
    pub async fn schedule(&self, req: &ScheduleRequest) -> Option<String> {
        let mut resources: HashMap<String, Resource> = match self.cache.list_snapshots().await {
            Ok(snapshots) => snapshots.into_iter().collect(),
            Err(e) => {
                error!(error = %e, "failed to load host snapshots");
                return None;
            }
        };

        if !req.target_hosts.is_empty() {
            resources.retain(|host, _| req.target_hosts.contains(host));
            if resources.is_empty() {
                warn!(target_hosts = ?req.target_hosts, "no target hosts available");
                return None;
            }
        }

        let reservations = match reservations::list_active(&self.store).await {
            Ok(reservations) => reservations,
            Err(e) => {
                error!(error = %e, "failed to load reservations, proceeding without");
                HashMap::new()
            }
        };
        adjust_with_reservations(&mut resources, &reservations);

        let selected = self.select_with_lock_retry(&resources, req).await?;

        if let Err(e) =
            reservations::append(&self.store, &selected, req.cpu, req.memory).await
        {
            // The host is already locked and selected; a lost reservation
            // only widens the race window.
            error!(host = %selected, error = %e, "failed to store reservation");
        }

        if let Err(e) = self.store.unlock(&selected).await {
            error!(host = %selected, error = %e, "failed to release host lock");
        }

        Some(selected)
    }

    /// Run selection and take the winner's advisory lock, retrying a
    /// bounded number of times. Never blocks on another request's lock.
    async fn select_with_lock_retry(
        &self,
        resources: &HashMap<String, Resource>,
        req: &ScheduleRequest,
    ) -> Option<String> {
        for attempt in 0..MAX_SCHED_RETRIES {
            let candidate = select_host(resources, req)?;

            match self.store.try_lock(&candidate).await {
                Ok(true) => return Some(candidate),
                Ok(false) => {
                    info!(host = %candidate, attempt = attempt + 1, "host locked during selection, retrying");
                }
                Err(e) => {
                    error!(host = %candidate, attempt = attempt + 1, error = %e, "failed to acquire host lock");
                }
            }
            if attempt + 1 < MAX_SCHED_RETRIES {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }

        warn!(max_retries = MAX_SCHED_RETRIES, "failed to acquire host lock after all retries");
        None
    }
}

/// Fold outstanding reservations into the usage figures.
pub fn adjust_with_reservations(
    resources: &mut HashMap<String, Resource>,
    reservations: &HashMap<String, Vec<Reservation>>,
) {
    for (host, resource) in resources.iter_mut() {
        if let Some(entries) = reservations.get(host) {
            for entry in entries {
                resource.cpu_used += entry.cpu;
                resource.memory_used += entry.memory;
            }
        }
    }
}

/// Pure selection: filter hosts with enough free capacity, score, pick
/// uniformly among the top scorers.
pub fn select_host(
    resources: &HashMap<String, Resource>,
    req: &ScheduleRequest,
) -> Option<String> {
    let mut candidates: Vec<(&String, i64)> = resources
        .iter()
        .filter(|(_, r)| {
            let available_cpu = r.cpu_total.saturating_sub(r.cpu_used);
            let available_memory = r.memory_total.saturating_sub(r.memory_used);
            available_cpu >= req.cpu && available_memory >= req.memory
        })
        .map(|(host, r)| (host, score(r)))
        .collect();

    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let best = candidates[0].1;
    let tied = candidates.iter().take_while(|(_, s)| *s == best).count();
    let pick = rand::thread_rng().gen_range(0..tied);
    Some(candidates[pick].0.clone())
}

/// Load-aware score, higher wins: free CPU and memory ratios weigh 50
/// points each, plus a bonus shrinking with instance count. Clamped at
/// zero.
pub fn score(resource: &Resource) -> i64 {
    if resource.cpu_total == 0 || resource.memory_total == 0 {
        return 0;
    }

    let available_cpu = resource.cpu_total.saturating_sub(resource.cpu_used);
    let available_memory = resource.memory_total.saturating_sub(resource.memory_used);

    let cpu_score = (available_cpu as f64 / resource.cpu_total as f64 * 50.0) as i64;
    let memory_score = (available_memory as f64 / resource.memory_total as f64 * 50.0) as i64;
    let instance_score = 100 - resource.instances.len() as i64;

    (cpu_score + memory_score + instance_score).max(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    fn resource(cpu_total: u64, cpu_used: u64, mem_total: u64, mem_used: u64) -> Resource {
        Resource {
            cpu_total,
            memory_total: mem_total,
            cpu_used,
            memory_used: mem_used,
            instances: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    fn request(cpu: u64, memory: u64) -> ScheduleRequest {
        ScheduleRequest {
            cpu,
            memory,
            target_hosts: Vec::new(),
        }
    }

    #[test]
    fn test_select_honours_capacity() {
        let mut resources = HashMap::new();
        resources.insert("small".to_string(), resource(2, 0, 2_000_000_000, 0));
        resources.insert("big".to_string(), resource(16, 0, 32_000_000_000, 0));

        let selected = select_host(&resources, &request(4, 4_000_000_000)).unwrap();
        assert_eq!(selected, "big");
    }

    #[test]
    fn test_select_no_host_when_all_full() {
        let mut resources = HashMap::new();
        resources.insert("h1".to_string(), resource(4, 4, 8_000_000_000, 0));

        assert!(select_host(&resources, &request(1, 1)).is_none());
    }

    #[test]
    fn test_select_zero_request_matches_any_host() {
        let mut resources = HashMap::new();
        resources.insert("h1".to_string(), resource(4, 4, 8_000_000_000, 8_000_000_000));

        assert!(select_host(&resources, &request(0, 0)).is_some());
    }

    #[test]
    fn test_score_prefers_idle_host() {
        let idle = resource(8, 0, 16_000_000_000, 0);
        let busy = resource(8, 6, 16_000_000_000, 12_000_000_000);
        assert!(score(&idle) > score(&busy));
    }

    #[test]
    fn test_score_clamped_at_zero() {
        let mut overloaded = resource(4, 4, 4_000_000_000, 4_000_000_000);
        overloaded.instances = (0..200)
            .map(|i| frost_lxd::Instance {
                name: format!("i{i}"),
                status: frost_lxd::InstanceStatus::Running,
                created_at: Utc::now(),
                config: HashMap::new(),
                devices: HashMap::new(),
                profiles: Vec::new(),
                ephemeral: false,
            })
            .collect();
        assert_eq!(score(&overloaded), 0);
    }

    #[test]
    fn test_tie_break_spreads_over_equal_hosts() {
        let mut resources = HashMap::new();
        resources.insert("h1".to_string(), resource(4, 0, 4_000_000_000, 0));
        resources.insert("h2".to_string(), resource(4, 0, 4_000_000_000, 0));

        let mut seen = HashSet::new();
        for _ in 0..100 {
            seen.insert(select_host(&resources, &request(2, 1024)).unwrap());
        }
        assert!(seen.contains("h1"));
        assert!(seen.contains("h2"));
    }

    #[test]
    fn test_adjustment_excludes_reserved_capacity() {
        let mut resources = HashMap::new();
        resources.insert("h1".to_string(), resource(4, 0, 4_000_000_000, 0));

        let mut reservations = HashMap::new();
        reservations.insert(
            "h1".to_string(),
            vec![Reservation {
                cpu: 3,
                memory: 1024,
                time: Utc::now(),
            }],
        );
        adjust_with_reservations(&mut resources, &reservations);

        assert!(select_host(&resources, &request(2, 1024)).is_none());
        assert!(select_host(&resources, &request(1, 1024)).is_some());
    }
}
