//! Pool discovery and the atomic claim protocol.
//!
//! Claiming stamps a runner name onto a frozen, correctly-tagged instance
//! exactly once: get (with version token), check, update as compare-and-
//! swap, then read back. Steps run under the host's API mutex so two
//! claims on the same host cannot interleave; claims on different hosts
//! proceed in parallel.

use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures_util::future::join_all;
use rand::seq::SliceRandom;
use thiserror::Error;
use tracing::{info, warn};

use frost_lxd::{
    scrape_host, Instance, LxdError, LxdHost, Resource, CONFIG_KEY_ALLOCATED_AT,
    CONFIG_KEY_IMAGE_ALIAS, CONFIG_KEY_LIMITS_CPU, CONFIG_KEY_RESOURCE_TYPE,
    CONFIG_KEY_RUNNER_NAME,
};
use frost_store::{ResourceCache, StoreError, DEFAULT_SNAPSHOT_TTL};

use crate::metrics;

/// Deadline for fetching one host's instance list during a claim pass.
pub const LIST_DEADLINE: Duration = Duration::from_secs(10);

/// A pool member on a specific host, eligible for a claim attempt.
pub struct Candidate {
    pub host: LxdHost,
    pub instance_name: String,
}

#[derive(Debug, Error)]
pub enum ClaimError {
    /// Another runner already holds this instance.
    #[error("instance is already claimed")]
    AlreadyClaimed,

    /// The version token went stale between read and update.
    #[error("claim raced with a concurrent update")]
    Raced,

    /// The host accepted the update but did not reflect it.
    #[error("read-back mismatch: got {got:?}")]
    ReadBackMismatch { got: String },

    #[error(transparent)]
    Host(#[from] LxdError),
}

/// Snapshot for a host, from cache when live, scraping (and back-filling
/// the cache) on a miss.
pub async fn get_resource(cache: &ResourceCache, host: &LxdHost) -> Result<Resource> {
    match cache.get_snapshot(&host.config.host).await {
        Ok((resource, _)) => return Ok(resource),
        Err(StoreError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    warn!(host = %host.config.host, "snapshot cache miss, scraping host");
    let (resource, _) = scrape_host(host.client.as_ref(), &host.config.host).await?;
    cache
        .set_snapshot(&host.config.host, &resource, DEFAULT_SNAPSHOT_TTL)
        .await?;
    Ok(resource)
}

/// Over-commit percent derived from the running instances in a snapshot.
pub fn running_over_commit_percent(resource: &Resource) -> Result<u64> {
    if resource.cpu_total == 0 {
        return Ok(0);
    }

    let mut used = 0u64;
    for instance in &resource.instances {
        if !instance.status.is_running() {
            continue;
        }
        let Some(cpu) = instance.config_get(CONFIG_KEY_LIMITS_CPU) else {
            continue;
        };
        if cpu.is_empty() {
            continue;
        }
        used += cpu
            .parse::<u64>()
            .map_err(|_| anyhow!("parse limits.cpu {cpu:?} on {}", instance.name))?;
    }

    Ok((used as f64 / resource.cpu_total as f64 * 100.0) as u64)
}

async fn instances_with_timeout(
    cache: &ResourceCache,
    host: &LxdHost,
) -> Result<(Vec<Instance>, u64)> {
    let resource = tokio::time::timeout(LIST_DEADLINE, get_resource(cache, host))
        .await
        .map_err(|_| anyhow!("timed out listing instances on {}", host.config.host))??;
    let over_commit = running_over_commit_percent(&resource)?;
    Ok((resource.instances, over_commit))
}

/// Whether an instance has not been claimed. An empty runner name counts
/// as unclaimed.
pub fn is_unclaimed(instance: &Instance) -> bool {
    !instance
        .config_get(CONFIG_KEY_RUNNER_NAME)
        .is_some_and(|name| !name.is_empty())
}

/// Whether an instance is a claimable pool member for the given class and
/// image.
pub fn is_claimable_pool_member(
    instance: &Instance,
    resource_type_name: &str,
    image_alias: &str,
) -> bool {
    instance.status.is_frozen()
        && instance.config_get(CONFIG_KEY_RESOURCE_TYPE) == Some(resource_type_name)
        && instance.config_get(CONFIG_KEY_IMAGE_ALIAS) == Some(image_alias)
        && is_unclaimed(instance)
}

/// Scan the target hosts for instances matching `matcher`.
///
/// Hosts are queried concurrently; within each host the matches are
/// shuffled to reduce claim collisions, and hosts are ordered by ascending
/// over-commit so the least loaded host is tried first. Hosts at or above
/// `limit_over_commit` (when non-zero) are dropped from the pass, as are
/// hosts that time out.
pub async fn find_instances<F>(
    cache: &ResourceCache,
    targets: &[LxdHost],
    matcher: F,
    limit_over_commit: u64,
) -> Vec<Candidate>
where
    F: Fn(&Instance) -> bool + Copy,
{
    let mut per_host = join_all(targets.iter().map(|host| async move {
        let (instances, over_commit) = match instances_with_timeout(cache, host).await {
            Ok(got) => got,
            Err(e) => {
                info!(host = %host.config.host, error = %e, "failed to list instances, dropping host");
                return None;
            }
        };

        if limit_over_commit > 0 && over_commit >= limit_over_commit {
            info!(
                host = %host.config.host,
                current = over_commit,
                limit = limit_over_commit,
                "host reached over-commit limit"
            );
            return None;
        }

        let mut names: Vec<String> = instances
            .iter()
            .filter(|i| matcher(i))
            .map(|i| i.name.clone())
            .collect();
        names.shuffle(&mut rand::thread_rng());

        Some((host.clone(), over_commit, names))
    }))
    .await
    .into_iter()
    .flatten()
    .collect::<Vec<_>>();

    per_host.sort_by_key(|(_, over_commit, _)| *over_commit);

    per_host
        .into_iter()
        .flat_map(|(host, _, names)| {
            names.into_iter().map(move |instance_name| Candidate {
                host: host.clone(),
                instance_name,
            })
        })
        .collect()
}

/// Look for an instance already bound to this runner (the caller retried
/// an in-flight request).
pub async fn find_instance_by_job(
    cache: &ResourceCache,
    targets: &[LxdHost],
    runner_name: &str,
    require_frozen: bool,
) -> Option<Candidate> {
    let matcher = |instance: &Instance| {
        instance.config_get(CONFIG_KEY_RUNNER_NAME) == Some(runner_name)
            && (!require_frozen || instance.status.is_frozen())
    };
    find_instances(cache, targets, &matcher, 0)
        .await
        .into_iter()
        .next()
}

/// One pass over the candidate pool: first successful claim wins.
pub async fn allocate_pooled_instance(
    cache: &ResourceCache,
    targets: &[LxdHost],
    resource_type_name: &str,
    image_alias: &str,
    limit_over_commit: u64,
    runner_name: &str,
) -> Result<Candidate> {
    let matcher = |instance: &Instance| {
        is_claimable_pool_member(instance, resource_type_name, image_alias)
    };
    let candidates = find_instances(cache, targets, &matcher, limit_over_commit).await;

    for candidate in candidates {
        match claim_instance(&candidate.host, &candidate.instance_name, runner_name).await {
            Ok(()) => {
                metrics::clear_failed_allocate(&candidate.host.config.host, runner_name);
                return Ok(candidate);
            }
            Err(e) => {
                info!(
                    host = %candidate.host.config.host,
                    instance = %candidate.instance_name,
                    error = %e,
                    "failed to claim instance, trying another"
                );
                metrics::record_failed_allocate(&candidate.host.config.host, runner_name);
            }
        }
    }

    Err(anyhow!(
        "no available instance for resource_type={resource_type_name:?} image_alias={image_alias:?}"
    ))
}

/// Atomic claim on one instance.
pub async fn claim_instance(
    host: &LxdHost,
    instance_name: &str,
    runner_name: &str,
) -> Result<(), ClaimError> {
    let _guard = host.api_lock.lock().await;

    let (instance, etag) = host.client.get_instance(instance_name).await?;
    if !is_unclaimed(&instance) {
        return Err(ClaimError::AlreadyClaimed);
    }

    info!(instance = %instance_name, runner = %runner_name, "allocating instance to runner");

    let mut put = instance.writable();
    put.config
        .insert(CONFIG_KEY_RUNNER_NAME.to_string(), runner_name.to_string());
    put.config
        .insert(CONFIG_KEY_ALLOCATED_AT.to_string(), Utc::now().to_rfc3339());

    match host.client.update_instance(instance_name, put, &etag).await {
        Ok(()) => {}
        Err(LxdError::PreconditionFailed) => return Err(ClaimError::Raced),
        Err(e) => return Err(e.into()),
    }

    // The host API occasionally accepts an update that is not reflected;
    // the read-back is mandatory.
    let (reread, _) = host.client.get_instance(instance_name).await?;
    match reread.config_get(CONFIG_KEY_RUNNER_NAME) {
        Some(name) if name == runner_name => Ok(()),
        other => Err(ClaimError::ReadBackMismatch {
            got: other.unwrap_or_default().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    fn instance(
        name: &str,
        status: frost_lxd::InstanceStatus,
        tags: &[(&str, &str)],
    ) -> Instance {
        Instance {
            name: name.to_string(),
            status,
            created_at: Utc::now(),
            config: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            devices: HashMap::new(),
            profiles: Vec::new(),
            ephemeral: false,
        }
    }

    #[test]
    fn test_empty_runner_name_counts_as_unclaimed() {
        let claimed = instance(
            "a",
            frost_lxd::InstanceStatus::Frozen,
            &[(CONFIG_KEY_RUNNER_NAME, "11111111-1111-1111-1111-111111111111")],
        );
        let empty = instance(
            "b",
            frost_lxd::InstanceStatus::Frozen,
            &[(CONFIG_KEY_RUNNER_NAME, "")],
        );
        let unset = instance("c", frost_lxd::InstanceStatus::Frozen, &[]);

        assert!(!is_unclaimed(&claimed));
        assert!(is_unclaimed(&empty));
        assert!(is_unclaimed(&unset));
    }

    #[test]
    fn test_claimable_pool_member_filter() {
        let member = instance(
            "a",
            frost_lxd::InstanceStatus::Frozen,
            &[
                (CONFIG_KEY_RESOURCE_TYPE, "large"),
                (CONFIG_KEY_IMAGE_ALIAS, "ubuntu:focal"),
            ],
        );
        assert!(is_claimable_pool_member(&member, "large", "ubuntu:focal"));
        assert!(!is_claimable_pool_member(&member, "2xlarge", "ubuntu:focal"));
        assert!(!is_claimable_pool_member(&member, "large", "ubuntu:noble"));

        let running = instance(
            "b",
            frost_lxd::InstanceStatus::Running,
            &[
                (CONFIG_KEY_RESOURCE_TYPE, "large"),
                (CONFIG_KEY_IMAGE_ALIAS, "ubuntu:focal"),
            ],
        );
        assert!(!is_claimable_pool_member(&running, "large", "ubuntu:focal"));
    }

    #[test]
    fn test_running_over_commit_percent() {
        let resource = Resource {
            cpu_total: 8,
            memory_total: 0,
            cpu_used: 0,
            memory_used: 0,
            instances: vec![
                instance(
                    "a",
                    frost_lxd::InstanceStatus::Running,
                    &[(CONFIG_KEY_LIMITS_CPU, "4")],
                ),
                instance(
                    "b",
                    frost_lxd::InstanceStatus::Frozen,
                    &[(CONFIG_KEY_LIMITS_CPU, "8")],
                ),
                instance(
                    "c",
                    frost_lxd::InstanceStatus::Running,
                    &[(CONFIG_KEY_LIMITS_CPU, "8")],
                ),
            ],
            captured_at: Utc::now(),
        };
        assert_eq!(running_over_commit_percent(&resource).unwrap(), 150);
    }
}
