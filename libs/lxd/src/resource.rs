//! Resource probe: turn one host into a capacity snapshot.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::client::HostClient;
use crate::error::LxdError;
use crate::types::{Instance, ServerResources, CONFIG_KEY_LIMITS_CPU, CONFIG_KEY_LIMITS_MEMORY};

/// Capacity snapshot of one host.
///
/// `cpu_used`/`memory_used` sum the declared limits of non-frozen
/// instances; frozen pool members appear in `instances` but do not count
/// toward usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub cpu_total: u64,
    pub memory_total: u64,
    pub cpu_used: u64,
    pub memory_used: u64,
    pub instances: Vec<Instance>,
    pub captured_at: DateTime<Utc>,
}

/// CPU over-commit percent observed on a host.
pub fn over_commit_percent(resource: &Resource) -> u64 {
    if resource.cpu_total == 0 {
        return 0;
    }
    (resource.cpu_used as f64 / resource.cpu_total as f64 * 100.0) as u64
}

fn probe_slots() -> &'static Mutex<HashMap<String, std::sync::Arc<Semaphore>>> {
    static SLOTS: OnceLock<Mutex<HashMap<String, std::sync::Arc<Semaphore>>>> = OnceLock::new();
    SLOTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn probe_slot(host: &str) -> std::sync::Arc<Semaphore> {
    probe_slots()
        .lock()
        .expect("probe slot map poisoned")
        .entry(host.to_string())
        .or_insert_with(|| std::sync::Arc::new(Semaphore::new(1)))
        .clone()
}

fn host_totals() -> &'static Mutex<HashMap<String, ServerResources>> {
    static TOTALS: OnceLock<Mutex<HashMap<String, ServerResources>>> = OnceLock::new();
    TOTALS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Server totals do not change at runtime; scrape them once per host.
async fn server_totals(
    client: &dyn HostClient,
    host: &str,
) -> Result<ServerResources, LxdError> {
    if let Some(totals) = host_totals()
        .lock()
        .expect("host totals poisoned")
        .get(host)
        .cloned()
    {
        return Ok(totals);
    }

    let totals = client.server_resources().await?;
    host_totals()
        .lock()
        .expect("host totals poisoned")
        .insert(host.to_string(), totals.clone());
    Ok(totals)
}

/// Produce a fresh snapshot for one host. Probes for the same host are
/// serialised through a single-slot semaphore.
pub async fn scrape_host(
    client: &dyn HostClient,
    host: &str,
) -> Result<(Resource, String), LxdError> {
    let slot = probe_slot(host);
    let _permit = slot
        .acquire()
        .await
        .map_err(|_| LxdError::Invalid("probe semaphore closed".to_string()))?;

    let totals = server_totals(client, host).await?;
    let instances = client.list_instances().await?;
    let (cpu_used, memory_used) = aggregate_allocated(&instances)?;

    Ok((
        Resource {
            cpu_total: totals.cpu_total,
            memory_total: totals.memory_total,
            cpu_used,
            memory_used,
            instances,
            captured_at: Utc::now(),
        },
        totals.hostname,
    ))
}

/// Sum declared CPU/memory limits over non-frozen instances.
pub fn aggregate_allocated(instances: &[Instance]) -> Result<(u64, u64), LxdError> {
    let mut cpu = 0u64;
    let mut memory = 0u64;

    for instance in instances {
        if instance.status.is_frozen() {
            continue;
        }

        match instance.config_get(CONFIG_KEY_LIMITS_CPU) {
            Some(limit) if !limit.is_empty() => {
                let parsed: u64 = limit.parse().map_err(|_| {
                    LxdError::Invalid(format!("limits.cpu {limit:?} on {}", instance.name))
                })?;
                cpu += parsed;
            }
            _ => warn!(instance = %instance.name, "instance has no limits.cpu"),
        }

        match instance.config_get(CONFIG_KEY_LIMITS_MEMORY) {
            Some(limit) if !limit.is_empty() => {
                memory += parse_size(limit)?;
            }
            _ => warn!(instance = %instance.name, "instance has no limits.memory"),
        }
    }

    Ok((cpu, memory))
}

/// Parse a human-readable size into bytes.
///
/// Decimal suffixes (`KB`, `MB`, `GB`, ...) are 1000-based, binary
/// suffixes (`KiB`, `MiB`, ...) 1024-based, bare digits are bytes.
pub fn parse_size(input: &str) -> Result<u64, LxdError> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);

    let value: f64 = number
        .parse()
        .map_err(|_| LxdError::Invalid(format!("size {input:?}")))?;

    let suffix = suffix.trim();
    let multiplier: f64 = match suffix.to_ascii_uppercase().as_str() {
        "" | "B" => 1.0,
        "K" | "KB" => 1000.0,
        "M" | "MB" => 1000.0 * 1000.0,
        "G" | "GB" => 1000.0 * 1000.0 * 1000.0,
        "T" | "TB" => 1000.0f64.powi(4),
        "P" | "PB" => 1000.0f64.powi(5),
        "KIB" => 1024.0,
        "MIB" => 1024.0 * 1024.0,
        "GIB" => 1024.0 * 1024.0 * 1024.0,
        "TIB" => 1024.0f64.powi(4),
        "PIB" => 1024.0f64.powi(5),
        _ => return Err(LxdError::Invalid(format!("size suffix {suffix:?}"))),
    };

    Ok((value * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InstanceStatus;

    fn instance(name: &str, status: InstanceStatus, cpu: &str, memory: &str) -> Instance {
        let mut config = HashMap::new();
        if !cpu.is_empty() {
            config.insert(CONFIG_KEY_LIMITS_CPU.to_string(), cpu.to_string());
        }
        if !memory.is_empty() {
            config.insert(CONFIG_KEY_LIMITS_MEMORY.to_string(), memory.to_string());
        }
        Instance {
            name: name.to_string(),
            status,
            created_at: Utc::now(),
            config,
            devices: HashMap::new(),
            profiles: Vec::new(),
            ephemeral: false,
        }
    }

    #[test]
    fn test_parse_size_forms() {
        assert_eq!(parse_size("2GB").unwrap(), 2_000_000_000);
        assert_eq!(parse_size("2048MB").unwrap(), 2_048_000_000);
        assert_eq!(parse_size("2147483648").unwrap(), 2_147_483_648);
        assert_eq!(parse_size("4GiB").unwrap(), 4 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5GB").unwrap(), 1_500_000_000);
    }

    #[test]
    fn test_parse_size_rejects_garbage() {
        assert!(parse_size("many").is_err());
        assert!(parse_size("2XB").is_err());
    }

    #[test]
    fn test_aggregate_skips_frozen() {
        let instances = vec![
            instance("a", InstanceStatus::Running, "4", "8GB"),
            instance("b", InstanceStatus::Frozen, "8", "16GB"),
            instance("c", InstanceStatus::Stopped, "2", "2GB"),
        ];
        let (cpu, memory) = aggregate_allocated(&instances).unwrap();
        assert_eq!(cpu, 6);
        assert_eq!(memory, 10_000_000_000);
    }

    #[test]
    fn test_aggregate_warns_but_skips_missing_limits() {
        let instances = vec![instance("a", InstanceStatus::Running, "", "")];
        let (cpu, memory) = aggregate_allocated(&instances).unwrap();
        assert_eq!(cpu, 0);
        assert_eq!(memory, 0);
    }

    #[test]
    fn test_aggregate_rejects_malformed_cpu() {
        let instances = vec![instance("a", InstanceStatus::Running, "four", "1GB")];
        assert!(aggregate_allocated(&instances).is_err());
    }

    #[test]
    fn test_over_commit_percent() {
        let resource = Resource {
            cpu_total: 8,
            memory_total: 0,
            cpu_used: 12,
            memory_used: 0,
            instances: Vec::new(),
            captured_at: Utc::now(),
        };
        assert_eq!(over_commit_percent(&resource), 150);
    }
}
