//! Allocator configuration, read from the environment at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use frost_lxd::HostConfigMap;
use frost_proto::allocator::v1::ResourceType;

/// Resource class requirements used when a class is absent from the
/// mapping table.
pub const DEFAULT_CPU_CORES: u64 = 1;
pub const DEFAULT_MEMORY_BYTES: u64 = 1024 * 1024 * 1024;

/// One entry of the resource type mapping table.
#[derive(Debug, Clone, Deserialize)]
pub struct Mapping {
    pub resource_type_name: String,
    pub cpu: u64,
    pub memory: String,
}

#[derive(Clone)]
pub struct Config {
    pub hosts: Arc<HostConfigMap>,
    pub resource_mapping: HashMap<ResourceType, Mapping>,
    pub image_alias_map: HashMap<String, String>,
    pub cache_period: Duration,
    pub listen_port: u16,
    pub metrics_port: u16,
    pub over_commit_percent: u64,
    pub log_level: String,
    pub cluster_enable: bool,
    pub redis_hosts: Vec<String>,
    pub scheduler_url: Option<String>,
    /// Whether the re-bind check only accepts frozen instances.
    pub rebind_requires_frozen: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let hosts_json = std::env::var("FROST_HOSTS").context("FROST_HOSTS is not set")?;
        let hosts = HostConfigMap::from_json(&hosts_json).context("parse FROST_HOSTS")?;

        let resource_mapping = match std::env::var("FROST_RESOURCE_TYPE_MAPPING") {
            Ok(raw) if !raw.is_empty() => parse_resource_mapping(&raw)?,
            _ => HashMap::new(),
        };

        let image_alias_map: HashMap<String, String> =
            match std::env::var("FROST_IMAGE_ALIAS_MAP") {
                Ok(raw) if !raw.is_empty() => {
                    serde_json::from_str(&raw).context("parse FROST_IMAGE_ALIAS_MAP")?
                }
                _ => HashMap::new(),
            };

        let cache_period_sec: u64 = std::env::var("FROST_RESOURCE_CACHE_PERIOD_SEC")
            .ok()
            .map(|s| s.parse().context("parse FROST_RESOURCE_CACHE_PERIOD_SEC"))
            .transpose()?
            .unwrap_or(10);

        let listen_port: u16 = std::env::var("FROST_PORT")
            .ok()
            .map(|s| s.parse().context("parse FROST_PORT"))
            .transpose()?
            .unwrap_or(8080);

        let metrics_port: u16 = std::env::var("FROST_METRICS_PORT")
            .ok()
            .map(|s| s.parse().context("parse FROST_METRICS_PORT"))
            .transpose()?
            .unwrap_or(9090);

        let over_commit_percent: u64 = std::env::var("FROST_OVER_COMMIT_PERCENT")
            .ok()
            .map(|s| s.parse().context("parse FROST_OVER_COMMIT_PERCENT"))
            .transpose()?
            .unwrap_or(100);

        let log_level = std::env::var("FROST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let cluster_enable = std::env::var("FROST_CLUSTER_ENABLE").as_deref() == Ok("true");
        let redis_hosts: Vec<String> = std::env::var("FROST_CLUSTER_REDIS_HOSTS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if cluster_enable && redis_hosts.is_empty() {
            bail!("FROST_CLUSTER_ENABLE is true but FROST_CLUSTER_REDIS_HOSTS is not set");
        }

        let scheduler_url = std::env::var("FROST_SCHEDULER_URL")
            .ok()
            .filter(|s| !s.is_empty());

        let rebind_requires_frozen =
            std::env::var("FROST_REBIND_REQUIRES_FROZEN").as_deref() != Ok("false");

        Ok(Self {
            hosts: Arc::new(hosts),
            resource_mapping,
            image_alias_map,
            cache_period: Duration::from_secs(cache_period_sec),
            listen_port,
            metrics_port,
            over_commit_percent,
            log_level,
            cluster_enable,
            redis_hosts,
            scheduler_url,
            rebind_requires_frozen,
        })
    }

    /// Resolve an OS version selector through the alias map. One level of
    /// indirection is followed; an unmapped selector resolves to the empty
    /// string (which matches no pool member).
    pub fn resolve_image_alias(&self, os_version: &str) -> String {
        self.resolve_alias_inner(os_version, 0)
    }

    fn resolve_alias_inner(&self, version: &str, depth: usize) -> String {
        if depth > 2 {
            return String::new();
        }
        if version.is_empty() {
            return self.resolve_alias_inner("default", depth + 1);
        }
        match self.image_alias_map.get(version) {
            Some(alias) if self.image_alias_map.contains_key(alias) => {
                self.resolve_alias_inner(alias, depth + 1)
            }
            Some(alias) => alias.clone(),
            None => String::new(),
        }
    }

    /// Resource requirements for a class; classes missing from the table
    /// fall back to 1 core / 1 GiB.
    pub fn resource_requirements(&self, resource_type: ResourceType) -> Result<(u64, u64)> {
        match self.resource_mapping.get(&resource_type) {
            Some(mapping) => {
                let memory = frost_lxd::parse_size(&mapping.memory)
                    .with_context(|| format!("memory size {:?}", mapping.memory))?;
                Ok((mapping.cpu, memory))
            }
            None => Ok((DEFAULT_CPU_CORES, DEFAULT_MEMORY_BYTES)),
        }
    }
}

fn parse_resource_mapping(raw: &str) -> Result<HashMap<ResourceType, Mapping>> {
    let entries: Vec<Mapping> =
        serde_json::from_str(raw).context("parse FROST_RESOURCE_TYPE_MAPPING")?;

    let mut mapping = HashMap::new();
    for entry in entries {
        let Some(resource_type) = resource_type_from_name(&entry.resource_type_name) else {
            bail!("{} is not a valid resource type", entry.resource_type_name);
        };
        mapping.insert(resource_type, entry);
    }
    Ok(mapping)
}

/// Resource class name as stamped into instance tags.
pub fn resource_type_name(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::Unknown => "unknown",
        ResourceType::Nano => "nano",
        ResourceType::Micro => "micro",
        ResourceType::Small => "small",
        ResourceType::Medium => "medium",
        ResourceType::Large => "large",
        ResourceType::Xlarge => "xlarge",
        ResourceType::Xlarge2 => "2xlarge",
        ResourceType::Xlarge3 => "3xlarge",
        ResourceType::Xlarge4 => "4xlarge",
    }
}

pub fn resource_type_from_name(name: &str) -> Option<ResourceType> {
    match name {
        "nano" => Some(ResourceType::Nano),
        "micro" => Some(ResourceType::Micro),
        "small" => Some(ResourceType::Small),
        "medium" => Some(ResourceType::Medium),
        "large" => Some(ResourceType::Large),
        "xlarge" => Some(ResourceType::Xlarge),
        "2xlarge" => Some(ResourceType::Xlarge2),
        "3xlarge" => Some(ResourceType::Xlarge3),
        "4xlarge" => Some(ResourceType::Xlarge4),
        _ => None,
    }
}
