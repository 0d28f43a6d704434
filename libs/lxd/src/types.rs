//! Wire types for the LXD REST API, trimmed to what frost needs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LxdError;

/// Config key carrying the resource class name of a pooled instance.
pub const CONFIG_KEY_RESOURCE_TYPE: &str = "pool.resource_type";
/// Config key carrying the image alias of a pooled instance.
pub const CONFIG_KEY_IMAGE_ALIAS: &str = "pool.image_alias";
/// Config key stamped onto an instance when it is claimed by a job.
/// Presence of this key is the atomic latch.
pub const CONFIG_KEY_RUNNER_NAME: &str = "pool.runner_name";
/// Config key recording when the claim happened (RFC3339).
pub const CONFIG_KEY_ALLOCATED_AT: &str = "pool.allocated_at";
/// Image content hash reported by the host.
pub const CONFIG_KEY_BASE_IMAGE: &str = "volatile.base_image";

/// Declared CPU limit of an instance.
pub const CONFIG_KEY_LIMITS_CPU: &str = "limits.cpu";
/// Declared memory limit of an instance (human-readable size).
pub const CONFIG_KEY_LIMITS_MEMORY: &str = "limits.memory";

/// Instance status as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum InstanceStatus {
    Running,
    Frozen,
    Freezing,
    Stopped,
    Error,
    #[serde(other)]
    #[default]
    Other,
}

impl InstanceStatus {
    pub fn is_frozen(&self) -> bool {
        matches!(self, InstanceStatus::Frozen)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, InstanceStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "Running",
            InstanceStatus::Frozen => "Frozen",
            InstanceStatus::Freezing => "Freezing",
            InstanceStatus::Stopped => "Stopped",
            InstanceStatus::Error => "Error",
            InstanceStatus::Other => "Other",
        }
    }
}

/// An instance as observed from a host. Records are host-owned; everyone
/// else sees immutable copies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub ephemeral: bool,
}

impl Instance {
    /// The mutable view sent back on update, mirroring what was fetched.
    pub fn writable(&self) -> InstancePut {
        InstancePut {
            config: self.config.clone(),
            devices: self.devices.clone(),
            profiles: self.profiles.clone(),
            ephemeral: self.ephemeral,
        }
    }

    pub fn config_get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(String::as_str)
    }
}

/// Mutable instance fields for `PUT /1.0/instances/{name}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstancePut {
    #[serde(default)]
    pub config: HashMap<String, String>,
    #[serde(default)]
    pub devices: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub profiles: Vec<String>,
    #[serde(default)]
    pub ephemeral: bool,
}

/// Where a new instance's root image comes from.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

/// Request body for `POST /1.0/instances`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub source: InstanceSource,
}

/// Lifecycle action for `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    Start,
    Stop,
    Freeze,
    Unfreeze,
}

impl StateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateAction::Start => "start",
            StateAction::Stop => "stop",
            StateAction::Freeze => "freeze",
            StateAction::Unfreeze => "unfreeze",
        }
    }
}

/// Outcome of an exec inside an instance.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

/// Host-wide totals; these do not change at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerResources {
    pub cpu_total: u64,
    pub memory_total: u64,
    pub hostname: String,
}

/// Parse a user-supplied image selector into an instance source.
///
/// Accepted forms:
/// - empty: the stock Ubuntu jammy image
/// - `https://<host>:8443/<alias>`: pull from a remote image server
/// - anything else: a local alias
pub fn parse_image_alias(input: &str) -> Result<InstanceSource, LxdError> {
    if input.is_empty() {
        return Ok(InstanceSource {
            kind: "image".to_string(),
            properties: HashMap::from([
                ("os".to_string(), "ubuntu".to_string()),
                ("release".to_string(), "jammy".to_string()),
            ]),
            ..Default::default()
        });
    }

    if input.starts_with("http") {
        let url = reqwest::Url::parse(input)
            .map_err(|e| LxdError::Invalid(format!("image alias URL {input:?}: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| LxdError::Invalid(format!("image alias URL {input:?} has no host")))?;
        let server = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };
        let alias = url.path().trim_start_matches('/').to_string();

        return Ok(InstanceSource {
            kind: "image".to_string(),
            mode: "pull".to_string(),
            server,
            alias,
            ..Default::default()
        });
    }

    Ok(InstanceSource {
        kind: "image".to_string(),
        alias: input.to_string(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_image_alias_empty() {
        let source = parse_image_alias("").unwrap();
        assert_eq!(source.kind, "image");
        assert_eq!(source.properties.get("os").unwrap(), "ubuntu");
        assert!(source.alias.is_empty());
    }

    #[test]
    fn test_parse_image_alias_remote() {
        let source = parse_image_alias("https://images.example.com:8443/ubuntu-ci").unwrap();
        assert_eq!(source.mode, "pull");
        assert_eq!(source.server, "https://images.example.com:8443");
        assert_eq!(source.alias, "ubuntu-ci");
    }

    #[test]
    fn test_parse_image_alias_local() {
        let source = parse_image_alias("focal-runner").unwrap();
        assert_eq!(source.alias, "focal-runner");
        assert!(source.server.is_empty());
    }

    #[test]
    fn test_instance_status_from_unknown_string() {
        let status: InstanceStatus = serde_json::from_str("\"Aborting\"").unwrap();
        assert_eq!(status, InstanceStatus::Other);
    }
}
