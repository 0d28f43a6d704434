//! Pool agent configuration: a TOML file for the pool layout, environment
//! variables for host access and tunables.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use frost_lxd::HostConfig;

/// Per-class instance shape.
#[derive(Debug, Clone, Deserialize)]
pub struct ResourceTypeSpec {
    pub cpu: u64,
    pub memory: String,
}

/// Pool layout for one image.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub image_alias: String,
    #[serde(default)]
    pub resource_types_counts: HashMap<String, usize>,
}

/// The TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub resource_types_map: HashMap<String, ResourceTypeSpec>,
    #[serde(default)]
    pub images: HashMap<String, ImageConfig>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw).context("parse config file")?;
        if config.images.is_empty() {
            bail!("config has no images");
        }
        Ok(config)
    }
}

/// Tunables read from the environment.
#[derive(Debug, Clone)]
pub struct Params {
    pub check_interval: Duration,
    pub wait_idle_time: Duration,
    pub zombie_allow_time: Duration,
    pub host: HostConfig,
}

impl Params {
    pub fn from_env() -> Result<Self> {
        let check_interval = duration_env("FROST_CHECK_INTERVAL", Duration::from_secs(5))?;
        let wait_idle_time = duration_env("FROST_WAIT_IDLE_TIME", Duration::from_secs(5))?;
        let zombie_allow_time =
            duration_env("FROST_ZOMBIE_ALLOW_TIME", Duration::from_secs(300))?;

        let host = std::env::var("FROST_AGENT_HOST").context("FROST_AGENT_HOST is not set")?;
        let cert_path = std::env::var("FROST_AGENT_CLIENT_CERT")
            .context("FROST_AGENT_CLIENT_CERT is not set")?;
        let key_path = std::env::var("FROST_AGENT_CLIENT_KEY")
            .context("FROST_AGENT_CLIENT_KEY is not set")?;
        let client_cert =
            std::fs::read_to_string(&cert_path).with_context(|| format!("read {cert_path}"))?;
        let client_key =
            std::fs::read_to_string(&key_path).with_context(|| format!("read {key_path}"))?;

        Ok(Self {
            check_interval,
            wait_idle_time,
            zombie_allow_time,
            host: HostConfig {
                host,
                client_cert,
                client_key,
            },
        })
    }
}

fn duration_env(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => {
            parse_duration(&raw).with_context(|| format!("parse {name}"))
        }
        _ => Ok(default),
    }
}

/// Parse `90s` / `5m` / `2h` style durations; bare digits are seconds.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(split) => raw.split_at(split),
        None => (raw, "s"),
    };
    let value: u64 = number
        .parse()
        .with_context(|| format!("duration {raw:?}"))?;

    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        _ => bail!("duration {raw:?} has unknown unit {unit:?}"),
    };
    Ok(Duration::from_secs(seconds))
}
