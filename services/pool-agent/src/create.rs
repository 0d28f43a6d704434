//! Instance builder: create, boot, wait for readiness, freeze.
//!
//! Any error aborts the build and leaves the half-built instance behind;
//! the zombie sweep is the backstop.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use frost_lxd::{
    HostClient, InstanceSource, InstanceSpec, StateAction, CONFIG_KEY_IMAGE_ALIAS,
    CONFIG_KEY_RESOURCE_TYPE,
};

use crate::config::ResourceTypeSpec;

fn build_config(class: &str, spec: &ResourceTypeSpec, image_alias: &str) -> HashMap<String, String> {
    HashMap::from([
        ("limits.cpu".to_string(), spec.cpu.to_string()),
        ("limits.memory".to_string(), spec.memory.clone()),
        // Runners launch containers of their own.
        ("security.nesting".to_string(), "true".to_string()),
        ("security.privileged".to_string(), "true".to_string()),
        (
            "raw.lxc".to_string(),
            [
                "lxc.apparmor.profile = unconfined",
                "lxc.cgroup.devices.allow = a",
                "lxc.cap.drop=",
            ]
            .join("\n"),
        ),
        (CONFIG_KEY_IMAGE_ALIAS.to_string(), image_alias.to_string()),
        (CONFIG_KEY_RESOURCE_TYPE.to_string(), class.to_string()),
    ])
}

fn build_devices() -> HashMap<String, HashMap<String, String>> {
    let unix_char = |path: &str| {
        HashMap::from([
            ("path".to_string(), path.to_string()),
            ("source".to_string(), path.to_string()),
            ("type".to_string(), "unix-char".to_string()),
        ])
    };
    HashMap::from([
        ("kmsg".to_string(), unix_char("/dev/kmsg")),
        ("kvm".to_string(), unix_char("/dev/kvm")),
    ])
}

pub async fn build_instance(
    client: &dyn HostClient,
    name: &str,
    class: &str,
    spec: &ResourceTypeSpec,
    image_alias: &str,
    source: &InstanceSource,
    wait_idle: Duration,
) -> Result<()> {
    info!(instance = %name, class = %class, "creating instance");
    client
        .create_instance(&InstanceSpec {
            name: name.to_string(),
            config: build_config(class, spec, image_alias),
            devices: build_devices(),
            source: source.clone(),
        })
        .await
        .context("create")?;

    info!(instance = %name, "starting instance");
    client
        .set_state(name, StateAction::Start)
        .await
        .context("start")?;

    info!(instance = %name, "waiting for system bus in instance");
    client
        .exec(
            name,
            &[
                "bash".to_string(),
                "-c".to_string(),
                "until test -e /var/run/dbus/system_bus_socket; do sleep 0.5; done".to_string(),
            ],
        )
        .await
        .context("wait system bus")?;

    info!(instance = %name, "waiting for system running");
    client
        .exec(
            name,
            &[
                "systemctl".to_string(),
                "is-system-running".to_string(),
                "--wait".to_string(),
            ],
        )
        .await
        .context("wait system running")?;

    info!(instance = %name, "disabling systemd service watchdogs");
    client
        .exec(
            name,
            &[
                "systemctl".to_string(),
                "service-watchdogs".to_string(),
                "no".to_string(),
            ],
        )
        .await
        .context("disable service watchdogs")?;

    info!(instance = %name, "waiting for instance idle");
    tokio::time::sleep(wait_idle).await;

    info!(instance = %name, "freezing instance");
    client
        .set_state(name, StateAction::Freeze)
        .await
        .context("freeze")?;

    info!(instance = %name, "created instance successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_config_carries_pool_tags() {
        let spec = ResourceTypeSpec {
            cpu: 4,
            memory: "8GB".to_string(),
        };
        let config = build_config("large", &spec, "ubuntu:focal");

        assert_eq!(config.get("limits.cpu").unwrap(), "4");
        assert_eq!(config.get("limits.memory").unwrap(), "8GB");
        assert_eq!(config.get(CONFIG_KEY_RESOURCE_TYPE).unwrap(), "large");
        assert_eq!(config.get(CONFIG_KEY_IMAGE_ALIAS).unwrap(), "ubuntu:focal");
        assert_eq!(config.get("security.nesting").unwrap(), "true");
        assert!(config.get("raw.lxc").unwrap().contains("lxc.cap.drop="));
    }

    #[test]
    fn test_build_devices_passes_kmsg_and_kvm() {
        let devices = build_devices();
        assert_eq!(devices.get("kmsg").unwrap().get("path").unwrap(), "/dev/kmsg");
        assert_eq!(devices.get("kvm").unwrap().get("type").unwrap(), "unix-char");
    }
}
