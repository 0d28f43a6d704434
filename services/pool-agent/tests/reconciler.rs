//! Integration tests for the reconciliation loop, driven against a
//! stateful mock host.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use frost_lxd::{
    ExecResult, HostClient, HostConfig, Instance, InstancePut, InstanceSpec, InstanceStatus,
    LxdError, ServerResources, StateAction, CONFIG_KEY_BASE_IMAGE, CONFIG_KEY_IMAGE_ALIAS,
    CONFIG_KEY_RESOURCE_TYPE, CONFIG_KEY_RUNNER_NAME,
};
use frost_pool_agent::agent::Agent;
use frost_pool_agent::config::{Config, ImageConfig, Params, ResourceTypeSpec};
use frost_pool_agent::featureflag::FeatureFlags;

/// Mock host that tracks instance lifecycle like a real one.
struct MockHost {
    instances: Mutex<HashMap<String, Instance>>,
}

impl MockHost {
    fn new(instances: Vec<Instance>) -> Self {
        Self {
            instances: Mutex::new(instances.into_iter().map(|i| (i.name.clone(), i)).collect()),
        }
    }

    fn names_with_class(&self, class: &str) -> Vec<String> {
        self.instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.config.get(CONFIG_KEY_RESOURCE_TYPE).map(String::as_str) == Some(class))
            .map(|i| i.name.clone())
            .collect()
    }

    fn frozen_count(&self, class: &str) -> usize {
        self.instances
            .lock()
            .unwrap()
            .values()
            .filter(|i| {
                i.status == InstanceStatus::Frozen
                    && i.config.get(CONFIG_KEY_RESOURCE_TYPE).map(String::as_str) == Some(class)
            })
            .count()
    }

    fn contains(&self, name: &str) -> bool {
        self.instances.lock().unwrap().contains_key(name)
    }
}

#[async_trait]
impl HostClient for MockHost {
    async fn list_instances(&self) -> Result<Vec<Instance>, LxdError> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn get_instance(&self, name: &str) -> Result<(Instance, String), LxdError> {
        self.instances
            .lock()
            .unwrap()
            .get(name)
            .map(|i| (i.clone(), "1".to_string()))
            .ok_or(LxdError::NotFound)
    }

    async fn update_instance(
        &self,
        name: &str,
        put: InstancePut,
        _etag: &str,
    ) -> Result<(), LxdError> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(name).ok_or(LxdError::NotFound)?;
        instance.config = put.config;
        Ok(())
    }

    async fn set_state(&self, name: &str, action: StateAction) -> Result<(), LxdError> {
        let mut instances = self.instances.lock().unwrap();
        let instance = instances.get_mut(name).ok_or(LxdError::NotFound)?;
        if action == StateAction::Stop && instance.status == InstanceStatus::Stopped {
            return Err(LxdError::Operation(
                "The instance is already stopped".to_string(),
            ));
        }
        instance.status = match action {
            StateAction::Start | StateAction::Unfreeze => InstanceStatus::Running,
            StateAction::Stop => InstanceStatus::Stopped,
            StateAction::Freeze => InstanceStatus::Frozen,
        };
        Ok(())
    }

    async fn create_instance(&self, spec: &InstanceSpec) -> Result<(), LxdError> {
        let mut config = spec.config.clone();
        config.insert(CONFIG_KEY_BASE_IMAGE.to_string(), "hash-current".to_string());
        let instance = Instance {
            name: spec.name.clone(),
            status: InstanceStatus::Stopped,
            created_at: Utc::now(),
            config,
            devices: spec.devices.clone(),
            profiles: Vec::new(),
            ephemeral: false,
        };
        self.instances
            .lock()
            .unwrap()
            .insert(spec.name.clone(), instance);
        Ok(())
    }

    async fn delete_instance(&self, name: &str) -> Result<(), LxdError> {
        self.instances
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or(LxdError::NotFound)
    }

    async fn push_file(
        &self,
        _instance: &str,
        _path: &str,
        _data: &[u8],
        _mode: u32,
    ) -> Result<(), LxdError> {
        Ok(())
    }

    async fn exec(&self, _instance: &str, _command: &[String]) -> Result<ExecResult, LxdError> {
        Ok(ExecResult::default())
    }

    async fn server_resources(&self) -> Result<ServerResources, LxdError> {
        Ok(ServerResources {
            cpu_total: 64,
            memory_total: 128_000_000_000,
            hostname: "mock".to_string(),
        })
    }
}

fn frozen_member(name: &str, class: &str, base_image: &str, age_secs: i64) -> Instance {
    Instance {
        name: name.to_string(),
        status: InstanceStatus::Frozen,
        created_at: Utc::now() - TimeDelta::seconds(age_secs),
        config: HashMap::from([
            (CONFIG_KEY_RESOURCE_TYPE.to_string(), class.to_string()),
            (CONFIG_KEY_IMAGE_ALIAS.to_string(), "ubuntu:focal".to_string()),
            (CONFIG_KEY_BASE_IMAGE.to_string(), base_image.to_string()),
        ]),
        devices: HashMap::new(),
        profiles: Vec::new(),
        ephemeral: false,
    }
}

fn test_params() -> Params {
    Params {
        check_interval: Duration::from_secs(5),
        wait_idle_time: Duration::ZERO,
        zombie_allow_time: Duration::from_secs(300),
        host: HostConfig {
            host: "https://mock:8443".to_string(),
            client_cert: String::new(),
            client_key: String::new(),
        },
    }
}

fn test_config(counts: &[(&str, usize)]) -> Config {
    Config {
        resource_types_map: HashMap::from([
            (
                "large".to_string(),
                ResourceTypeSpec {
                    cpu: 4,
                    memory: "8GB".to_string(),
                },
            ),
            (
                "2xlarge".to_string(),
                ResourceTypeSpec {
                    cpu: 8,
                    memory: "16GB".to_string(),
                },
            ),
        ]),
        images: HashMap::from([(
            "focal".to_string(),
            ImageConfig {
                image_alias: "ubuntu:focal".to_string(),
                resource_types_counts: counts
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect(),
            },
        )]),
    }
}

fn agent(mock: Arc<MockHost>, counts: &[(&str, usize)]) -> Agent {
    Agent::new(
        mock,
        test_config(counts),
        test_params(),
        FeatureFlags::default(),
        PathBuf::from("/nonexistent/pool-agent.toml"),
    )
    .unwrap()
}

/// Give spawned build tasks time to finish.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_pool_floor_replenishes_to_desired_count() {
    let mock = Arc::new(MockHost::new(vec![]));
    let agent = agent(mock.clone(), &[("large", 2)]);

    agent.adjust_pool().await.unwrap();
    settle().await;

    assert_eq!(mock.frozen_count("large"), 2);

    // steady state: another tick neither creates nor deletes
    agent.adjust_pool().await.unwrap();
    settle().await;
    assert_eq!(mock.frozen_count("large"), 2);
}

#[tokio::test]
async fn test_disabled_class_cleanup() {
    let mock = Arc::new(MockHost::new(vec![
        frozen_member("stale-1", "2xlarge", "hash-current", 60),
        frozen_member("stale-2", "2xlarge", "hash-current", 60),
        frozen_member("stale-3", "2xlarge", "hash-current", 60),
    ]));
    let agent = agent(mock.clone(), &[("large", 2)]);

    agent.adjust_pool().await.unwrap();
    settle().await;
    agent.adjust_pool().await.unwrap();
    settle().await;

    assert!(mock.names_with_class("2xlarge").is_empty());
    assert_eq!(mock.frozen_count("large"), 2);
}

#[tokio::test]
async fn test_stale_image_sweep_after_promotion() {
    let mut members: Vec<Instance> = (0..5)
        .map(|n| frozen_member(&format!("old-{n}"), "large", "hash-old", 600))
        .collect();
    members.push(frozen_member("fresh", "large", "hash-new", 0));
    let mock = Arc::new(MockHost::new(members));
    let agent = agent(mock.clone(), &[("large", 1)]);

    // first tick discovers the rolling update, later ticks sweep
    agent.adjust_pool().await.unwrap();
    settle().await;
    agent.adjust_pool().await.unwrap();
    settle().await;

    for n in 0..5 {
        assert!(!mock.contains(&format!("old-{n}")), "old-{n} should be swept");
    }
    assert!(mock.contains("fresh"));
}

#[tokio::test]
async fn test_zombie_sweep() {
    let mut zombie = frozen_member("zombie", "large", "hash-current", 600);
    zombie.status = InstanceStatus::Stopped;
    zombie
        .config
        .insert(CONFIG_KEY_RUNNER_NAME.to_string(), String::new());
    let healthy = frozen_member("healthy", "large", "hash-current", 600);
    let mock = Arc::new(MockHost::new(vec![zombie, healthy]));
    let agent = agent(mock.clone(), &[("large", 1)]);

    agent.adjust_pool().await.unwrap();
    settle().await;

    assert!(!mock.contains("zombie"));
    assert!(mock.contains("healthy"));
}

#[tokio::test]
async fn test_reload_adds_new_image_without_touching_existing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pool-agent.toml");
    std::fs::write(
        &path,
        r#"
[resource_types_map.large]
cpu = 4
memory = "8GB"

[images.focal]
image_alias = "ubuntu:focal"
[images.focal.resource_types_counts]
large = 1

[images.noble]
image_alias = "ubuntu:noble"
[images.noble.resource_types_counts]
large = 1
"#,
    )
    .unwrap();

    let mock = Arc::new(MockHost::new(vec![frozen_member(
        "existing",
        "large",
        "hash-current",
        60,
    )]));
    let agent = Agent::new(
        mock.clone(),
        test_config(&[("large", 1)]),
        test_params(),
        FeatureFlags::default(),
        path,
    )
    .unwrap();

    agent.reload_config().await.unwrap();
    agent.adjust_pool().await.unwrap();
    settle().await;

    // the focal pool was already satisfied; the new noble image got one
    assert!(mock.contains("existing"));
    let noble_count = mock
        .instances
        .lock()
        .unwrap()
        .values()
        .filter(|i| {
            i.config.get(CONFIG_KEY_IMAGE_ALIAS).map(String::as_str) == Some("ubuntu:noble")
        })
        .count();
    assert_eq!(noble_count, 1);
}

#[tokio::test]
async fn test_claimed_instance_is_not_swept() {
    let mut claimed = frozen_member("claimed", "large", "hash-current", 600);
    claimed.status = InstanceStatus::Running;
    claimed.config.insert(
        CONFIG_KEY_RUNNER_NAME.to_string(),
        "11111111-1111-1111-1111-111111111111".to_string(),
    );
    let mock = Arc::new(MockHost::new(vec![claimed]));
    let agent = agent(mock.clone(), &[("large", 1)]);

    agent.adjust_pool().await.unwrap();
    settle().await;

    // the claimed runner survives and a replacement refills the pool
    assert!(mock.contains("claimed"));
    assert_eq!(mock.frozen_count("large"), 1);
}
