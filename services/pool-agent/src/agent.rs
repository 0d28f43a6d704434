//! The pool reconciler.
//!
//! Every tick the agent compares the observed frozen pool on its host
//! against the declared pool size per image and resource class, schedules
//! builds for any shortfall, and sweeps zombies, stale-image instances,
//! and instances of classes that are no longer configured.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info};

use frost_lxd::{
    parse_image_alias, HostClient, Instance, InstanceSource, StateAction,
    CONFIG_KEY_BASE_IMAGE, CONFIG_KEY_IMAGE_ALIAS, CONFIG_KEY_RESOURCE_TYPE,
    CONFIG_KEY_RUNNER_NAME,
};

use crate::config::{Config, ImageConfig, Params, ResourceTypeSpec};
use crate::create;
use crate::featureflag::FeatureFlags;
use crate::metrics;

/// Upper bound on concurrent instance builds.
pub const CONCURRENT_CREATE_LIMIT: usize = 3;

/// The image hash currently considered canonical for an alias. Rolling
/// image updates are discovered by observing a newer base hash.
#[derive(Debug, Clone)]
pub struct CurrentImage {
    pub hash: String,
    pub created_at: DateTime<Utc>,
}

impl Default for CurrentImage {
    fn default() -> Self {
        Self {
            hash: String::new(),
            created_at: DateTime::<Utc>::MIN_UTC,
        }
    }
}

/// Per-image reconciler state.
pub struct ImageState {
    pub config: ImageConfig,
    pub source: InstanceSource,
    /// Names of instances currently being built, per resource class.
    pub creating: HashMap<String, HashSet<String>>,
    pub current_image: CurrentImage,
}

impl ImageState {
    pub fn new(config: ImageConfig) -> Result<Self> {
        let mut source = parse_image_alias(&config.image_alias)
            .map_err(|e| anyhow!("parse image alias {:?}: {e}", config.image_alias))?;
        // The alias names an image already present on the host.
        source.server = String::new();

        Ok(Self {
            config,
            source,
            creating: HashMap::new(),
            current_image: CurrentImage::default(),
        })
    }
}

pub struct AgentState {
    pub images: HashMap<String, ImageState>,
    pub resource_types_map: HashMap<String, ResourceTypeSpec>,
    pub deleting: HashSet<String>,
}

struct CreateJob {
    image_key: String,
    class: String,
    name: String,
    spec: ResourceTypeSpec,
    image_alias: String,
    source: InstanceSource,
}

pub struct Agent {
    client: Arc<dyn HostClient>,
    state: Arc<Mutex<AgentState>>,
    params: Params,
    flags: FeatureFlags,
    create_limit: Arc<Semaphore>,
    config_path: PathBuf,
}

impl Agent {
    pub fn new(
        client: Arc<dyn HostClient>,
        config: Config,
        params: Params,
        flags: FeatureFlags,
        config_path: PathBuf,
    ) -> Result<Self> {
        let mut images = HashMap::new();
        for (key, image_config) in config.images {
            metrics::record_configured(&image_config);
            images.insert(key, ImageState::new(image_config)?);
        }

        Ok(Self {
            client,
            state: Arc::new(Mutex::new(AgentState {
                images,
                resource_types_map: config.resource_types_map,
                deleting: HashSet::new(),
            })),
            params,
            flags,
            create_limit: Arc::new(Semaphore::new(CONCURRENT_CREATE_LIMIT)),
            config_path,
        })
    }

    /// Reconcile until shutdown; SIGHUP reloads the config file. In-flight
    /// builds are allowed to finish before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut sighup =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
                .context("install SIGHUP handler")?;
        let mut ticker = tokio::time::interval(self.params.check_interval);

        info!("started pool agent");
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("received SIGHUP, reloading config");
                    if let Err(e) = self.reload_config().await {
                        error!(error = %e, "failed to reload config");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.adjust_pool().await {
                        error!(error = %e, "failed to adjust instance pool");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("waiting for in-flight builds");
        let _ = self
            .create_limit
            .acquire_many(CONCURRENT_CREATE_LIMIT as u32)
            .await;
        info!("pool agent stopped");
        Ok(())
    }

    /// Publish per-instance metrics to the textfile every tick.
    pub async fn run_metrics(&self, path: PathBuf, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.params.check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    debug!("collecting metrics");
                    match self.client.list_instances().await {
                        Ok(instances) => {
                            metrics::record_instances(&instances);
                            if let Err(e) = metrics::write_textfile(&path) {
                                error!(error = %e, "failed to write metrics");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to collect metrics"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("stopping metrics collection");
                        return;
                    }
                }
            }
        }
    }

    /// Re-read the config file. Existing images keep their state and get
    /// the new config in place; new images get fresh state. Builds in
    /// flight are never interrupted.
    pub async fn reload_config(&self) -> Result<()> {
        let config = Config::load(&self.config_path)?;

        let mut state = self.state.lock().await;
        for (key, image_config) in config.images {
            metrics::record_configured(&image_config);
            match state.images.get_mut(&key) {
                Some(image) => {
                    image.source = ImageState::new(image_config.clone())?.source;
                    image.config = image_config;
                }
                None => {
                    state.images.insert(key, ImageState::new(image_config)?);
                }
            }
        }
        state.resource_types_map = config.resource_types_map;
        Ok(())
    }

    /// One reconciliation pass.
    pub async fn adjust_pool(&self) -> Result<()> {
        let instances = self.client.list_instances().await.context("get instances")?;

        let mut create_plan: Vec<CreateJob> = Vec::new();
        let mut to_delete: Vec<Instance> = Vec::new();
        {
            let mut state = self.state.lock().await;
            let resource_types = collect_resource_types(&state.images, &instances);
            let image_keys: Vec<String> = state.images.keys().cloned().collect();

            for key in image_keys {
                let mut disabled: Vec<String> = Vec::new();
                for class in &resource_types {
                    let image = state.images.get(&key).expect("image key just listed");
                    match calculate_create_count(image, &instances, class, self.flags) {
                        None => disabled.push(class.clone()),
                        Some(shortfall) if shortfall > 0 => {
                            let Some(spec) = state.resource_types_map.get(class) else {
                                error!(class = %class, "resource class has no shape configured");
                                continue;
                            };
                            for _ in 0..shortfall {
                                create_plan.push(CreateJob {
                                    image_key: key.clone(),
                                    class: class.clone(),
                                    name: generate_instance_name(),
                                    spec: spec.clone(),
                                    image_alias: image.config.image_alias.clone(),
                                    source: image.source.clone(),
                                });
                            }
                        }
                        Some(_) => {}
                    }
                }

                let image = state.images.get_mut(&key).expect("image key just listed");
                to_delete.extend(calculate_to_delete(
                    image,
                    &instances,
                    &disabled,
                    self.params.zombie_allow_time,
                    Utc::now(),
                ));
            }

            // Track names before spawning so the zombie sweep skips them.
            for job in &create_plan {
                state
                    .images
                    .get_mut(&job.image_key)
                    .expect("image key just listed")
                    .creating
                    .entry(job.class.clone())
                    .or_default()
                    .insert(job.name.clone());
            }
        }

        self.delete_instances(to_delete).await;
        self.spawn_creates(create_plan);

        Ok(())
    }

    async fn delete_instances(&self, to_delete: Vec<Instance>) {
        let mut jobs = Vec::new();
        {
            let mut state = self.state.lock().await;
            for instance in to_delete {
                if state.deleting.contains(&instance.name) {
                    debug!(instance = %instance.name, "instance is already deleting");
                    continue;
                }
                state.deleting.insert(instance.name.clone());
                jobs.push(instance);
            }
        }

        join_all(jobs.into_iter().map(|instance| self.delete_one(instance))).await;
    }

    async fn delete_one(&self, instance: Instance) {
        info!(instance = %instance.name, "deleting instance");

        let stop = self.client.set_state(&instance.name, StateAction::Stop).await;
        match stop {
            Ok(()) => {}
            Err(e) if e.is_already_stopped() => {}
            Err(e) => {
                error!(instance = %instance.name, error = %e, "failed to stop instance");
                self.finish_delete(&instance.name).await;
                return;
            }
        }

        match self.client.delete_instance(&instance.name).await {
            Ok(()) => info!(instance = %instance.name, "deleted instance"),
            Err(e) => error!(instance = %instance.name, error = %e, "failed to delete instance"),
        }
        self.finish_delete(&instance.name).await;
    }

    async fn finish_delete(&self, name: &str) {
        self.state.lock().await.deleting.remove(name);
    }

    fn spawn_creates(&self, jobs: Vec<CreateJob>) {
        for job in jobs {
            let client = self.client.clone();
            let state = self.state.clone();
            let create_limit = self.create_limit.clone();
            let wait_idle = self.params.wait_idle_time;

            tokio::spawn(async move {
                let Ok(_permit) = create_limit.acquire().await else {
                    return;
                };

                let result = create::build_instance(
                    client.as_ref(),
                    &job.name,
                    &job.class,
                    &job.spec,
                    &job.image_alias,
                    &job.source,
                    wait_idle,
                )
                .await;
                if let Err(e) = result {
                    // The half-built instance is left behind; the zombie
                    // sweep collects it.
                    error!(instance = %job.name, error = %e, "failed to create instance");
                }

                let mut state = state.lock().await;
                if let Some(image) = state.images.get_mut(&job.image_key) {
                    if let Some(names) = image.creating.get_mut(&job.class) {
                        names.remove(&job.name);
                    }
                }
            });
        }
    }
}

/// A fresh random pool instance name.
pub fn generate_instance_name() -> String {
    format!("myshoes-runner-{:08x}", rand::random::<u32>())
}

/// Whether an instance currently counts toward the pool for this class
/// and image.
pub fn is_pooled_instance(
    instance: &Instance,
    class: &str,
    image_alias: &str,
    flags: FeatureFlags,
) -> bool {
    let status_counts = if flags.count_without_running {
        instance.status.is_frozen()
    } else {
        instance.status.is_frozen() || instance.status.is_running()
    };

    status_counts
        && instance.config_get(CONFIG_KEY_RESOURCE_TYPE) == Some(class)
        && instance.config_get(CONFIG_KEY_IMAGE_ALIAS) == Some(image_alias)
        && !instance
            .config_get(CONFIG_KEY_RUNNER_NAME)
            .is_some_and(|name| !name.is_empty())
}

pub fn count_pooled(
    instances: &[Instance],
    class: &str,
    image_alias: &str,
    flags: FeatureFlags,
) -> usize {
    instances
        .iter()
        .filter(|i| is_pooled_instance(i, class, image_alias, flags))
        .count()
}

/// Union of configured classes and classes observed on instances.
pub fn collect_resource_types(
    images: &HashMap<String, ImageState>,
    instances: &[Instance],
) -> Vec<String> {
    let mut types: Vec<String> = Vec::new();
    for image in images.values() {
        for class in image.config.resource_types_counts.keys() {
            if !types.contains(class) {
                types.push(class.clone());
            }
        }
    }
    for instance in instances {
        if let Some(class) = instance.config_get(CONFIG_KEY_RESOURCE_TYPE) {
            if !class.is_empty() && !types.iter().any(|t| t == class) {
                types.push(class.to_string());
            }
        }
    }
    types
}

/// Shortfall for one (image, class). `None` marks a disabled class: the
/// class appears on instances but is not configured (or configured to 0).
pub fn calculate_create_count(
    image: &ImageState,
    instances: &[Instance],
    class: &str,
    flags: FeatureFlags,
) -> Option<i64> {
    let desired = *image.config.resource_types_counts.get(class)?;
    if desired == 0 {
        return None;
    }

    let creating = image.creating.get(class).map_or(0, HashSet::len);
    let pooled = count_pooled(instances, class, &image.config.image_alias, flags);
    Some(desired as i64 - pooled as i64 - creating as i64)
}

/// A zombie is an unclaimed, non-frozen instance past the allowance and
/// not currently being built. An empty runner name counts as unclaimed.
pub fn is_zombie_instance(
    image: &ImageState,
    instance: &Instance,
    zombie_allow: std::time::Duration,
    now: DateTime<Utc>,
) -> bool {
    if instance.status.is_frozen() {
        return false;
    }
    if instance
        .config_get(CONFIG_KEY_RUNNER_NAME)
        .is_some_and(|name| !name.is_empty())
    {
        return false;
    }
    if instance.config_get(CONFIG_KEY_IMAGE_ALIAS) != Some(image.config.image_alias.as_str()) {
        return false;
    }
    let allowance = chrono::Duration::from_std(zombie_allow).expect("zombie allowance in range");
    if instance.created_at + allowance > now {
        return false;
    }
    let Some(class) = instance.config_get(CONFIG_KEY_RESOURCE_TYPE) else {
        return false;
    };
    if image
        .creating
        .get(class)
        .is_some_and(|names| names.contains(&instance.name))
    {
        return false;
    }
    true
}

/// Check one instance against the image's canonical hash. A frozen
/// instance predating the canonical image is stale (delete it); an
/// instance carrying a *newer* hash promotes that hash to canonical.
pub fn check_old_image(image: &mut ImageState, instance: &Instance) -> Result<bool> {
    let Some(base_image) = instance.config_get(CONFIG_KEY_BASE_IMAGE) else {
        return Err(anyhow!("instance {} has no volatile.base_image", instance.name));
    };
    if instance.config_get(CONFIG_KEY_IMAGE_ALIAS) != Some(image.config.image_alias.as_str()) {
        return Ok(false);
    }

    if base_image != image.current_image.hash {
        if instance.created_at < image.current_image.created_at {
            return Ok(instance.status.is_frozen());
        }
        image.current_image = CurrentImage {
            hash: base_image.to_string(),
            created_at: instance.created_at,
        };
    }
    Ok(false)
}

/// Everything on this image that must go: zombies, stale-image instances,
/// and members of disabled classes.
pub fn calculate_to_delete(
    image: &mut ImageState,
    instances: &[Instance],
    disabled_classes: &[String],
    zombie_allow: std::time::Duration,
    now: DateTime<Utc>,
) -> Vec<Instance> {
    let mut to_delete = Vec::new();

    for instance in instances {
        let class = instance.config_get(CONFIG_KEY_RESOURCE_TYPE).unwrap_or("");
        if class.is_empty()
            || instance.config_get(CONFIG_KEY_IMAGE_ALIAS)
                != Some(image.config.image_alias.as_str())
        {
            continue;
        }

        if is_zombie_instance(image, instance, zombie_allow, now) {
            to_delete.push(instance.clone());
            continue;
        }

        match check_old_image(image, instance) {
            Ok(true) => {
                to_delete.push(instance.clone());
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                error!(instance = %instance.name, error = %e, "failed to check image age");
            }
        }

        if disabled_classes.iter().any(|d| d == class) {
            to_delete.push(instance.clone());
        }
    }

    to_delete
}

#[cfg(test)]
mod tests {
    use super::*;
    use frost_lxd::InstanceStatus;

    fn image_state(alias: &str, counts: &[(&str, usize)]) -> ImageState {
        ImageState::new(ImageConfig {
            image_alias: alias.to_string(),
            resource_types_counts: counts
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        })
        .unwrap()
    }

    fn instance(
        name: &str,
        status: InstanceStatus,
        class: &str,
        alias: &str,
        runner: Option<&str>,
    ) -> Instance {
        let mut config: HashMap<String, String> = HashMap::new();
        config.insert(CONFIG_KEY_RESOURCE_TYPE.to_string(), class.to_string());
        config.insert(CONFIG_KEY_IMAGE_ALIAS.to_string(), alias.to_string());
        if let Some(runner) = runner {
            config.insert(CONFIG_KEY_RUNNER_NAME.to_string(), runner.to_string());
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

    fn fixture() -> Vec<Instance> {
        vec![
            instance(
                "claimed_running",
                InstanceStatus::Running,
                "typeA",
                "ubuntu:focal",
                Some("runner1"),
            ),
            instance(
                "available_frozen",
                InstanceStatus::Frozen,
                "typeB",
                "ubuntu:focal",
                Some(""),
            ),
            instance(
                "broken_running",
                InstanceStatus::Running,
                "typeC",
                "ubuntu:focal",
                Some(""),
            ),
            instance(
                "disabled_frozen",
                InstanceStatus::Frozen,
                "typeD",
                "ubuntu:focal",
                Some(""),
            ),
        ]
    }

    #[test]
    fn test_count_pooled_ignores_claimed_and_other_images() {
        let instances = fixture();
        let flags = FeatureFlags::default();

        assert_eq!(count_pooled(&instances, "typeA", "ubuntu:focal", flags), 0);
        assert_eq!(count_pooled(&instances, "typeB", "ubuntu:focal", flags), 1);
        assert_eq!(count_pooled(&instances, "typeB", "ubuntu:noble", flags), 0);
    }

    #[test]
    fn test_count_pooled_with_count_without_running() {
        let instances = fixture();
        let flags = FeatureFlags {
            count_without_running: true,
        };

        // broken_running is unclaimed but running, so it no longer counts
        assert_eq!(count_pooled(&instances, "typeC", "ubuntu:focal", flags), 0);
        assert_eq!(count_pooled(&instances, "typeB", "ubuntu:focal", flags), 1);
    }

    #[test]
    fn test_calculate_create_count() {
        let instances = fixture();
        let flags = FeatureFlags::default();
        let mut image = image_state("ubuntu:focal", &[("typeA", 2), ("typeB", 1), ("typeC", 0)]);

        assert_eq!(
            calculate_create_count(&image, &instances, "typeA", flags),
            Some(2)
        );
        assert_eq!(
            calculate_create_count(&image, &instances, "typeB", flags),
            Some(0)
        );
        // configured to zero means disabled
        assert_eq!(calculate_create_count(&image, &instances, "typeC", flags), None);
        // unknown class means disabled
        assert_eq!(calculate_create_count(&image, &instances, "typeD", flags), None);

        // in-flight builds count against the shortfall
        image
            .creating
            .entry("typeA".to_string())
            .or_default()
            .insert("myshoes-runner-00000001".to_string());
        assert_eq!(
            calculate_create_count(&image, &instances, "typeA", flags),
            Some(1)
        );
    }

    #[test]
    fn test_collect_resource_types_includes_observed() {
        let mut images = HashMap::new();
        images.insert(
            "focal".to_string(),
            image_state("ubuntu:focal", &[("typeA", 2)]),
        );
        let types = collect_resource_types(&images, &fixture());

        assert!(types.iter().any(|t| t == "typeA"));
        assert!(types.iter().any(|t| t == "typeD"));
    }

    #[test]
    fn test_zombie_detection() {
        let mut image = image_state("ubuntu:focal", &[("typeA", 2)]);
        let allow = std::time::Duration::from_secs(300);
        let now = Utc::now();

        let mut old_unclaimed = instance(
            "zombie",
            InstanceStatus::Stopped,
            "typeA",
            "ubuntu:focal",
            Some(""),
        );
        old_unclaimed.created_at = now - chrono::Duration::seconds(600);
        assert!(is_zombie_instance(&image, &old_unclaimed, allow, now));

        // too young
        let young = instance("young", InstanceStatus::Stopped, "typeA", "ubuntu:focal", None);
        assert!(!is_zombie_instance(&image, &young, allow, now));

        // claimed
        let mut claimed = old_unclaimed.clone();
        claimed
            .config
            .insert(CONFIG_KEY_RUNNER_NAME.to_string(), "runner1".to_string());
        assert!(!is_zombie_instance(&image, &claimed, allow, now));

        // frozen pool members are never zombies
        let mut frozen = old_unclaimed.clone();
        frozen.status = InstanceStatus::Frozen;
        assert!(!is_zombie_instance(&image, &frozen, allow, now));

        // currently building
        image
            .creating
            .entry("typeA".to_string())
            .or_default()
            .insert("zombie".to_string());
        assert!(!is_zombie_instance(&image, &old_unclaimed, allow, now));
    }

    #[test]
    fn test_image_promotion_and_stale_sweep() {
        let mut image = image_state("ubuntu:focal", &[("typeA", 2)]);
        let now = Utc::now();

        let mut old = instance("old", InstanceStatus::Frozen, "typeA", "ubuntu:focal", None);
        old.created_at = now - chrono::Duration::seconds(600);
        old.config
            .insert(CONFIG_KEY_BASE_IMAGE.to_string(), "hash-old".to_string());

        // first sighting promotes hash-old to canonical
        assert!(!check_old_image(&mut image, &old).unwrap());
        assert_eq!(image.current_image.hash, "hash-old");

        let mut newer = instance("new", InstanceStatus::Frozen, "typeA", "ubuntu:focal", None);
        newer.created_at = now;
        newer
            .config
            .insert(CONFIG_KEY_BASE_IMAGE.to_string(), "hash-new".to_string());

        // a newer hash promotes again
        assert!(!check_old_image(&mut image, &newer).unwrap());
        assert_eq!(image.current_image.hash, "hash-new");
        assert_eq!(image.current_image.created_at, newer.created_at);

        // now the old frozen instance is stale
        assert!(check_old_image(&mut image, &old).unwrap());

        // but a non-frozen old instance is not swept by the image check
        let mut old_running = old.clone();
        old_running.status = InstanceStatus::Running;
        assert!(!check_old_image(&mut image, &old_running).unwrap());
    }

    #[test]
    fn test_calculate_to_delete_disabled_classes() {
        let mut image = image_state("ubuntu:focal", &[("typeA", 2), ("typeB", 1)]);
        let instances = fixture();
        let allow = std::time::Duration::from_secs(300);

        let to_delete = calculate_to_delete(
            &mut image,
            &instances,
            &["typeC".to_string(), "typeD".to_string()],
            allow,
            Utc::now(),
        );

        let names: Vec<&str> = to_delete.iter().map(|i| i.name.as_str()).collect();
        assert!(names.contains(&"disabled_frozen"));
        assert!(names.contains(&"broken_running"));
        assert!(!names.contains(&"available_frozen"));
        assert!(!names.contains(&"claimed_running"));
    }

    #[test]
    fn test_generate_instance_name_shape() {
        let name = generate_instance_name();
        assert!(name.starts_with("myshoes-runner-"));
        assert_eq!(name.len(), "myshoes-runner-".len() + 8);
    }
}
