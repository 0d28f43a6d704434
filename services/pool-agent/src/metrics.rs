//! Textfile metrics for the node-exporter textfile collector.

use std::path::Path;
use std::sync::OnceLock;

use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

use frost_lxd::{Instance, CONFIG_KEY_IMAGE_ALIAS, CONFIG_KEY_RESOURCE_TYPE, CONFIG_KEY_RUNNER_NAME};

use crate::config::ImageConfig;

pub struct Metrics {
    pub registry: Registry,
    pub configured_instances_count: IntGaugeVec,
    pub instances: IntGaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let configured_instances_count = IntGaugeVec::new(
            Opts::new(
                "configured_instances_count",
                "Declared pool size per class and image.",
            )
            .namespace("pool_agent"),
            &["flavor", "image_alias"],
        )
        .expect("valid metric");
        registry
            .register(Box::new(configured_instances_count.clone()))
            .expect("metric registered once");

        let instances = IntGaugeVec::new(
            Opts::new("instances", "Instances observed on this host.").namespace("pool_agent"),
            &["flavor", "image_alias", "name", "runner_name", "status"],
        )
        .expect("valid metric");
        registry
            .register(Box::new(instances.clone()))
            .expect("metric registered once");

        Self {
            registry,
            configured_instances_count,
            instances,
        }
    }
}

pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

pub fn record_configured(config: &ImageConfig) {
    for (class, count) in &config.resource_types_counts {
        metrics()
            .configured_instances_count
            .with_label_values(&[class, &config.image_alias])
            .set(*count as i64);
    }
}

pub fn record_instances(instances: &[Instance]) {
    let gauge = &metrics().instances;
    gauge.reset();
    for instance in instances {
        gauge
            .with_label_values(&[
                instance.config_get(CONFIG_KEY_RESOURCE_TYPE).unwrap_or(""),
                instance.config_get(CONFIG_KEY_IMAGE_ALIAS).unwrap_or(""),
                &instance.name,
                instance.config_get(CONFIG_KEY_RUNNER_NAME).unwrap_or(""),
                instance.status.as_str(),
            ])
            .set(1);
    }
}

/// Write the families to the textfile path, atomically via rename.
pub fn write_textfile(path: &Path) -> anyhow::Result<()> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metrics().registry.gather(), &mut buffer)?;

    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, &buffer)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
