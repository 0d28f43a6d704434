//! Prometheus families exposed by the placement service.
//!
//! The metric names are contracts; dashboards key on them.

use std::collections::HashMap;
use std::sync::OnceLock;

use chrono::Utc;
use prometheus::{GaugeVec, IntGaugeVec, Opts, Registry};

use frost_lxd::Resource;

use crate::reservations::ReservationStats;

pub struct Metrics {
    pub registry: Registry,

    pub host_max_cpu: IntGaugeVec,
    pub host_max_memory: IntGaugeVec,
    pub host_usage_cpu: IntGaugeVec,
    pub host_usage_memory: IntGaugeVec,

    pub scheduled_total_cpu: IntGaugeVec,
    pub scheduled_total_memory: IntGaugeVec,
    pub scheduled_request_count: IntGaugeVec,
    pub scheduled_oldest_seconds: GaugeVec,
}

fn int_gauge(registry: &Registry, name: &str, help: &str) -> IntGaugeVec {
    let gauge = IntGaugeVec::new(Opts::new(name, help), &["host"]).expect("valid metric");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let scheduled_oldest_seconds = GaugeVec::new(
            Opts::new(
                "scheduled_oldest_seconds",
                "Age of the oldest outstanding reservation, per host.",
            ),
            &["host"],
        )
        .expect("valid metric");
        registry
            .register(Box::new(scheduled_oldest_seconds.clone()))
            .expect("metric registered once");

        Self {
            host_max_cpu: int_gauge(&registry, "host_max_cpu", "Total CPU cores of the host."),
            host_max_memory: int_gauge(
                &registry,
                "host_max_memory",
                "Total memory of the host in bytes.",
            ),
            host_usage_cpu: int_gauge(
                &registry,
                "host_usage_cpu",
                "CPU cores allocated to non-frozen instances.",
            ),
            host_usage_memory: int_gauge(
                &registry,
                "host_usage_memory",
                "Memory allocated to non-frozen instances, bytes.",
            ),
            scheduled_total_cpu: int_gauge(
                &registry,
                "scheduled_total_cpu",
                "CPU cores reserved by outstanding placements, per host.",
            ),
            scheduled_total_memory: int_gauge(
                &registry,
                "scheduled_total_memory",
                "Memory reserved by outstanding placements, per host.",
            ),
            scheduled_request_count: int_gauge(
                &registry,
                "scheduled_request_count",
                "Number of outstanding reservations, per host.",
            ),
            scheduled_oldest_seconds,
            registry,
        }
    }
}

pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

/// Record one host's snapshot figures.
pub fn record_host(host: &str, resource: &Resource) {
    let m = metrics();
    m.host_max_cpu
        .with_label_values(&[host])
        .set(resource.cpu_total as i64);
    m.host_max_memory
        .with_label_values(&[host])
        .set(resource.memory_total as i64);
    m.host_usage_cpu
        .with_label_values(&[host])
        .set(resource.cpu_used as i64);
    m.host_usage_memory
        .with_label_values(&[host])
        .set(resource.memory_used as i64);
}

/// Re-derive the scheduled_* families from the current reservation stats.
pub fn record_reservations(stats: &HashMap<String, ReservationStats>) {
    let m = metrics();
    m.scheduled_total_cpu.reset();
    m.scheduled_total_memory.reset();
    m.scheduled_request_count.reset();
    m.scheduled_oldest_seconds.reset();

    for (host, stat) in stats {
        m.scheduled_total_cpu
            .with_label_values(&[host])
            .set(stat.total_cpu as i64);
        m.scheduled_total_memory
            .with_label_values(&[host])
            .set(stat.total_memory as i64);
        m.scheduled_request_count
            .with_label_values(&[host])
            .set(stat.count as i64);
        if let Some(oldest) = stat.oldest_request {
            let age = (Utc::now() - oldest).num_milliseconds() as f64 / 1000.0;
            m.scheduled_oldest_seconds
                .with_label_values(&[host])
                .set(age.max(0.0));
        }
    }
}
