//! Prometheus families exposed by the allocator.

use std::sync::OnceLock;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
};
use tracing::info;

use frost_lxd::{
    ConnectError, Instance, Resource, CONFIG_KEY_LIMITS_CPU, CONFIG_KEY_LIMITS_MEMORY,
    CONFIG_KEY_RESOURCE_TYPE,
};

pub struct Metrics {
    pub registry: Registry,

    pub grpc_requests_total: IntCounterVec,
    pub grpc_request_duration_seconds: HistogramVec,

    pub lxd_api_request_total: IntCounterVec,
    pub lxd_api_request_duration_seconds: HistogramVec,

    pub failed_lxd_allocate: IntGaugeVec,
    pub host_connect_error: IntGaugeVec,

    pub host_max_cpu: IntGaugeVec,
    pub host_max_memory: IntGaugeVec,
    pub host_usage_cpu: IntGaugeVec,
    pub host_usage_memory: IntGaugeVec,
    pub instance: IntGaugeVec,
}

fn register<M: prometheus::core::Collector + Clone + 'static>(registry: &Registry, m: M) -> M {
    registry
        .register(Box::new(m.clone()))
        .expect("metric registered once");
    m
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let grpc_requests_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new("grpc_server_requests_total", "gRPC requests by method and code."),
                &["method", "code"],
            )
            .expect("valid metric"),
        );
        let grpc_request_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "grpc_server_request_duration_seconds",
                    "gRPC request duration in seconds.",
                ),
                &["method"],
            )
            .expect("valid metric"),
        );
        let lxd_api_request_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(
                    "lxd_api_request_total",
                    "LXD API requests by host, method, and status.",
                ),
                &["host", "method", "status"],
            )
            .expect("valid metric"),
        );
        let lxd_api_request_duration_seconds = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    "lxd_api_request_duration_seconds",
                    "LXD API request duration in seconds.",
                ),
                &["host", "method", "status"],
            )
            .expect("valid metric"),
        );
        let failed_lxd_allocate = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(
                    "failed_lxd_allocate",
                    "Set while a runner repeatedly fails to claim on a host; cleared on success.",
                ),
                &["host", "runner_name"],
            )
            .expect("valid metric"),
        );
        let host_connect_error = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("host_connect_error", "Hosts that failed to connect, by reason."),
                &["host", "reason"],
            )
            .expect("valid metric"),
        );
        let host_max_cpu = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("host_max_cpu", "Total CPU cores of the host."),
                &["host"],
            )
            .expect("valid metric"),
        );
        let host_max_memory = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("host_max_memory", "Total memory of the host in bytes."),
                &["host"],
            )
            .expect("valid metric"),
        );
        let host_usage_cpu = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("host_usage_cpu", "CPU cores allocated to non-frozen instances."),
                &["host"],
            )
            .expect("valid metric"),
        );
        let host_usage_memory = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(
                    "host_usage_memory",
                    "Memory allocated to non-frozen instances, bytes.",
                ),
                &["host"],
            )
            .expect("valid metric"),
        );
        let instance = register(
            &registry,
            IntGaugeVec::new(
                Opts::new("instance", "One series per instance observed on the fleet."),
                &["name", "host", "status", "flavor", "cpu", "memory"],
            )
            .expect("valid metric"),
        );

        Self {
            registry,
            grpc_requests_total,
            grpc_request_duration_seconds,
            lxd_api_request_total,
            lxd_api_request_duration_seconds,
            failed_lxd_allocate,
            host_connect_error,
            host_max_cpu,
            host_max_memory,
            host_usage_cpu,
            host_usage_memory,
            instance,
        }
    }
}

pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

/// Wire the host-client observer hook into the lxd_api_* families.
pub fn install_lxd_observer() {
    frost_lxd::set_api_observer(|host, method, duration, ok| {
        let status = if ok { "success" } else { "error" };
        let m = metrics();
        m.lxd_api_request_total
            .with_label_values(&[host, method, status])
            .inc();
        m.lxd_api_request_duration_seconds
            .with_label_values(&[host, method, status])
            .observe(duration.as_secs_f64());
    });
}

pub fn record_grpc(method: &str, code: tonic::Code, duration: Duration) {
    let m = metrics();
    m.grpc_requests_total
        .with_label_values(&[method, &format!("{code:?}")])
        .inc();
    m.grpc_request_duration_seconds
        .with_label_values(&[method])
        .observe(duration.as_secs_f64());
}

pub fn record_failed_allocate(host: &str, runner_name: &str) {
    metrics()
        .failed_lxd_allocate
        .with_label_values(&[host, runner_name])
        .set(1);
}

pub fn clear_failed_allocate(host: &str, runner_name: &str) {
    let _ = metrics()
        .failed_lxd_allocate
        .remove_label_values(&[host, runner_name]);
}

/// Replace the connect-error series with the current pass's failures.
pub fn record_connect_errors(errors: &[ConnectError]) {
    let m = metrics();
    m.host_connect_error.reset();
    for error in errors {
        m.host_connect_error
            .with_label_values(&[&error.config.host, &error.error.to_string()])
            .set(1);
    }
}

/// Rebuild the per-host capacity and per-instance series from snapshots.
pub fn record_fleet(snapshots: &[(String, Resource)]) {
    let m = metrics();
    m.instance.reset();

    for (host, resource) in snapshots {
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

        for instance in &resource.instances {
            record_instance(host, instance);
        }
    }
}

fn record_instance(host: &str, instance: &Instance) {
    metrics()
        .instance
        .with_label_values(&[
            &instance.name,
            host,
            instance.status.as_str(),
            instance.config_get(CONFIG_KEY_RESOURCE_TYPE).unwrap_or(""),
            instance.config_get(CONFIG_KEY_LIMITS_CPU).unwrap_or(""),
            instance.config_get(CONFIG_KEY_LIMITS_MEMORY).unwrap_or(""),
        ])
        .set(1);
}

async fn get_metrics() -> impl IntoResponse {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metrics().registry.gather(), &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Serve `/metrics` on its own port.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(get_metrics));
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "metrics listening");
    axum::serve(listener, app).await?;
    Ok(())
}
