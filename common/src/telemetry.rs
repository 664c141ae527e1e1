// Telemetry module for structured logging, metrics, and tracing

use crate::models::{ExtractionOutcome, FrequencyTier};
use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

const SERVICE_NAME: &str = "case-watch";

/// Initialize structured logging with JSON formatting and trace context
///
/// RUST_LOG takes precedence over `log_level`. When `tracing_endpoint` is set,
/// spans are also exported over OTLP.
#[tracing::instrument(skip_all)]
pub fn init_logging(log_level: &str, tracing_endpoint: Option<&str>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

fn init_tracer(endpoint: &str) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", SERVICE_NAME),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(SERVICE_NAME);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Flush remaining spans on graceful shutdown
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the pipeline metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "watch_jobs_enqueued_total",
        "Refresh jobs enqueued by the scheduler"
    );
    describe_counter!(
        "watch_heartbeats_skipped_total",
        "Tier heartbeats aborted because a dependency was unavailable"
    );
    describe_counter!(
        "watch_refresh_outcome_total",
        "Refresh results recorded, by extraction outcome"
    );
    describe_counter!("watch_refresh_retries_total", "Refresh attempts scheduled for retry");
    describe_counter!(
        "watch_refresh_terminal_failures_total",
        "Refreshes that exhausted their retries"
    );
    describe_counter!(
        "watch_duplicate_deliveries_total",
        "Deliveries discarded because their lease was no longer held"
    );
    describe_counter!("watch_worker_recycled_total", "Worker sessions recycled");
    describe_histogram!(
        "watch_refresh_duration_seconds",
        "Duration of refresh attempts in seconds"
    );

    tracing::info!(
        metrics_port = metrics_port,
        metrics_endpoint = format!("http://0.0.0.0:{}/metrics", metrics_port),
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

#[inline]
pub fn record_job_enqueued(tier: FrequencyTier) {
    counter!("watch_jobs_enqueued_total", "tier" => tier.to_string()).increment(1);
}

#[inline]
pub fn record_heartbeat_skipped(tier: FrequencyTier, reason: &str) {
    counter!(
        "watch_heartbeats_skipped_total",
        "tier" => tier.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

#[inline]
pub fn record_refresh_outcome(outcome: ExtractionOutcome) {
    counter!("watch_refresh_outcome_total", "outcome" => outcome.to_string()).increment(1);
}

#[inline]
pub fn record_refresh_retry() {
    counter!("watch_refresh_retries_total").increment(1);
}

#[inline]
pub fn record_terminal_failure(reason: &str) {
    counter!("watch_refresh_terminal_failures_total", "reason" => reason.to_string()).increment(1);
}

#[inline]
pub fn record_duplicate_delivery() {
    counter!("watch_duplicate_deliveries_total").increment(1);
}

#[inline]
pub fn record_worker_recycled() {
    counter!("watch_worker_recycled_total").increment(1);
}

#[inline]
pub fn record_refresh_duration(duration_seconds: f64) {
    histogram!("watch_refresh_duration_seconds").record(duration_seconds);
}

/// Raise an operator alert for a refresh that exhausted its retries
pub fn alert_terminal_failure(watch_id: &Uuid, attempts: u32, reason: &str) {
    tracing::error!(
        watch_id = %watch_id,
        attempts = attempts,
        reason = reason,
        alert_type = "terminal_failure",
        "ALERT: Watch refresh failed after {} attempts",
        attempts
    );
}
