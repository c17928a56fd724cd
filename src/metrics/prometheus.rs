//! Prometheus metrics registration and export.
//!
//! Every gencore metric lives in a process-wide registry initialized once by
//! [`init_metrics`]. Recording goes through
//! [`MetricsCollector`](super::MetricsCollector), which silently skips
//! metrics that were never initialized.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all gencore metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Outbound backend call attempts, labeled by backend and outcome.
pub static BACKEND_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Backend call latency in seconds, labeled by backend.
pub static BACKEND_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs waiting in each scheduler lane.
pub static LANE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Jobs currently parked in `degraded-pending`.
pub static DEGRADED_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Tasks waiting in the local retry queue.
pub static RETRY_QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Jobs reaching a terminal state, labeled by lane and status.
pub static JOBS_TERMINAL_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// End-to-end job duration in seconds, labeled by lane.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Live fan-out subscriptions.
pub static HUB_SUBSCRIBERS: OnceLock<Gauge> = OnceLock::new();

/// Subscribers disconnected for overflowing their buffer.
pub static SUBSCRIBER_OVERFLOW_TOTAL: OnceLock<IntCounter> = OnceLock::new();

/// Dispatch workers currently executing a job.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build and register into a fresh
/// registry but leave the already-initialized statics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if a metric definition is invalid.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Backend metrics
    let backend_attempts_total = CounterVec::new(
        Opts::new(
            "gencore_backend_attempts_total",
            "Outbound inference attempts by outcome",
        ),
        &["backend", "outcome"],
    )?;

    let backend_latency = HistogramVec::new(
        HistogramOpts::new(
            "gencore_backend_latency_seconds",
            "Inference attempt latency in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["backend"],
    )?;

    // Scheduler metrics
    let lane_depth = GaugeVec::new(
        Opts::new("gencore_lane_depth", "Jobs waiting per scheduler lane"),
        &["lane"],
    )?;

    let degraded_jobs = Gauge::new(
        "gencore_degraded_jobs",
        "Jobs currently parked in degraded-pending",
    )?;

    let retry_queue_depth = Gauge::new(
        "gencore_retry_queue_depth",
        "Tasks waiting in the local retry queue",
    )?;

    let jobs_terminal_total = CounterVec::new(
        Opts::new(
            "gencore_jobs_terminal_total",
            "Jobs reaching a terminal state",
        ),
        &["lane", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "gencore_job_duration_seconds",
            "Time from submission to terminal state in seconds",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["lane"],
    )?;

    // Hub metrics
    let hub_subscribers = Gauge::new("gencore_hub_subscribers", "Live fan-out subscriptions")?;

    let subscriber_overflow_total = IntCounter::new(
        "gencore_subscriber_overflow_total",
        "Subscribers disconnected for overflowing their buffer",
    )?;

    // Worker metrics
    let active_workers = Gauge::new(
        "gencore_active_workers",
        "Dispatch workers currently executing a job",
    )?;

    registry.register(Box::new(backend_attempts_total.clone()))?;
    registry.register(Box::new(backend_latency.clone()))?;
    registry.register(Box::new(lane_depth.clone()))?;
    registry.register(Box::new(degraded_jobs.clone()))?;
    registry.register(Box::new(retry_queue_depth.clone()))?;
    registry.register(Box::new(jobs_terminal_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(hub_subscribers.clone()))?;
    registry.register(Box::new(subscriber_overflow_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = BACKEND_ATTEMPTS_TOTAL.set(backend_attempts_total);
    let _ = BACKEND_LATENCY.set(backend_latency);
    let _ = LANE_DEPTH.set(lane_depth);
    let _ = DEGRADED_JOBS.set(degraded_jobs);
    let _ = RETRY_QUEUE_DEPTH.set(retry_queue_depth);
    let _ = JOBS_TERMINAL_TOTAL.set(jobs_terminal_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = HUB_SUBSCRIBERS.set(hub_subscribers);
    let _ = SUBSCRIBER_OVERFLOW_TOTAL.set(subscriber_overflow_total);
    let _ = ACTIVE_WORKERS.set(active_workers);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
