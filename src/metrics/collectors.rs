//! High-level recording interface over the raw Prometheus metrics.
//!
//! The `MetricsCollector` keeps label names consistent across the scheduler,
//! the inference client, the retry queue and the hub.

use super::prometheus::{
    ACTIVE_WORKERS, BACKEND_ATTEMPTS_TOTAL, BACKEND_LATENCY, DEGRADED_JOBS, HUB_SUBSCRIBERS,
    JOBS_TERMINAL_TOTAL, JOB_DURATION, LANE_DEPTH, RETRY_QUEUE_DEPTH, SUBSCRIBER_OVERFLOW_TOTAL,
};

/// Metrics collector for recording gencore operational metrics.
///
/// Metrics must be initialized with `init_metrics()` for anything to be
/// recorded; before that every method is a no-op.
///
/// # Example
///
/// ```ignore
/// use gencore::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_backend_attempt("gpu-a", "success", 2.5);
/// collector.record_job_terminal("interactive", "completed", 12.0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one outbound attempt against a backend.
    ///
    /// # Arguments
    ///
    /// * `backend` - Backend name
    /// * `outcome` - `success`, `timeout` or `error`
    /// * `latency_secs` - Attempt duration in seconds
    pub fn record_backend_attempt(&self, backend: &str, outcome: &str, latency_secs: f64) {
        if let Some(attempts) = BACKEND_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[backend, outcome]).inc();
        }

        if let Some(latency) = BACKEND_LATENCY.get() {
            latency.with_label_values(&[backend]).observe(latency_secs);
        }

        tracing::trace!(
            backend = backend,
            outcome = outcome,
            latency_secs = latency_secs,
            "Recorded backend attempt metric"
        );
    }

    /// Record a job reaching a terminal state.
    pub fn record_job_terminal(&self, lane: &str, status: &str, duration_secs: f64) {
        if let Some(terminal) = JOBS_TERMINAL_TOTAL.get() {
            terminal.with_label_values(&[lane, status]).inc();
        }

        if let Some(duration) = JOB_DURATION.get() {
            duration.with_label_values(&[lane]).observe(duration_secs);
        }

        tracing::trace!(
            lane = lane,
            status = status,
            duration_secs = duration_secs,
            "Recorded job terminal metric"
        );
    }

    /// Update the number of jobs waiting in a lane.
    pub fn update_lane_depth(&self, lane: &str, depth: usize) {
        if let Some(lane_depth) = LANE_DEPTH.get() {
            lane_depth.with_label_values(&[lane]).set(depth as f64);
        }
    }

    pub fn update_degraded_jobs(&self, count: usize) {
        if let Some(degraded) = DEGRADED_JOBS.get() {
            degraded.set(count as f64);
        }
    }

    pub fn update_retry_queue_depth(&self, depth: usize) {
        if let Some(retry_depth) = RETRY_QUEUE_DEPTH.get() {
            retry_depth.set(depth as f64);
        }
    }

    pub fn update_hub_subscribers(&self, count: usize) {
        if let Some(subscribers) = HUB_SUBSCRIBERS.get() {
            subscribers.set(count as f64);
        }
    }

    /// Count a subscriber disconnected for overflow.
    pub fn inc_subscriber_overflow(&self) {
        if let Some(overflow) = SUBSCRIBER_OVERFLOW_TOTAL.get() {
            overflow.inc();
        }
    }

    pub fn inc_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.inc();
        }
    }

    pub fn dec_active_workers(&self) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_is_zero_sized() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_backend_attempt() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_backend_attempt("gpu-a", "success", 1.2);
        collector.record_backend_attempt("gpu-a", "timeout", 30.0);
        collector.record_backend_attempt("gpu-b", "error", 0.1);

        let text = export_metrics();
        assert!(text.contains("gencore_backend_attempts_total"));
    }

    #[test]
    fn test_record_job_terminal() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_job_terminal("interactive", "completed", 4.0);
        collector.record_job_terminal("batch", "failed", 120.0);
    }

    #[test]
    fn test_gauges() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.update_lane_depth("interactive", 3);
        collector.update_lane_depth("batch", 12);
        collector.update_degraded_jobs(2);
        collector.update_retry_queue_depth(1);
        collector.update_hub_subscribers(7);
        collector.inc_subscriber_overflow();
        collector.inc_active_workers();
        collector.dec_active_workers();
    }
}
