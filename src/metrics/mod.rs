//! Metrics module for Prometheus-based monitoring.
//!
//! Covers backend call outcomes and latency, scheduler lane depths, degraded
//! and retrying jobs, terminal job counts and fan-out subscriber health.
//!
//! # Example
//!
//! ```ignore
//! use gencore::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.update_lane_depth("interactive", 3);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_WORKERS, BACKEND_ATTEMPTS_TOTAL, BACKEND_LATENCY, DEGRADED_JOBS, HUB_SUBSCRIBERS,
    JOBS_TERMINAL_TOTAL, JOB_DURATION, LANE_DEPTH, REGISTRY, RETRY_QUEUE_DEPTH,
    SUBSCRIBER_OVERFLOW_TOTAL,
};
