//! Telemetry aggregation.
//!
//! Every outbound attempt and every terminal job lands in a bounded rolling
//! window. Snapshots summarize latency, failure rate and attempt counts per
//! backend and per lane; the same samples feed the Prometheus collectors.

pub mod aggregator;

pub use aggregator::{TelemetryAggregator, TelemetrySnapshot, WindowSnapshot};
