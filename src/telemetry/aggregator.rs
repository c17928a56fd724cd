//! Rolling-window aggregation of call and job outcomes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::inference::BackendCallAttempt;
use crate::metrics::MetricsCollector;
use crate::scheduler::{JobStatus, Lane};

#[derive(Debug, Clone, Copy)]
struct Sample {
    latency_ms: u64,
    success: bool,
    attempts: u32,
}

/// Fixed-capacity window of the most recent samples.
#[derive(Debug)]
struct Window {
    capacity: usize,
    samples: VecDeque<Sample>,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn snapshot(&self) -> WindowSnapshot {
        let count = self.samples.len();
        if count == 0 {
            return WindowSnapshot::default();
        }

        let successes = self.samples.iter().filter(|s| s.success).count();
        let mut latencies: Vec<u64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();

        let total_latency: u64 = latencies.iter().sum();
        let total_attempts: u64 = self.samples.iter().map(|s| s.attempts as u64).sum();

        WindowSnapshot {
            count,
            successes,
            failures: count - successes,
            failure_rate: (count - successes) as f64 / count as f64,
            mean_latency_ms: total_latency as f64 / count as f64,
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            max_latency_ms: latencies.last().copied().unwrap_or(0),
            mean_attempts: total_attempts as f64 / count as f64,
        }
    }
}

/// Nearest-rank percentile over sorted values.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// Summary of one rolling window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    pub count: usize,
    pub successes: usize,
    pub failures: usize,
    /// Failures over count, in [0, 1].
    pub failure_rate: f64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub max_latency_ms: u64,
    pub mean_attempts: f64,
}

/// Snapshot of every window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    /// Per-attempt outcomes keyed by backend.
    pub backends: BTreeMap<String, WindowSnapshot>,
    /// Per-job outcomes keyed by lane.
    pub lanes: BTreeMap<String, WindowSnapshot>,
}

/// Collects attempt and job outcomes into rolling windows and mirrors them
/// to Prometheus.
pub struct TelemetryAggregator {
    window_size: usize,
    backends: Mutex<HashMap<String, Window>>,
    lanes: Mutex<HashMap<Lane, Window>>,
    metrics: MetricsCollector,
}

impl TelemetryAggregator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
            backends: Mutex::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    /// Records one outbound attempt.
    pub fn record_attempt(&self, attempt: &BackendCallAttempt) {
        let latency_ms = attempt.duration_ms().max(0) as u64;

        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(attempt.backend.clone())
            .or_insert_with(|| Window::new(self.window_size))
            .push(Sample {
                latency_ms,
                success: attempt.is_success(),
                attempts: attempt.attempt,
            });

        self.metrics.record_backend_attempt(
            &attempt.backend,
            attempt.outcome.as_str(),
            latency_ms as f64 / 1000.0,
        );
    }

    /// Records a job reaching a terminal state.
    ///
    /// `attempts` counts every outbound call made on the job's behalf.
    pub fn record_job(&self, lane: Lane, status: JobStatus, duration: Duration, attempts: u32) {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(lane)
            .or_insert_with(|| Window::new(self.window_size))
            .push(Sample {
                latency_ms: duration.as_millis() as u64,
                success: status == JobStatus::Completed,
                attempts,
            });

        self.metrics
            .record_job_terminal(lane.as_str(), status.as_str(), duration.as_secs_f64());
    }

    /// Window for one backend, if it has seen any attempt.
    pub fn backend_snapshot(&self, backend: &str) -> Option<WindowSnapshot> {
        self.backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(backend)
            .map(Window::snapshot)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        let backends = self
            .backends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, window)| (name.clone(), window.snapshot()))
            .collect();

        let lanes = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(lane, window)| (lane.as_str().to_string(), window.snapshot()))
            .collect();

        TelemetrySnapshot { backends, lanes }
    }
}
