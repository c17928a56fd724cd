//! Worker pool dispatching scheduled jobs to remote inference backends.
//!
//! Each worker runs as an independent async task that pulls one job at a
//! time from the [`Scheduler`], calls the backend through the
//! [`InferenceClient`] and resolves the outcome back through the scheduler.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Degraded parking and retry-queue hand-off on backend failure
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::Job;
use super::scheduler::{Dispatch, Scheduler};
use crate::config::SchedulerConfig;
use crate::error::{InferenceError, SchedulerError};
use crate::inference::InferenceClient;
use crate::metrics::MetricsCollector;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Takes worker count and shutdown timeout from the scheduler policy.
    pub fn from_scheduler(config: &SchedulerConfig) -> Self {
        Self {
            num_workers: config.worker_count,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently waiting on a backend.
    pub active_workers: usize,
    /// Jobs completed on their first dispatch.
    pub jobs_completed: u64,
    /// Jobs that failed terminally.
    pub jobs_failed: u64,
    /// Dispatches that ended with the job parked degraded or handed to the
    /// retry queue.
    pub jobs_degraded: u64,
    /// Dispatches whose result was discarded because the job was cancelled.
    pub jobs_cancelled: u64,
    /// Average dispatch duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of dispatches processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed + self.jobs_degraded + self.jobs_cancelled
    }

    /// Returns the share of dispatches that completed, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_degraded: AtomicU64,
    jobs_cancelled: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_degraded: AtomicU64::new(0),
            jobs_cancelled: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, counter: &AtomicU64, duration: Duration) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let completed = self.jobs_completed.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let degraded = self.jobs_degraded.load(Ordering::SeqCst);
        let cancelled = self.jobs_cancelled.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = completed + failed + degraded + cancelled;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_completed: completed,
            jobs_failed: failed,
            jobs_degraded: degraded,
            jobs_cancelled: cancelled,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that runs dispatch workers against a scheduler.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    scheduler: Arc<Scheduler>,
    client: Arc<InferenceClient>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    is_running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        scheduler: Arc<Scheduler>,
        client: Arc<InferenceClient>,
    ) -> Self {
        // Only one shutdown signal is ever sent
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            scheduler,
            client,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        for i in 0..self.config.num_workers {
            let worker = Worker {
                id: format!("worker-{}", i),
                scheduler: Arc::clone(&self.scheduler),
                client: Arc::clone(&self.client),
                shutdown_rx: self.shutdown_tx.subscribe(),
                stats: Arc::clone(&self.stats),
                metrics: MetricsCollector::new(),
            };

            self.worker_handles.push(tokio::spawn(worker.run()));
        }

        self.is_running.store(true, Ordering::SeqCst);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Signals the workers, closes the scheduler so idle workers wake up and
    /// waits for busy workers to finish their current dispatch.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may already have stopped
        let _ = self.shutdown_tx.send(());
        self.scheduler.close();

        let shutdown_future = async {
            for handle in self.worker_handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single dispatch worker.
struct Worker {
    id: String,
    scheduler: Arc<Scheduler>,
    client: Arc<InferenceClient>,
    shutdown_rx: broadcast::Receiver<()>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
}

impl Worker {
    /// Pulls jobs until shutdown is signalled or the scheduler closes.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            match self.scheduler.next().await {
                Some(dispatch) => self.process(dispatch).await,
                None => {
                    debug!(worker_id = %self.id, "Scheduler closed");
                    break;
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    async fn process(&self, dispatch: Dispatch) {
        let Dispatch { job, cancel, trial } = dispatch;
        let start_time = Instant::now();

        info!(
            worker_id = %self.id,
            job_id = %job.id,
            lane = %job.lane(),
            backend = %job.backend(),
            trial = trial,
            "Processing job"
        );

        self.stats.increment_active();
        self.metrics.inc_active_workers();

        let request = job.to_request();
        let result = self.client.call(job.backend(), &request, &cancel).await;

        self.stats.decrement_active();
        self.metrics.dec_active_workers();
        let duration = start_time.elapsed();

        match result {
            Ok(response) => match self.scheduler.complete(job.id, &response).await {
                Ok(_) => {
                    self.stats.record(&self.stats.jobs_completed, duration);
                    info!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        duration_ms = duration.as_millis() as u64,
                        "Job completed successfully"
                    );
                }
                Err(SchedulerError::JobCancelled(_)) => {
                    self.stats.record(&self.stats.jobs_cancelled, duration);
                    debug!(worker_id = %self.id, job_id = %job.id, "Discarded result of cancelled job");
                }
                Err(e) => {
                    error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to mark job complete");
                }
            },
            Err(err) => self.handle_failure(&job, err, duration).await,
        }
    }

    async fn handle_failure(&self, job: &Job, err: InferenceError, duration: Duration) {
        match self.scheduler.record_attempts(job.id, err.attempts()).await {
            Ok(()) | Err(SchedulerError::JobCancelled(_)) => {}
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to record attempts")
            }
        }

        match &err {
            InferenceError::Cancelled(_) => {
                self.stats.record(&self.stats.jobs_cancelled, duration);
                debug!(worker_id = %self.id, job_id = %job.id, "Call abandoned for cancelled job");
            }
            InferenceError::Unavailable { .. } => self.degrade(job, &err, duration).await,
            InferenceError::Exhausted {
                retry_in: Some(retry_in),
                ..
            } => self.park_for_retry(job, &err, *retry_in, duration).await,
            InferenceError::Exhausted { backend, .. }
                if !self.client.health().health(backend).is_dispatchable() =>
            {
                self.degrade(job, &err, duration).await
            }
            _ => {
                self.stats.record(&self.stats.jobs_failed, duration);
                match self.scheduler.fail(job.id, &err.to_string()).await {
                    Ok(_) => {}
                    Err(SchedulerError::JobCancelled(_)) => {}
                    Err(e) => {
                        error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to mark job failed")
                    }
                }
            }
        }
    }

    async fn degrade(&self, job: &Job, err: &InferenceError, duration: Duration) {
        self.stats.record(&self.stats.jobs_degraded, duration);
        match self
            .scheduler
            .report_backend_unavailable(job.id, &err.to_string())
            .await
        {
            Ok(delay) => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    retry_after_ms = delay.as_millis() as u64,
                    "Backend unavailable, job parked"
                );
            }
            Err(SchedulerError::JobCancelled(_)) => {}
            Err(e) => {
                error!(worker_id = %self.id, job_id = %job.id, error = %e, "Failed to park job")
            }
        }
    }

    async fn park_for_retry(
        &self,
        job: &Job,
        err: &InferenceError,
        retry_in: Duration,
        duration: Duration,
    ) {
        self.stats.record(&self.stats.jobs_degraded, duration);
        match self
            .scheduler
            .park_for_retry(job.id, &err.to_string(), retry_in)
            .await
        {
            Ok(()) => {}
            Err(SchedulerError::JobCancelled(_)) => {
                // Cancelled while the call was in flight; the replay must not run.
                if let Some(queue) = self.client.retry_queue() {
                    if let Err(e) = queue.cancel(job.id) {
                        warn!(job_id = %job.id, error = %e, "Failed to cancel retry task");
                    }
                }
            }
            Err(e) => {
                debug!(worker_id = %self.id, job_id = %job.id, error = %e, "Job resolved before it could be parked");
            }
        }
    }
}
