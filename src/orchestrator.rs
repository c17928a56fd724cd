//! Service facade wiring the orchestration core together.
//!
//! `Orchestrator::start` builds every component from an
//! [`OrchestratorConfig`] and spawns the background tasks:
//! - dispatch workers pulling from the scheduler
//! - the local retry queue's replay loop
//! - the outcome pump resolving replays through the scheduler
//! - the health pump pushing backend health into the scheduler
//! - the heartbeat sweeper and the periodic system snapshot

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BackendConfig, BackendRegistry, OrchestratorConfig};
use crate::error::{InferenceError, OrchestratorError, SchedulerError};
use crate::hub::{
    Channel, EventType, FanoutHub, HubEvent, PublishReport, SubscriberIdentity,
    SubscriptionHandle,
};
use crate::inference::{
    BackendHealth, HealthChange, HealthTracker, InferenceClient, InferenceTransport,
};
use crate::metrics::init_metrics;
use crate::retry_queue::{self, RetryOutcome, RetryQueue, RetryQueueHandle};
use crate::scheduler::{
    Job, JobSpec, PoolError, PoolStats, Scheduler, SchedulerSnapshot, WorkerPool,
    WorkerPoolConfig,
};
use crate::store::JobStore;
use crate::telemetry::{TelemetryAggregator, TelemetrySnapshot};

/// The running orchestration core.
pub struct Orchestrator {
    registry: Arc<BackendRegistry>,
    health: Arc<HealthTracker>,
    telemetry: Arc<TelemetryAggregator>,
    hub: Arc<FanoutHub>,
    scheduler: Arc<Scheduler>,
    retry: RetryQueueHandle,
    store: Arc<dyn JobStore>,
    pool: tokio::sync::Mutex<WorkerPool>,
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Validates `config`, builds every component and starts the workers.
    ///
    /// Invalid configuration fails here rather than on first use.
    pub async fn start(
        config: OrchestratorConfig,
        transport: Arc<dyn InferenceTransport>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        init_metrics()?;

        let registry = Arc::new(BackendRegistry::new(config.backends.clone())?);
        let health = Arc::new(HealthTracker::new());
        let telemetry = Arc::new(TelemetryAggregator::new(config.telemetry.window_size));
        let hub = Arc::new(FanoutHub::new(config.hub.clone()));

        let (retry, commands) = retry_queue::channel();
        let client = Arc::new(
            InferenceClient::new(
                Arc::clone(&registry),
                transport,
                Arc::clone(&health),
                Arc::clone(&telemetry),
            )
            .with_retry_queue(retry.clone()),
        );
        let (retry_loop, outcomes) =
            RetryQueue::new(commands, Arc::clone(&client), Arc::clone(&registry));

        let scheduler = Arc::new(
            Scheduler::new(
                config.scheduler.clone(),
                Arc::clone(&store),
                Arc::clone(&telemetry),
            )
            .with_hub(Arc::clone(&hub)),
        );
        for name in registry.names() {
            scheduler.update_health(&name, health.health(&name)).await;
        }

        let shutdown = CancellationToken::new();
        let health_changes = health.subscribe();

        let mut tasks = vec![tokio::spawn(retry_loop.run(shutdown.clone()))];
        tasks.push(tokio::spawn(pump_outcomes(
            outcomes,
            Arc::clone(&scheduler),
            Arc::clone(&hub),
            retry.clone(),
        )));
        tasks.push(tokio::spawn(pump_health(
            health_changes,
            Arc::clone(&health),
            Arc::clone(&scheduler),
            Arc::clone(&hub),
            shutdown.clone(),
        )));
        tasks.push(hub.spawn_sweeper(shutdown.clone()));

        let mut pool = WorkerPool::new(
            WorkerPoolConfig::from_scheduler(&config.scheduler),
            Arc::clone(&scheduler),
            client,
        );
        // A fresh pool is never running.
        let _ = pool.start();

        let orchestrator = Self {
            registry,
            health,
            telemetry,
            hub,
            scheduler,
            retry,
            store,
            pool: tokio::sync::Mutex::new(pool),
            shutdown,
            shutdown_timeout: config.scheduler.shutdown_timeout,
            tasks: Mutex::new(tasks),
        };
        orchestrator.spawn_snapshot_ticker(config.hub.snapshot_interval);

        info!(
            backends = ?orchestrator.registry.names(),
            workers = config.scheduler.worker_count,
            "Orchestrator started"
        );
        Ok(orchestrator)
    }

    /// Creates the job through the store and schedules it.
    pub async fn submit_job(&self, spec: JobSpec) -> Result<Job, OrchestratorError> {
        if self.registry.get(&spec.backend).is_none() {
            return Err(InferenceError::UnknownBackend(spec.backend).into());
        }

        let job = self.store.create_job(&spec).await?;
        let job_id = self.scheduler.submit(job.clone()).await?;
        Ok(self.scheduler.get(job_id).unwrap_or(job))
    }

    /// Cancels a job and drops any retry task it owns.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job, OrchestratorError> {
        let job = self.scheduler.cancel(job_id).await?;
        if let Err(e) = self.retry.cancel(job_id) {
            debug!(job_id = %job_id, error = %e, "Retry queue not accepting cancels");
        }
        Ok(job)
    }

    pub async fn report_progress(&self, job_id: Uuid, fraction: f64) -> Result<(), OrchestratorError> {
        Ok(self.scheduler.report_progress(job_id, fraction).await?)
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.scheduler.get(job_id)
    }

    /// Lane depths, degraded counts, retry backlog and health per backend.
    pub fn scheduler_snapshot(&self) -> SchedulerSnapshot {
        let mut snapshot = self.scheduler.snapshot();
        for name in self.registry.names() {
            let health = self.health.health(&name);
            snapshot.backend_health.insert(name, health);
        }
        snapshot.retry_pending = self.retry.pending();
        snapshot
    }

    pub fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.lock().await.stats()
    }

    pub fn subscribe(
        &self,
        identity: SubscriberIdentity,
        channels: &[Channel],
    ) -> Result<SubscriptionHandle, OrchestratorError> {
        Ok(self.hub.subscribe(identity, channels)?)
    }

    pub fn unsubscribe(&self, subscription_id: Uuid) -> Result<(), OrchestratorError> {
        Ok(self.hub.unsubscribe(subscription_id)?)
    }

    pub fn heartbeat(&self, subscription_id: Uuid) -> Result<(), OrchestratorError> {
        Ok(self.hub.heartbeat(subscription_id)?)
    }

    pub fn publish(&self, event: &HubEvent) -> PublishReport {
        self.hub.publish(event)
    }

    /// Atomically replaces a backend's configuration. Calls in flight keep
    /// their snapshot; the next attempt uses the new one.
    pub fn update_backend_config(
        &self,
        name: &str,
        config: BackendConfig,
    ) -> Result<(), OrchestratorError> {
        self.registry.update(name, config)?;
        Ok(())
    }

    /// Operator override of a backend's health.
    pub async fn set_backend_health(&self, backend: &str, health: BackendHealth) {
        self.health.set_health(backend, health);
        self.scheduler.update_health(backend, health).await;
    }

    /// Stops the workers, then every background task.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        info!("Shutting down orchestrator");

        let pool_result = self.pool.lock().await.shutdown().await;
        self.scheduler.close();
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let drain = async {
            for result in futures::future::join_all(tasks).await {
                if let Err(e) = result {
                    error!(error = %e, "Background task panicked");
                }
            }
        };
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            return Err(OrchestratorError::ShutdownTimeout(self.shutdown_timeout));
        }

        match pool_result {
            Ok(()) | Err(PoolError::NotRunning) => {
                info!("Orchestrator stopped");
                Ok(())
            }
            Err(PoolError::ShutdownTimeout(timeout)) => {
                Err(OrchestratorError::ShutdownTimeout(timeout))
            }
            Err(PoolError::AlreadyRunning) => Ok(()),
        }
    }

    fn spawn_snapshot_ticker(&self, interval: Duration) {
        let scheduler = Arc::clone(&self.scheduler);
        let hub = Arc::clone(&self.hub);
        let health = Arc::clone(&self.health);
        let registry = Arc::clone(&self.registry);
        let retry = self.retry.clone();
        let shutdown = self.shutdown.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut snapshot = scheduler.snapshot();
                        for name in registry.names() {
                            let current = health.health(&name);
                            snapshot.backend_health.insert(name, current);
                        }
                        snapshot.retry_pending = retry.pending();
                        debug!(?snapshot, "Scheduler snapshot");

                        let mut event = HubEvent::system(EventType::SystemSnapshot, "scheduler snapshot");
                        if let Ok(serde_json::Value::Object(map)) = serde_json::to_value(&snapshot) {
                            event.metadata.extend(map);
                        }
                        hub.publish(&event);
                    }
                }
            }
        });

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
    }
}

/// Resolves retry-queue outcomes through the scheduler and notifies users.
async fn pump_outcomes(
    mut outcomes: mpsc::UnboundedReceiver<RetryOutcome>,
    scheduler: Arc<Scheduler>,
    hub: Arc<FanoutHub>,
    retry: RetryQueueHandle,
) {
    while let Some(outcome) = outcomes.recv().await {
        let job_id = outcome.job_id();
        match outcome {
            RetryOutcome::Resolved {
                attempts, response, ..
            } => match scheduler.complete(job_id, &response).await {
                Ok(job) => {
                    info!(job_id = %job_id, replays = attempts, "Job recovered by local retry");
                    hub.publish(
                        &HubEvent::notification(
                            EventType::JobCompleted,
                            &job,
                            format!("Job completed after {attempts} local replays"),
                        )
                        .with_metadata("replays", serde_json::json!(attempts)),
                    );
                }
                Err(SchedulerError::JobCancelled(_)) => {
                    debug!(job_id = %job_id, "Discarded replay result of cancelled job");
                }
                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to resolve replayed job"),
            },
            RetryOutcome::Rescheduled {
                attempts,
                max_attempts,
                retry_in,
                error,
                ..
            } => {
                let reason = format!("replay {attempts}/{max_attempts} failed: {error}");
                match scheduler.note_retry(job_id, &reason, retry_in).await {
                    Ok(()) => {}
                    Err(SchedulerError::JobCancelled(_)) => {
                        let _ = retry.cancel(job_id);
                    }
                    Err(e) => debug!(job_id = %job_id, error = %e, "Replay noted before park"),
                }
            }
            RetryOutcome::Abandoned {
                attempts, error, ..
            } => {
                let message = error.to_string();
                if let Err(e) = scheduler.record_attempts(job_id, attempts).await {
                    debug!(job_id = %job_id, error = %e, "Replays not recorded");
                }
                match scheduler.fail(job_id, &message).await {
                    Ok(job) => {
                        error!(job_id = %job_id, replays = attempts, error = %message, "Job abandoned by local retry");
                        hub.publish(
                            &HubEvent::notification(
                                EventType::JobFailed,
                                &job,
                                format!("Job abandoned after {attempts} local replays: {message}"),
                            )
                            .with_metadata("replays", serde_json::json!(attempts)),
                        );
                    }
                    Err(SchedulerError::JobCancelled(_)) => {}
                    Err(e) => warn!(job_id = %job_id, error = %e, "Failed to fail abandoned job"),
                }
            }
        }
    }
    debug!("Retry outcome pump stopped");
}

/// Pushes backend health transitions into the scheduler and the hub.
async fn pump_health(
    mut changes: broadcast::Receiver<HealthChange>,
    health: Arc<HealthTracker>,
    scheduler: Arc<Scheduler>,
    hub: Arc<FanoutHub>,
    shutdown: CancellationToken,
) {
    loop {
        let change = tokio::select! {
            _ = shutdown.cancelled() => break,
            change = changes.recv() => change,
        };

        match change {
            Ok(change) => {
                scheduler.update_health(&change.backend, change.current).await;

                let event_type = if change.current.is_dispatchable() {
                    EventType::SystemSnapshot
                } else {
                    EventType::DegradedNotice
                };
                hub.publish(
                    &HubEvent::system(
                        event_type,
                        format!(
                            "backend {} is {} (was {})",
                            change.backend, change.current, change.previous
                        ),
                    )
                    .with_metadata("backend", serde_json::json!(change.backend))
                    .with_metadata("health", serde_json::json!(change.current))
                    .with_metadata("previous", serde_json::json!(change.previous))
                    .with_metadata(
                        "consecutive_failures",
                        serde_json::json!(change.consecutive_failures),
                    ),
                );
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed = missed, "Health pump lagged, resyncing");
                for (backend, current) in health.snapshot() {
                    scheduler.update_health(&backend, current).await;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Health pump stopped");
}
