//! Dual-lane job scheduler with degraded-mode parking.
//!
//! All job state lives behind one lock and every mutation goes through the
//! methods below. Hub events are published while the lock is held so that
//! subscribers observe transitions in the order they happened; store writes
//! and telemetry happen after the lock is released.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::job::{Job, JobStatus, Lane};
use super::lanes::LaneQueue;
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::hub::{EventType, FanoutHub, HubEvent};
use crate::inference::{BackendHealth, BackoffPolicy, InferenceResponse, MediaArtifact};
use crate::metrics::MetricsCollector;
use crate::store::JobStore;
use crate::telemetry::TelemetryAggregator;

/// Terminal jobs remembered so late results can be recognised and dropped.
const MAX_RETIRED: usize = 4096;

/// A job handed to a worker.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job: Job,
    /// Fires when the job is cancelled while the worker holds it.
    pub cancel: CancellationToken,
    /// The job is the recovery trial for a backend that is down.
    pub trial: bool,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerSnapshot {
    pub interactive_depth: usize,
    pub batch_depth: usize,
    pub in_flight: usize,
    /// Jobs in `degraded-pending`, including those owned by the retry queue.
    pub degraded: usize,
    /// Subset of `degraded` whose call is owned by the local retry queue.
    pub awaiting_retry: usize,
    /// Tasks pending in the local retry queue.
    pub retry_pending: usize,
    pub backend_health: BTreeMap<String, BackendHealth>,
    pub closed: bool,
}

struct Entry {
    job: Job,
    seq: u64,
    cancel: CancellationToken,
    /// Identifies the live timed park, if any.
    park_token: Option<u64>,
    /// Re-queued by its park timer, so it may serve as a recovery trial.
    trial_eligible: bool,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Entry>,
    interactive: LaneQueue,
    batch: LaneQueue,
    /// Timed parks: (ready at, park token, job).
    parked: BinaryHeap<Reverse<(Instant, u64, Uuid)>>,
    health: HashMap<String, BackendHealth>,
    /// Backend -> job dispatched as its recovery trial.
    trials: HashMap<String, Uuid>,
    retired: HashMap<Uuid, Job>,
    retired_order: VecDeque<Uuid>,
    next_seq: u64,
    next_park: u64,
    closed: bool,
}

impl State {
    fn health_of(&self, backend: &str) -> BackendHealth {
        self.health.get(backend).copied().unwrap_or_default()
    }

    fn lane_mut(&mut self, lane: Lane) -> &mut LaneQueue {
        match lane {
            Lane::Interactive => &mut self.interactive,
            Lane::Batch => &mut self.batch,
        }
    }

    /// Looks up a live job, explaining why it is not live otherwise.
    fn live(&mut self, job_id: Uuid, target: JobStatus) -> Result<&mut Entry, SchedulerError> {
        if let Some(job) = self.retired.get(&job_id) {
            return Err(match job.status {
                JobStatus::Cancelled => SchedulerError::JobCancelled(job_id),
                status => SchedulerError::InvalidTransition {
                    job_id,
                    from: status.to_string(),
                    to: target.to_string(),
                },
            });
        }
        self.jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))
    }

    /// Frees the recovery trial slot held by `job_id`, if any.
    fn end_trial(&mut self, job_id: Uuid) {
        self.trials.retain(|_, trial| *trial != job_id);
    }

    fn retire(&mut self, job: Job) {
        self.retired_order.push_back(job.id);
        self.retired.insert(job.id, job);
        while self.retired_order.len() > MAX_RETIRED {
            if let Some(old) = self.retired_order.pop_front() {
                self.retired.remove(&old);
            }
        }
    }
}

/// Side effects applied once the state lock is released.
#[derive(Default)]
struct Effects {
    persist: Vec<Job>,
    media: Vec<(Uuid, Vec<MediaArtifact>)>,
    terminal: Option<Job>,
}

/// Schedules jobs across the interactive and batch lanes.
///
/// `next()` always prefers interactive work. Within a lane jobs are ordered
/// by priority rank, then submission order. Jobs whose backend is not
/// dispatchable are parked in `degraded-pending` with a growing retry-after
/// delay and become ready again when the delay elapses or the backend
/// recovers. While a backend is down, the first parked job whose delay
/// elapses is dispatched as its recovery trial; the others sleep again
/// until the trial resolves.
pub struct Scheduler {
    config: SchedulerConfig,
    degradation: BackoffPolicy,
    state: Mutex<State>,
    ready: Notify,
    store: Arc<dyn JobStore>,
    telemetry: Arc<TelemetryAggregator>,
    hub: Option<Arc<FanoutHub>>,
    metrics: MetricsCollector,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn JobStore>,
        telemetry: Arc<TelemetryAggregator>,
    ) -> Self {
        Self {
            degradation: BackoffPolicy::for_degradation(&config),
            config,
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            store,
            telemetry,
            hub: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Publishes lifecycle events through `hub`.
    pub fn with_hub(mut self, hub: Arc<FanoutHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Enqueues a job into the lane implied by its kind.
    ///
    /// An interactive job whose backend is currently not dispatchable is
    /// accepted but parked degraded straight away.
    pub async fn submit(&self, job: Job) -> Result<Uuid, SchedulerError> {
        let job_id = job.id;
        let mut effects = Effects::default();

        {
            let mut state = self.lock();
            if state.closed {
                return Err(SchedulerError::Closed);
            }
            if state.jobs.contains_key(&job_id) || state.retired.contains_key(&job_id) {
                return Err(SchedulerError::DuplicateJob(job_id));
            }
            if job.status != JobStatus::Queued {
                return Err(SchedulerError::InvalidTransition {
                    job_id,
                    from: job.status.to_string(),
                    to: JobStatus::Queued.to_string(),
                });
            }

            state.next_seq += 1;
            let seq = state.next_seq;
            let lane = job.lane();
            let priority = job.spec.priority;
            let health = state.health_of(job.backend());

            info!(
                job_id = %job_id,
                lane = %lane,
                priority = priority,
                backend = %job.backend(),
                "Job submitted"
            );
            self.publish(&HubEvent::for_job(EventType::JobQueued, &job));
            effects.persist.push(job.clone());

            state.jobs.insert(
                job_id,
                Entry {
                    job,
                    seq,
                    cancel: CancellationToken::new(),
                    park_token: None,
                    trial_eligible: false,
                },
            );

            if lane == Lane::Interactive && !health.is_dispatchable() {
                let reason = format!("backend is {health}");
                self.park_timed(&mut state, job_id, &reason, &mut effects)?;
            } else {
                state.lane_mut(lane).push(job_id, priority, seq, Instant::now());
            }
            self.refresh_gauges(&state);
        }

        self.ready.notify_waiters();
        self.apply(effects).await;
        Ok(job_id)
    }

    /// Waits for the next ready job.
    ///
    /// Returns `None` once the scheduler is closed.
    pub async fn next(&self) -> Option<Dispatch> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let mut effects = Effects::default();
            let (dispatch, wake_at) = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                self.promote_due(&mut state, now, &mut effects);
                let dispatch = self.take_ready(&mut state, now, &mut effects);
                self.refresh_gauges(&state);
                let wake_at = state.parked.peek().map(|Reverse((at, _, _))| *at);
                (dispatch, wake_at)
            };

            self.apply(effects).await;
            if dispatch.is_some() {
                return dispatch;
            }

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Parks a dispatched job because its backend is unavailable.
    ///
    /// Returns the retry-after delay, which grows with the number of
    /// consecutive degradations of the job and is capped by
    /// `degraded_max_delay`.
    pub async fn report_backend_unavailable(
        &self,
        job_id: Uuid,
        reason: &str,
    ) -> Result<Duration, SchedulerError> {
        let mut effects = Effects::default();
        let delay = {
            let mut state = self.lock();
            state.live(job_id, JobStatus::DegradedPending)?;
            state.end_trial(job_id);
            let delay = self.park_timed(&mut state, job_id, reason, &mut effects)?;
            self.refresh_gauges(&state);
            delay
        };

        self.ready.notify_waiters();
        self.apply(effects).await;
        Ok(delay)
    }

    /// Parks a dispatched job whose call now belongs to the local retry
    /// queue. The job stays parked until `complete`, `fail` or `cancel`.
    pub async fn park_for_retry(
        &self,
        job_id: Uuid,
        reason: &str,
        retry_in: Duration,
    ) -> Result<(), SchedulerError> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let entry = state.live(job_id, JobStatus::DegradedPending)?;
            entry.job.transition(JobStatus::DegradedPending)?;
            entry.job.record_degradation(reason, retry_in, true);
            entry.park_token = None;
            let job = entry.job.clone();
            state.end_trial(job_id);

            warn!(
                job_id = %job_id,
                backend = %job.backend(),
                retry_in_ms = retry_in.as_millis() as u64,
                reason = %reason,
                "Job handed to local retry queue"
            );
            self.publish_degraded(&job, reason, retry_in);
            effects.persist.push(job);
            self.refresh_gauges(&state);
        }

        self.apply(effects).await;
        Ok(())
    }

    /// Records a rescheduled replay of a job owned by the retry queue.
    pub async fn note_retry(
        &self,
        job_id: Uuid,
        reason: &str,
        retry_in: Duration,
    ) -> Result<(), SchedulerError> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let entry = state.live(job_id, JobStatus::DegradedPending)?;
            if !entry.job.awaiting_retry_queue() {
                return Err(SchedulerError::InvalidTransition {
                    job_id,
                    from: entry.job.status.to_string(),
                    to: JobStatus::DegradedPending.to_string(),
                });
            }
            entry.job.transition(JobStatus::DegradedPending)?;
            entry.job.record_degradation(reason, retry_in, true);
            let job = entry.job.clone();

            debug!(job_id = %job_id, retry_in_ms = retry_in.as_millis() as u64, "Replay rescheduled");
            self.publish_degraded(&job, reason, retry_in);
            effects.persist.push(job);
        }

        self.apply(effects).await;
        Ok(())
    }

    /// Marks a job completed with the backend's response.
    ///
    /// Fails with `JobCancelled` if the job was cancelled in the meantime;
    /// the result is then discarded.
    pub async fn complete(
        &self,
        job_id: Uuid,
        response: &InferenceResponse,
    ) -> Result<Job, SchedulerError> {
        let mut effects = Effects::default();
        let job = {
            let mut state = self.lock();
            let entry = state.live(job_id, JobStatus::Completed)?;
            entry.job.transition(JobStatus::Completed)?;
            entry.job.record_response(response);
            let job = entry.job.clone();
            state.end_trial(job_id);
            state.jobs.remove(&job_id);
            state.retire(job.clone());

            info!(
                job_id = %job_id,
                lane = %job.lane(),
                backend = %response.backend,
                attempts = response.attempts,
                artifacts = response.artifacts.len(),
                "Job completed"
            );
            self.publish(&HubEvent::for_job(EventType::JobCompleted, &job));
            self.refresh_gauges(&state);

            effects.persist.push(job.clone());
            effects
                .media
                .push((job_id, response.artifacts.clone()));
            effects.terminal = Some(job.clone());
            job
        };

        self.apply(effects).await;
        Ok(job)
    }

    /// Marks a job failed with a human-readable message.
    pub async fn fail(&self, job_id: Uuid, message: &str) -> Result<Job, SchedulerError> {
        let mut effects = Effects::default();
        let job = {
            let mut state = self.lock();
            let entry = state.live(job_id, JobStatus::Failed)?;
            entry.job.transition(JobStatus::Failed)?;
            entry.job.error = Some(message.to_string());
            let job = entry.job.clone();
            state.end_trial(job_id);
            state.jobs.remove(&job_id);
            state.retire(job.clone());

            warn!(job_id = %job_id, lane = %job.lane(), error = %message, "Job failed");
            self.publish(&HubEvent::for_job(EventType::JobFailed, &job).with_message(message));
            self.refresh_gauges(&state);

            effects.persist.push(job.clone());
            effects.terminal = Some(job.clone());
            job
        };

        self.apply(effects).await;
        Ok(job)
    }

    /// Cancels a job wherever it is.
    ///
    /// A queued or parked job is removed from dispatch. A dispatched job's
    /// token fires; its in-flight attempt finishes and the result is
    /// dropped. Cancelling an already cancelled job is a no-op.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, SchedulerError> {
        let mut effects = Effects::default();
        let job = {
            let mut state = self.lock();
            if let Some(job) = state.retired.get(&job_id) {
                if job.status == JobStatus::Cancelled {
                    return Ok(job.clone());
                }
            }

            let entry = state.live(job_id, JobStatus::Cancelled)?;
            let previous = entry.job.status;
            entry.job.transition(JobStatus::Cancelled)?;
            entry.cancel.cancel();
            let lane = entry.job.lane();
            let job = entry.job.clone();

            state.lane_mut(lane).remove(job_id);
            state.end_trial(job_id);
            state.jobs.remove(&job_id);
            state.retire(job.clone());

            info!(job_id = %job_id, lane = %lane, previous = %previous, "Job cancelled");
            self.publish(
                &HubEvent::for_job(EventType::ProgressUpdate, &job).with_message("job cancelled"),
            );
            self.publish(
                &HubEvent::notification(
                    EventType::ProgressUpdate,
                    &job,
                    format!("Job was cancelled while {previous}"),
                )
                .with_metadata("terminal", serde_json::Value::Bool(true)),
            );
            self.refresh_gauges(&state);

            effects.persist.push(job.clone());
            effects.terminal = Some(job.clone());
            job
        };

        self.apply(effects).await;
        Ok(job)
    }

    /// Adds outbound calls made on a job's behalf to its attempt count and
    /// call record.
    pub async fn record_attempts(&self, job_id: Uuid, attempts: u32) -> Result<(), SchedulerError> {
        if attempts == 0 {
            return Ok(());
        }

        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let entry = state.live(job_id, JobStatus::Dispatched)?;
            let backend = entry.job.backend().to_string();
            entry.job.record_attempts(&backend, attempts);
            debug!(job_id = %job_id, attempts = entry.job.attempts, "Attempts recorded");
            effects.persist.push(entry.job.clone());
        }

        self.apply(effects).await;
        Ok(())
    }

    /// Updates the progress of a dispatched job, clamped to [0, 1].
    ///
    /// Ignored for jobs that are not currently dispatched.
    pub async fn report_progress(&self, job_id: Uuid, fraction: f64) -> Result<(), SchedulerError> {
        let mut effects = Effects::default();
        {
            let mut state = self.lock();
            let entry = state.live(job_id, JobStatus::Dispatched)?;
            if entry.job.status != JobStatus::Dispatched {
                debug!(job_id = %job_id, status = %entry.job.status, "Ignoring progress for idle job");
                return Ok(());
            }
            let fraction = if fraction.is_nan() { 0.0 } else { fraction.clamp(0.0, 1.0) };
            entry.job.progress = fraction;
            entry.job.updated_at = chrono::Utc::now();
            let job = entry.job.clone();

            self.publish(&HubEvent::for_job(EventType::ProgressUpdate, &job));
            effects.persist.push(job);
        }

        self.apply(effects).await;
        Ok(())
    }

    /// Records a backend health change.
    ///
    /// When the backend is healthy again, every job parked on it that is not
    /// owned by the retry queue becomes ready immediately. Returns how many
    /// jobs were released.
    pub async fn update_health(&self, backend: &str, health: BackendHealth) -> usize {
        let mut effects = Effects::default();
        let released = {
            let mut state = self.lock();
            let previous = state.health.insert(backend.to_string(), health);
            if previous != Some(health) {
                debug!(backend = %backend, health = %health, "Scheduler health view updated");
            }

            if health != BackendHealth::Healthy {
                return 0;
            }

            let parked: Vec<Uuid> = state
                .jobs
                .values()
                .filter(|e| {
                    e.job.status == JobStatus::DegradedPending
                        && !e.job.awaiting_retry_queue()
                        && e.job.backend() == backend
                })
                .map(|e| e.job.id)
                .collect();

            let mut released = 0;
            for job_id in parked {
                if self.requeue(&mut state, job_id, None, &mut effects) {
                    released += 1;
                }
            }
            self.refresh_gauges(&state);
            released
        };

        if released > 0 {
            info!(backend = %backend, released = released, "Backend recovered, released parked jobs");
            self.ready.notify_waiters();
        }
        self.apply(effects).await;
        released
    }

    /// Current state of a job, live or recently finished.
    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        let state = self.lock();
        state
            .jobs
            .get(&job_id)
            .map(|e| e.job.clone())
            .or_else(|| state.retired.get(&job_id).cloned())
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let state = self.lock();
        let mut snapshot = SchedulerSnapshot {
            interactive_depth: state.interactive.len(),
            batch_depth: state.batch.len(),
            backend_health: state
                .health
                .iter()
                .map(|(name, health)| (name.clone(), *health))
                .collect(),
            closed: state.closed,
            ..Default::default()
        };

        for entry in state.jobs.values() {
            match entry.job.status {
                JobStatus::Dispatched => snapshot.in_flight += 1,
                JobStatus::DegradedPending => {
                    snapshot.degraded += 1;
                    if entry.job.awaiting_retry_queue() {
                        snapshot.awaiting_retry += 1;
                    }
                }
                _ => {}
            }
        }
        snapshot
    }

    /// Stops accepting work and wakes every waiting `next()`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_waiters();
        info!("Scheduler closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Moves a job to `degraded-pending` with a timed re-enqueue.
    fn park_timed(
        &self,
        state: &mut State,
        job_id: Uuid,
        reason: &str,
        effects: &mut Effects,
    ) -> Result<Duration, SchedulerError> {
        state.next_park += 1;
        let token = state.next_park;

        let entry = state
            .jobs
            .get_mut(&job_id)
            .ok_or(SchedulerError::JobNotFound(job_id))?;
        entry.job.transition(JobStatus::DegradedPending)?;
        let delay = self
            .degradation
            .delay(entry.job.consecutive_degradations() + 1);
        let consecutive = entry.job.record_degradation(reason, delay, false);
        entry.park_token = Some(token);
        entry.trial_eligible = false;
        let job = entry.job.clone();

        state
            .parked
            .push(Reverse((Instant::now() + delay, token, job_id)));

        warn!(
            job_id = %job_id,
            backend = %job.backend(),
            consecutive = consecutive,
            retry_after_ms = delay.as_millis() as u64,
            reason = %reason,
            "Job parked degraded"
        );
        self.publish_degraded(&job, reason, delay);
        effects.persist.push(job);
        Ok(delay)
    }

    /// Returns a parked job to its lane. With a `token`, only the matching
    /// timed park is honoured.
    fn requeue(
        &self,
        state: &mut State,
        job_id: Uuid,
        token: Option<u64>,
        effects: &mut Effects,
    ) -> bool {
        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return false;
        };
        if entry.job.status != JobStatus::DegradedPending || entry.job.awaiting_retry_queue() {
            return false;
        }
        if token.is_some() && entry.park_token != token {
            return false;
        }
        if entry.job.transition(JobStatus::Queued).is_err() {
            return false;
        }
        entry.park_token = None;
        entry.trial_eligible = token.is_some();

        let (lane, priority, seq) = (entry.job.lane(), entry.job.spec.priority, entry.seq);
        let job = entry.job.clone();
        state.lane_mut(lane).push(job_id, priority, seq, Instant::now());

        info!(
            job_id = %job_id,
            lane = %lane,
            consecutive = job.consecutive_degradations(),
            "Degraded job re-queued"
        );
        self.publish(&HubEvent::for_job(EventType::JobQueued, &job));
        effects.persist.push(job);
        true
    }

    /// Puts a job back to sleep while its backend's trial is in flight.
    ///
    /// The job keeps its last retry-after delay and its history is not
    /// extended: nothing new was learned about the backend.
    fn repark_quiet(&self, state: &mut State, job_id: Uuid) {
        state.next_park += 1;
        let token = state.next_park;

        let Some(entry) = state.jobs.get_mut(&job_id) else {
            return;
        };
        if entry.job.transition(JobStatus::DegradedPending).is_err() {
            return;
        }
        let delay = self
            .degradation
            .delay(entry.job.consecutive_degradations().max(1));
        entry.park_token = Some(token);
        entry.trial_eligible = false;

        debug!(
            job_id = %job_id,
            retry_after_ms = delay.as_millis() as u64,
            "Recovery trial in flight, job stays parked"
        );
        state
            .parked
            .push(Reverse((Instant::now() + delay, token, job_id)));
    }

    fn promote_due(&self, state: &mut State, now: Instant, effects: &mut Effects) {
        while let Some(Reverse((at, token, job_id))) = state.parked.peek().copied() {
            if at > now {
                break;
            }
            state.parked.pop();
            self.requeue(state, job_id, Some(token), effects);
        }
    }

    /// Pops the next job to run, degrading any whose backend is down.
    fn take_ready(
        &self,
        state: &mut State,
        now: Instant,
        effects: &mut Effects,
    ) -> Option<Dispatch> {
        loop {
            let job_id = self.pop_ready(state, now)?;
            let Some(entry) = state.jobs.get(&job_id) else {
                continue;
            };

            let backend = entry.job.backend().to_string();
            let eligible = entry.trial_eligible;
            let health = state.health_of(&backend);
            let mut trial = false;
            if !health.is_dispatchable() {
                // Half-open: one job whose park timer fired tries the backend.
                if eligible && !state.trials.contains_key(&backend) {
                    state.trials.insert(backend.clone(), job_id);
                    trial = true;
                } else if eligible {
                    self.repark_quiet(state, job_id);
                    continue;
                } else {
                    let reason = format!("backend is {health}");
                    if let Err(e) = self.park_timed(state, job_id, &reason, effects) {
                        warn!(job_id = %job_id, error = %e, "Failed to park job");
                    }
                    continue;
                }
            }

            let Some(entry) = state.jobs.get_mut(&job_id) else {
                state.end_trial(job_id);
                continue;
            };
            if let Err(e) = entry.job.transition(JobStatus::Dispatched) {
                warn!(job_id = %job_id, error = %e, "Skipping undispatchable job");
                state.end_trial(job_id);
                continue;
            }
            entry.trial_eligible = false;
            let job = entry.job.clone();
            let cancel = entry.cancel.clone();

            if trial {
                info!(job_id = %job_id, backend = %backend, health = %health, "Dispatching recovery trial");
            } else {
                debug!(job_id = %job_id, lane = %job.lane(), "Job dispatched");
            }
            self.publish(&HubEvent::for_job(EventType::ProgressUpdate, &job));
            effects.persist.push(job.clone());
            return Some(Dispatch { job, cancel, trial });
        }
    }

    fn pop_ready(&self, state: &mut State, now: Instant) -> Option<Uuid> {
        if let Some(max_wait) = self.config.batch_max_wait {
            if let Some((job_id, enqueued_at)) = state.batch.oldest() {
                if now.saturating_duration_since(enqueued_at) >= max_wait {
                    state.batch.remove(job_id);
                    debug!(job_id = %job_id, "Aged batch job promoted");
                    return Some(job_id);
                }
            }
        }
        state.interactive.pop().or_else(|| state.batch.pop())
    }

    fn publish_degraded(&self, job: &Job, reason: &str, retry_after: Duration) {
        let retry_after_ms = serde_json::json!(retry_after.as_millis() as u64);
        self.publish(
            &HubEvent::for_job(EventType::DegradedNotice, job)
                .with_message(reason)
                .with_metadata("retry_after_ms", retry_after_ms.clone()),
        );
        self.publish(
            &HubEvent::notification(
                EventType::DegradedNotice,
                job,
                format!("Job is waiting for the backend: {reason}"),
            )
            .with_metadata("retry_after_ms", retry_after_ms),
        );
    }

    fn publish(&self, event: &HubEvent) {
        if let Some(ref hub) = self.hub {
            hub.publish(event);
        }
    }

    fn refresh_gauges(&self, state: &State) {
        self.metrics
            .update_lane_depth(Lane::Interactive.as_str(), state.interactive.len());
        self.metrics
            .update_lane_depth(Lane::Batch.as_str(), state.batch.len());
        let degraded = state
            .jobs
            .values()
            .filter(|e| e.job.status == JobStatus::DegradedPending)
            .count();
        self.metrics.update_degraded_jobs(degraded);
    }

    async fn apply(&self, effects: Effects) {
        for job in &effects.persist {
            if let Err(e) = self
                .store
                .update_job_status(job.id, job.status, job.progress, job.metadata())
                .await
            {
                warn!(job_id = %job.id, error = %e, "Failed to persist job status");
            }
        }

        for (job_id, artifacts) in &effects.media {
            if artifacts.is_empty() {
                continue;
            }
            if let Err(e) = self.store.append_media_result(*job_id, artifacts).await {
                warn!(job_id = %job_id, error = %e, "Failed to persist media results");
            }
        }

        if let Some(job) = effects.terminal {
            self.telemetry
                .record_job(job.lane(), job.status, job.elapsed(), job.attempts);
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{Channel, SubscriberIdentity};
    use crate::scheduler::{JobKind, JobSpec};
    use crate::store::InMemoryJobStore;
    use crate::config::HubConfig;

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            degraded_base_delay: Duration::from_millis(20),
            degraded_backoff_factor: 2.0,
            degraded_max_delay: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn scheduler(config: SchedulerConfig) -> (Scheduler, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = Scheduler::new(
            config,
            store.clone() as Arc<dyn JobStore>,
            Arc::new(TelemetryAggregator::new(16)),
        );
        (scheduler, store)
    }

    async fn submit(scheduler: &Scheduler, store: &InMemoryJobStore, kind: JobKind) -> Uuid {
        let job = store.create_job(&JobSpec::new(kind, "prompt")).await.unwrap();
        scheduler.submit(job).await.unwrap()
    }

    async fn next_id(scheduler: &Scheduler) -> Uuid {
        tokio::time::timeout(Duration::from_secs(2), scheduler.next())
            .await
            .unwrap()
            .unwrap()
            .job
            .id
    }

    #[tokio::test]
    async fn test_interactive_before_batch() {
        let (scheduler, store) = scheduler(config());
        let b1 = submit(&scheduler, &store, JobKind::Video).await;
        let b2 = submit(&scheduler, &store, JobKind::ImageBatch).await;
        let a = submit(&scheduler, &store, JobKind::Image).await;

        assert_eq!(next_id(&scheduler).await, a);
        assert_eq!(next_id(&scheduler).await, b1);
        assert_eq!(next_id(&scheduler).await, b2);
        assert_eq!(scheduler.snapshot().in_flight, 3);
    }

    #[tokio::test]
    async fn test_priority_rank_within_lane() {
        let (scheduler, store) = scheduler(config());
        let low = submit(&scheduler, &store, JobKind::Image).await;
        let urgent = store
            .create_job(&JobSpec::new(JobKind::Image, "now").with_priority(1))
            .await
            .unwrap();
        let urgent = scheduler.submit(urgent).await.unwrap();

        assert_eq!(next_id(&scheduler).await, urgent);
        assert_eq!(next_id(&scheduler).await, low);
    }

    #[tokio::test]
    async fn test_duplicate_and_closed() {
        let (scheduler, store) = scheduler(config());
        let job = store
            .create_job(&JobSpec::new(JobKind::Image, "x"))
            .await
            .unwrap();
        scheduler.submit(job.clone()).await.unwrap();

        assert!(matches!(
            scheduler.submit(job).await,
            Err(SchedulerError::DuplicateJob(_))
        ));

        scheduler.close();
        let late = Job::new(JobSpec::new(JobKind::Image, "late"));
        assert!(matches!(
            scheduler.submit(late).await,
            Err(SchedulerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_waiting_next() {
        let (scheduler, _store) = scheduler(config());
        let scheduler = Arc::new(scheduler);

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.next().await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.close();

        assert!(tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_degraded_delay_grows_and_is_capped() {
        let (scheduler, store) = scheduler(config());
        let id = submit(&scheduler, &store, JobKind::Video).await;

        let mut delays = Vec::new();
        for _ in 0..6 {
            assert_eq!(next_id(&scheduler).await, id);
            delays.push(scheduler.report_backend_unavailable(id, "timeout").await.unwrap());
        }

        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[0], Duration::from_millis(20));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(200));

        let job = scheduler.get(id).unwrap();
        assert_eq!(job.status, JobStatus::DegradedPending);
        assert_eq!(job.degraded.unwrap().history.len(), 6);

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::DegradedPending);
        assert_eq!(
            stored.metadata["degraded"]["history"].as_array().unwrap().len(),
            6
        );
    }

    #[tokio::test]
    async fn test_unhealthy_backend_parks_interactive_submission() {
        let (scheduler, store) = scheduler(SchedulerConfig {
            degraded_base_delay: Duration::from_secs(60),
            ..config()
        });
        scheduler.update_health("default", BackendHealth::Unhealthy).await;

        let id = submit(&scheduler, &store, JobKind::Image).await;
        let batch = submit(&scheduler, &store, JobKind::Video).await;

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.degraded, 1);
        assert_eq!(snapshot.interactive_depth, 0);
        assert_eq!(snapshot.batch_depth, 1);
        assert_eq!(
            snapshot.backend_health.get("default"),
            Some(&BackendHealth::Unhealthy)
        );

        // The batch job is degraded when it reaches the front.
        let waiting = tokio::time::timeout(Duration::from_millis(50), scheduler.next()).await;
        assert!(waiting.is_err());
        assert_eq!(scheduler.snapshot().degraded, 2);

        let released = scheduler.update_health("default", BackendHealth::Healthy).await;
        assert_eq!(released, 2);
        assert_eq!(next_id(&scheduler).await, id);
        assert_eq!(next_id(&scheduler).await, batch);
    }

    #[tokio::test]
    async fn test_cancel_degraded_job_is_removed() {
        let (scheduler, store) = scheduler(config());
        let id = submit(&scheduler, &store, JobKind::Image).await;
        assert_eq!(next_id(&scheduler).await, id);
        scheduler.report_backend_unavailable(id, "offline").await.unwrap();

        let job = scheduler.cancel(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        // Idempotent.
        assert_eq!(scheduler.cancel(id).await.unwrap().status, JobStatus::Cancelled);

        // The timed park fires but nothing is dispatched.
        let waiting = tokio::time::timeout(Duration::from_millis(100), scheduler.next()).await;
        assert!(waiting.is_err());
        assert_eq!(scheduler.snapshot().degraded, 0);
    }

    #[tokio::test]
    async fn test_cancel_wins_over_in_flight_result() {
        let (scheduler, store) = scheduler(config());
        let id = submit(&scheduler, &store, JobKind::Image).await;
        let dispatch = scheduler.next().await.unwrap();

        scheduler.cancel(id).await.unwrap();
        assert!(dispatch.cancel.is_cancelled());

        let response = InferenceResponse::new("default");
        assert!(matches!(
            scheduler.complete(id, &response).await,
            Err(SchedulerError::JobCancelled(_))
        ));
        assert_eq!(scheduler.get(id).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_retry_queue_parking() {
        let (scheduler, store) = scheduler(config());
        let id = submit(&scheduler, &store, JobKind::Video).await;
        assert_eq!(next_id(&scheduler).await, id);

        scheduler
            .park_for_retry(id, "attempts exhausted", Duration::from_millis(5))
            .await
            .unwrap();
        scheduler
            .note_retry(id, "replay 1 failed", Duration::from_millis(10))
            .await
            .unwrap();

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.awaiting_retry, 1);

        // Recovery does not steal the job from the retry queue.
        assert_eq!(scheduler.update_health("default", BackendHealth::Healthy).await, 0);

        let response = InferenceResponse::new("default")
            .with_artifact(MediaArtifact::new("s3://out/clip.mp4"));
        let job = scheduler.complete(id, &response).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(!job.awaiting_retry_queue());
        assert_eq!(job.degraded.unwrap().history.len(), 2);

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.media.len(), 1);
    }

    #[tokio::test]
    async fn test_progress_clamped_and_published() {
        let hub = Arc::new(FanoutHub::new(HubConfig::default()));
        let (scheduler, store) = scheduler(config());
        let scheduler = scheduler.with_hub(Arc::clone(&hub));
        let mut sub = hub
            .subscribe(SubscriberIdentity::admin("ops"), &[Channel::Jobs])
            .unwrap();

        let id = submit(&scheduler, &store, JobKind::Image).await;
        scheduler.next().await.unwrap();
        scheduler.report_progress(id, 1.7).await.unwrap();

        assert_eq!(scheduler.get(id).unwrap().progress, 1.0);

        let types: Vec<EventType> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            types,
            vec![
                EventType::JobQueued,
                EventType::ProgressUpdate,
                EventType::ProgressUpdate
            ]
        );
    }

    #[tokio::test]
    async fn test_aging_promotes_old_batch_job() {
        let (scheduler, store) = scheduler(SchedulerConfig {
            batch_max_wait: Some(Duration::from_millis(30)),
            ..config()
        });
        let batch = submit(&scheduler, &store, JobKind::Video).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        let interactive = submit(&scheduler, &store, JobKind::Image).await;

        assert_eq!(next_id(&scheduler).await, batch);
        assert_eq!(next_id(&scheduler).await, interactive);
    }

    #[tokio::test]
    async fn test_fail_records_message() {
        let (scheduler, store) = scheduler(config());
        let id = submit(&scheduler, &store, JobKind::Image).await;
        scheduler.next().await.unwrap();

        let job = scheduler.fail(id, "backend rejected prompt").await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("backend rejected prompt"));

        assert!(matches!(
            scheduler.fail(id, "again").await,
            Err(SchedulerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            scheduler.fail(Uuid::new_v4(), "missing").await,
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_down_backend_gets_one_trial_at_a_time() {
        let (scheduler, store) = scheduler(config());
        scheduler.update_health("default", BackendHealth::Unhealthy).await;

        let first = submit(&scheduler, &store, JobKind::Image).await;
        let second = submit(&scheduler, &store, JobKind::Image).await;
        assert_eq!(scheduler.snapshot().degraded, 2);

        // The first timer to fire sends its job as the trial.
        let trial = tokio::time::timeout(Duration::from_secs(2), scheduler.next())
            .await
            .unwrap()
            .unwrap();
        assert!(trial.trial);
        assert_eq!(trial.job.id, first);

        // The other job keeps sleeping while the trial is out.
        let waiting = tokio::time::timeout(Duration::from_millis(150), scheduler.next()).await;
        assert!(waiting.is_err());
        let parked = scheduler.get(second).unwrap();
        assert_eq!(parked.status, JobStatus::DegradedPending);
        assert_eq!(parked.degraded.unwrap().history.len(), 1);

        // A failed trial frees the slot for the next job.
        scheduler
            .report_backend_unavailable(first, "trial timed out")
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(2), scheduler.next())
            .await
            .unwrap()
            .unwrap();
        assert!(next.trial);
        assert_eq!(next.job.id, second);
        assert_eq!(next.job.degraded.as_ref().unwrap().history.len(), 1);

        scheduler
            .complete(second, &InferenceResponse::new("default"))
            .await
            .unwrap();
        assert_eq!(scheduler.get(first).unwrap().degraded.unwrap().history.len(), 2);
    }

    #[tokio::test]
    async fn test_attempts_kept_on_failure() {
        let (scheduler, store) = scheduler(config());
        let id = submit(&scheduler, &store, JobKind::Image).await;
        scheduler.next().await.unwrap();

        scheduler.record_attempts(id, 0).await.unwrap();
        assert!(scheduler.get(id).unwrap().call.is_none());

        scheduler.record_attempts(id, 3).await.unwrap();
        let job = scheduler.fail(id, "backend timed out").await.unwrap();
        assert_eq!(job.attempts, 3);
        let call = job.call.unwrap();
        assert_eq!(call.backend, "default");
        assert_eq!(call.attempts, 3);

        let stored = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 3);
    }

    #[tokio::test]
    async fn test_cancel_sends_terminal_notification() {
        let hub = Arc::new(FanoutHub::new(HubConfig::default()));
        let (scheduler, store) = scheduler(config());
        let scheduler = scheduler.with_hub(Arc::clone(&hub));
        let mut sub = hub
            .subscribe(SubscriberIdentity::admin("ops"), &[Channel::Notifications])
            .unwrap();

        let id = submit(&scheduler, &store, JobKind::Video).await;
        scheduler.cancel(id).await.unwrap();

        let events: Vec<HubEvent> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.channel, Channel::Notifications);
        assert_eq!(event.job_id, Some(id));
        assert_eq!(event.status, Some(JobStatus::Cancelled));
        assert_eq!(event.metadata["terminal"], serde_json::json!(true));

        // Repeating the cancel does not notify again.
        scheduler.cancel(id).await.unwrap();
        assert!(sub.try_recv().is_none());
    }
}
