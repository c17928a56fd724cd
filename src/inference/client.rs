//! Resilient client for remote inference backends.
//!
//! Wraps an [`InferenceTransport`] with the per-backend call policy:
//! health short-circuit, bounded attempts with exponential backoff,
//! cooperative cancellation and hand-off to the local retry queue.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::health::{Admission, HealthTracker};
use super::transport::InferenceTransport;
use super::types::{AttemptOutcome, BackendCallAttempt, InferenceRequest, InferenceResponse};
use crate::config::{BackendConfig, BackendRegistry};
use crate::error::InferenceError;
use crate::retry_queue::{RetryQueueHandle, RetryTask};
use crate::telemetry::TelemetryAggregator;

/// Client applying timeout, retry and health policy to backend calls.
pub struct InferenceClient {
    registry: Arc<BackendRegistry>,
    transport: Arc<dyn InferenceTransport>,
    health: Arc<HealthTracker>,
    telemetry: Arc<TelemetryAggregator>,
    retry_queue: Option<RetryQueueHandle>,
}

impl InferenceClient {
    pub fn new(
        registry: Arc<BackendRegistry>,
        transport: Arc<dyn InferenceTransport>,
        health: Arc<HealthTracker>,
        telemetry: Arc<TelemetryAggregator>,
    ) -> Self {
        Self {
            registry,
            transport,
            health,
            telemetry,
            retry_queue: None,
        }
    }

    /// Enables hand-off of exhausted calls to the local retry queue.
    pub fn with_retry_queue(mut self, handle: RetryQueueHandle) -> Self {
        self.retry_queue = Some(handle);
        self
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn retry_queue(&self) -> Option<&RetryQueueHandle> {
        self.retry_queue.as_ref()
    }

    /// Performs exactly one attempt and records it.
    ///
    /// The attempt is reported to telemetry and feeds backend health whether
    /// it succeeds or fails.
    pub async fn attempt(
        &self,
        backend: &str,
        config: &BackendConfig,
        request: &InferenceRequest,
        attempt: u32,
    ) -> Result<InferenceResponse, InferenceError> {
        let started_at = Utc::now();
        let result = self.transport.send(backend, config, request).await;
        let finished_at = Utc::now();

        let (outcome, detail) = match &result {
            Ok(_) => (AttemptOutcome::Success, None),
            Err(e @ InferenceError::Timeout { .. }) => (AttemptOutcome::Timeout, Some(e.to_string())),
            Err(e) => (AttemptOutcome::Error, Some(e.to_string())),
        };

        let record = BackendCallAttempt {
            backend: backend.to_string(),
            job_id: request.job_id,
            attempt,
            started_at,
            finished_at,
            outcome,
            detail,
        };

        debug!(
            job_id = %request.job_id,
            backend = %backend,
            attempt = attempt,
            outcome = %record.outcome,
            duration_ms = record.duration_ms(),
            "Backend attempt finished"
        );
        self.telemetry.record_attempt(&record);

        match &result {
            Ok(_) => {
                self.health.record_success(backend);
            }
            Err(e) if e.counts_against_health() => {
                self.health.record_failure(backend, config);
            }
            Err(_) => {}
        }

        result
    }

    /// Calls a backend under its configured policy.
    ///
    /// Fails fast with `Unavailable` when the backend is not dispatchable,
    /// unless this call is admitted as the backend's recovery trial.
    /// Retryable failures are retried up to `max_attempts` with exponential
    /// backoff; each attempt reads the current config snapshot, so updates
    /// apply from the next attempt on. When attempts run out the request is
    /// handed to the retry queue (unless its ceiling is zero) and
    /// `Exhausted` reports when the first replay is due.
    ///
    /// Cancellation is checked between attempts and interrupts backoff
    /// sleeps. An attempt already sent is allowed to finish; its result is
    /// discarded and `Cancelled` returned.
    pub async fn call(
        &self,
        backend: &str,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<InferenceResponse, InferenceError> {
        if self.registry.get(backend).is_none() {
            return Err(InferenceError::UnknownBackend(backend.to_string()));
        }

        match self.health.admit(backend) {
            Admission::Open => {}
            Admission::Trial => return self.trial_call(backend, request, cancel).await,
            Admission::Closed(health) => {
                return Err(InferenceError::Unavailable {
                    backend: backend.to_string(),
                    health,
                })
            }
        }

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(InferenceError::Cancelled(request.job_id));
            }

            let config = self
                .registry
                .get(backend)
                .ok_or_else(|| InferenceError::UnknownBackend(backend.to_string()))?;
            attempt += 1;

            let result = self.attempt(backend, &config, request, attempt).await;

            if cancel.is_cancelled() {
                debug!(job_id = %request.job_id, attempt = attempt, "Discarding result of cancelled call");
                return Err(InferenceError::Cancelled(request.job_id));
            }

            let err = match result {
                Ok(mut response) => {
                    response.attempts = attempt;
                    return Ok(response);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(
                    job_id = %request.job_id,
                    backend = %backend,
                    attempt = attempt,
                    error = %err,
                    "Backend call failed permanently"
                );
                if attempt == 1 {
                    return Err(err);
                }
                return Err(InferenceError::Aborted {
                    backend: backend.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            if attempt >= config.max_attempts {
                let retry_in = self.hand_off(backend, &config, request, &err);
                return Err(InferenceError::Exhausted {
                    backend: backend.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                    retry_in,
                });
            }

            let delay = BackoffPolicy::for_attempts(&config).delay(attempt);
            warn!(
                job_id = %request.job_id,
                backend = %backend,
                attempt = attempt,
                max_attempts = config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Backend attempt failed, backing off"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(InferenceError::Cancelled(request.job_id));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Sends a single recovery trial to a backend that is down.
    ///
    /// Success records the backend healthy again. A retryable failure is
    /// reported as `Exhausted` without a retry task, which sends the job back
    /// to degraded waiting.
    async fn trial_call(
        &self,
        backend: &str,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<InferenceResponse, InferenceError> {
        if cancel.is_cancelled() {
            self.health.end_trial(backend);
            return Err(InferenceError::Cancelled(request.job_id));
        }
        let Some(config) = self.registry.get(backend) else {
            self.health.end_trial(backend);
            return Err(InferenceError::UnknownBackend(backend.to_string()));
        };

        info!(job_id = %request.job_id, backend = %backend, "Sending recovery trial");
        let result = self.attempt(backend, &config, request, 1).await;
        self.health.end_trial(backend);

        if cancel.is_cancelled() {
            return Err(InferenceError::Cancelled(request.job_id));
        }

        match result {
            Ok(mut response) => {
                info!(job_id = %request.job_id, backend = %backend, "Recovery trial succeeded");
                response.attempts = 1;
                Ok(response)
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    job_id = %request.job_id,
                    backend = %backend,
                    error = %err,
                    "Recovery trial failed, backend still down"
                );
                Err(InferenceError::Exhausted {
                    backend: backend.to_string(),
                    attempts: 1,
                    last: Box::new(err),
                    retry_in: None,
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Registers a retry task. Returns the delay before the first replay,
    /// or `None` when no task was registered.
    fn hand_off(
        &self,
        backend: &str,
        config: &BackendConfig,
        request: &InferenceRequest,
        err: &InferenceError,
    ) -> Option<std::time::Duration> {
        let Some(queue) = &self.retry_queue else {
            return None;
        };

        if config.local_queue_max_retries == 0 {
            info!(
                job_id = %request.job_id,
                backend = %backend,
                "Local retry disabled, reporting failure"
            );
            return None;
        }

        let delay = BackoffPolicy::for_replays(config).delay(1);
        let task = RetryTask::new(
            backend,
            request.clone(),
            config.local_queue_max_retries,
            delay,
            err.to_string(),
        );

        match queue.enqueue(task, delay) {
            Ok(()) => {
                info!(
                    job_id = %request.job_id,
                    backend = %backend,
                    retry_in_ms = delay.as_millis() as u64,
                    "Attempts exhausted, handed off to retry queue"
                );
                Some(delay)
            }
            Err(e) => {
                warn!(job_id = %request.job_id, error = %e, "Retry queue hand-off failed");
                None
            }
        }
    }
}
