//! Job definitions for the scheduler.
//!
//! - `JobSpec`: what the caller asked for
//! - `Job`: a generation request tracked through its lifecycle
//! - `Lane` / `JobKind`: the priority class, implied by the kind of media
//! - `JobStatus`: lifecycle states and the transitions allowed between them
//! - `DegradedInfo`: retry-after hint and degradation history

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::DEFAULT_BACKEND;
use crate::error::SchedulerError;
use crate::inference::{InferenceRequest, InferenceResponse};

/// Default priority rank (lower is sooner).
const DEFAULT_PRIORITY: u32 = 100;

/// Priority class of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// User-facing work, always selected first.
    Interactive,
    /// Bulk work.
    Batch,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Interactive => "interactive",
            Lane::Batch => "batch",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of media a job generates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// A single image, generated while the user waits.
    Image,
    /// A set of images generated in bulk.
    ImageBatch,
    /// A video clip.
    Video,
}

impl JobKind {
    /// Lane implied by this kind.
    pub fn lane(&self) -> Lane {
        match self {
            JobKind::Image => Lane::Interactive,
            JobKind::ImageBatch | JobKind::Video => Lane::Batch,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Image => "image",
            JobKind::ImageBatch => "image_batch",
            JobKind::Video => "video",
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Queued,
    Dispatched,
    /// Parked while its backend is unavailable or its call awaits replay.
    DegradedPending,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Terminal states are final. Cancellation is allowed from any live
    /// state. `degraded-pending -> queued` is the only way back.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        match (*self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled) => true,
            (Queued, Dispatched) | (Queued, DegradedPending) => true,
            (Dispatched, Completed) | (Dispatched, Failed) | (Dispatched, DegradedPending) => true,
            (DegradedPending, Queued)
            | (DegradedPending, DegradedPending)
            | (DegradedPending, Completed)
            | (DegradedPending, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Dispatched => "dispatched",
            JobStatus::DegradedPending => "degraded-pending",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a job's degradation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationRecord {
    pub reason: String,
    pub retry_after_ms: u64,
    pub at: DateTime<Utc>,
    /// Position of this record in the run of degradations.
    pub consecutive: u32,
}

/// Degradation metadata carried by a job once it has been parked.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DegradedInfo {
    /// Most recent reason.
    pub reason: String,
    /// Most recent retry-after hint.
    pub retry_after_ms: u64,
    pub consecutive_failures: u32,
    pub history: Vec<DegradationRecord>,
    /// The call is owned by the local retry queue rather than a timer.
    pub awaiting_retry_queue: bool,
}

/// Reference to the backend calls made for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCallRef {
    pub backend: String,
    pub prediction_id: Option<String>,
    /// Every outbound call so far, synchronous attempts and replays.
    pub attempts: u32,
}

/// What a caller submits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Owner, used to scope notifications.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Backend to run on.
    #[serde(default = "default_backend")]
    pub backend: String,
    pub kind: JobKind,
    pub prompt: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Rank within the lane, lower is sooner.
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_backend() -> String {
    DEFAULT_BACKEND.to_string()
}

fn default_priority() -> u32 {
    DEFAULT_PRIORITY
}

impl JobSpec {
    /// Creates a spec for the default backend with default priority.
    pub fn new(kind: JobKind, prompt: impl Into<String>) -> Self {
        Self {
            user_id: None,
            backend: default_backend(),
            kind,
            prompt: prompt.into(),
            parameters: serde_json::Value::Null,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A generation request tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Fixed at creation from `JobSpec::kind`.
    lane: Lane,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// Fraction in [0, 1].
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub dispatched_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub degraded: Option<DegradedInfo>,
    #[serde(default)]
    pub call: Option<BackendCallRef>,
    /// Human-readable failure message.
    #[serde(default)]
    pub error: Option<String>,
    /// Outbound attempts made on this job's behalf.
    #[serde(default)]
    pub attempts: u32,
}

impl Job {
    /// Creates a queued job with a fresh id.
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4(), spec)
    }

    /// Creates a queued job with an id assigned elsewhere.
    pub fn with_id(id: Uuid, spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id,
            lane: spec.kind.lane(),
            spec,
            status: JobStatus::Queued,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            dispatched_at: None,
            finished_at: None,
            degraded: None,
            call: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    pub fn backend(&self) -> &str {
        &self.spec.backend
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the job is parked waiting for the local retry queue.
    pub fn awaiting_retry_queue(&self) -> bool {
        self.status == JobStatus::DegradedPending
            && self
                .degraded
                .as_ref()
                .is_some_and(|d| d.awaiting_retry_queue)
    }

    /// Builds the backend request for this job.
    pub fn to_request(&self) -> InferenceRequest {
        InferenceRequest::new(self.id, self.spec.kind, self.spec.prompt.clone())
            .with_parameters(self.spec.parameters.clone())
    }

    /// Metadata document persisted alongside the status.
    ///
    /// Contains `degraded` (with its `history`) once the job has been parked,
    /// `call` once a backend was called and `error` on failure.
    pub fn metadata(&self) -> serde_json::Value {
        let mut metadata = serde_json::Map::new();

        if let Some(ref degraded) = self.degraded {
            if let Ok(value) = serde_json::to_value(degraded) {
                metadata.insert("degraded".to_string(), value);
            }
        }
        if let Some(ref call) = self.call {
            if let Ok(value) = serde_json::to_value(call) {
                metadata.insert("call".to_string(), value);
            }
        }
        if let Some(ref error) = self.error {
            metadata.insert("error".to_string(), serde_json::Value::String(error.clone()));
        }

        serde_json::Value::Object(metadata)
    }

    /// Moves to `next`, rejecting illegal transitions.
    pub(crate) fn transition(&mut self, next: JobStatus) -> Result<(), SchedulerError> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::InvalidTransition {
                job_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        match next {
            JobStatus::Dispatched => self.dispatched_at = Some(now),
            s if s.is_terminal() => self.finished_at = Some(now),
            _ => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Appends a degradation record and returns the new consecutive count.
    pub(crate) fn record_degradation(
        &mut self,
        reason: impl Into<String>,
        retry_after: std::time::Duration,
        awaiting_retry_queue: bool,
    ) -> u32 {
        let reason = reason.into();
        let retry_after_ms = retry_after.as_millis() as u64;
        let degraded = self.degraded.get_or_insert_with(DegradedInfo::default);

        degraded.consecutive_failures += 1;
        degraded.reason = reason.clone();
        degraded.retry_after_ms = retry_after_ms;
        degraded.awaiting_retry_queue = awaiting_retry_queue;
        degraded.history.push(DegradationRecord {
            reason,
            retry_after_ms,
            at: Utc::now(),
            consecutive: degraded.consecutive_failures,
        });
        degraded.consecutive_failures
    }

    /// Consecutive degradations so far.
    pub fn consecutive_degradations(&self) -> u32 {
        self.degraded
            .as_ref()
            .map(|d| d.consecutive_failures)
            .unwrap_or(0)
    }

    /// Adds outbound calls made for this job and points the call record at
    /// the backend that received them.
    pub(crate) fn record_attempts(&mut self, backend: &str, attempts: u32) {
        self.attempts = self.attempts.saturating_add(attempts);
        let prediction_id = self.call.take().and_then(|c| c.prediction_id);
        self.call = Some(BackendCallRef {
            backend: backend.to_string(),
            prediction_id,
            attempts: self.attempts,
        });
    }

    pub(crate) fn record_response(&mut self, response: &InferenceResponse) {
        self.record_attempts(&response.backend, response.attempts);
        self.progress = 1.0;
        if let Some(ref mut call) = self.call {
            call.prediction_id = response.prediction_id.clone();
        }
        if let Some(ref mut degraded) = self.degraded {
            degraded.awaiting_retry_queue = false;
        }
    }

    /// Time from creation to the terminal transition (or now).
    pub fn elapsed(&self) -> std::time::Duration {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.created_at).to_std().unwrap_or_default()
    }
}
