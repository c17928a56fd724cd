//! Deferred backend calls and replay outcomes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::InferenceError;
use crate::inference::{InferenceRequest, InferenceResponse};

/// A backend call that exhausted its synchronous attempts and awaits replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryTask {
    pub id: Uuid,
    /// Job that owns the call. At most one task exists per job.
    pub job_id: Uuid,
    pub backend: String,
    /// Original request payload, replayed verbatim.
    pub request: InferenceRequest,
    /// Replays performed so far. Never decreases.
    pub attempts: u32,
    /// Replay ceiling.
    pub max_attempts: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub last_error: String,
    pub created_at: DateTime<Utc>,
}

impl RetryTask {
    pub fn new(
        backend: impl Into<String>,
        request: InferenceRequest,
        max_attempts: u32,
        first_delay: Duration,
        last_error: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id: request.job_id,
            backend: backend.into(),
            request,
            attempts: 0,
            max_attempts,
            next_eligible_at: now + chrono_delay(first_delay),
            last_error: last_error.into(),
            created_at: now,
        }
    }

    /// Counts one finished replay.
    pub fn record_attempt(&mut self, error: Option<&InferenceError>) {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(err) = error {
            self.last_error = err.to_string();
        }
    }

    /// Pushes the eligibility time out by `delay` from now.
    pub fn reschedule(&mut self, delay: Duration) {
        self.next_eligible_at = Utc::now() + chrono_delay(delay);
    }

    /// Whether the replay ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }
}

fn chrono_delay(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::MAX)
}

/// Result of a replay, emitted on the outcome channel.
#[derive(Debug, Clone)]
pub enum RetryOutcome {
    /// The replay failed transiently and another one is scheduled.
    Rescheduled {
        job_id: Uuid,
        backend: String,
        attempts: u32,
        max_attempts: u32,
        retry_in: Duration,
        error: String,
    },
    /// A replay succeeded.
    Resolved {
        job_id: Uuid,
        backend: String,
        attempts: u32,
        response: InferenceResponse,
    },
    /// The task was dropped for good: ceiling reached or a permanent error.
    Abandoned {
        job_id: Uuid,
        backend: String,
        attempts: u32,
        error: InferenceError,
    },
}

impl RetryOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            RetryOutcome::Rescheduled { job_id, .. }
            | RetryOutcome::Resolved { job_id, .. }
            | RetryOutcome::Abandoned { job_id, .. } => *job_id,
        }
    }
}
