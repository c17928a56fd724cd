//! Error types for gencore operations.
//!
//! Defines the error taxonomy for every subsystem of the core:
//! - Remote inference calls (timeouts, rejections, health short-circuits)
//! - Local retry queue replays
//! - Job scheduling and lifecycle transitions
//! - Real-time fan-out
//! - Configuration loading and validation
//! - The persistence collaborator

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::inference::BackendHealth;

/// Phase of an outbound call in which a timeout fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing the TCP/TLS connection.
    Connect,
    /// Sending the request until the first response byte. Includes the
    /// backend's processing time before it starts answering, so this is the
    /// time-to-first-byte deadline.
    Write,
    /// Reading the response body.
    Read,
    /// Overall per-attempt deadline.
    Request,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutPhase::Connect => write!(f, "connect"),
            TimeoutPhase::Write => write!(f, "write"),
            TimeoutPhase::Read => write!(f, "read"),
            TimeoutPhase::Request => write!(f, "request"),
        }
    }
}

/// Errors that can occur while calling a remote inference backend.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("Backend '{backend}' timed out during {phase} after {elapsed:?}")]
    Timeout {
        backend: String,
        phase: TimeoutPhase,
        elapsed: Duration,
    },

    #[error("Backend '{backend}' rejected the request ({status}): {message}")]
    Rejected {
        backend: String,
        status: u16,
        message: String,
        retryable: bool,
    },

    #[error("Backend '{backend}' is unavailable (health: {health})")]
    Unavailable {
        backend: String,
        health: BackendHealth,
    },

    #[error("Backend '{backend}' failed after {attempts} attempts: {last}")]
    Exhausted {
        backend: String,
        attempts: u32,
        last: Box<InferenceError>,
        /// Delay before the first local replay, when a retry task was registered.
        retry_in: Option<Duration>,
    },

    /// A permanent failure after earlier retryable attempts.
    #[error("Backend '{backend}' failed permanently on attempt {attempts}: {last}")]
    Aborted {
        backend: String,
        attempts: u32,
        last: Box<InferenceError>,
    },

    #[error("Retry queue abandoned job {job_id} after {attempts} replays: {last_error}")]
    RetryExhausted {
        job_id: Uuid,
        attempts: u32,
        last_error: String,
    },

    #[error("Job {0} was cancelled")]
    Cancelled(Uuid),

    #[error("HTTP request to '{backend}' failed: {message}")]
    RequestFailed { backend: String, message: String },

    #[error("Failed to parse response from '{backend}': {message}")]
    ParseError { backend: String, message: String },

    #[error("Unknown backend '{0}'")]
    UnknownBackend(String),
}

impl InferenceError {
    /// Returns whether the failure is transient and worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Timeout { .. } | InferenceError::RequestFailed { .. } => true,
            InferenceError::Rejected { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Returns whether the failure says something about backend health.
    ///
    /// Non-retryable rejections are application errors from a live backend
    /// and do not count against it.
    pub fn counts_against_health(&self) -> bool {
        self.is_retryable()
    }

    /// Outbound calls this failure accounts for.
    ///
    /// Health short-circuits, cancellations before sending and unknown
    /// backends made no call at all.
    pub fn attempts(&self) -> u32 {
        match self {
            InferenceError::Exhausted { attempts, .. }
            | InferenceError::Aborted { attempts, .. }
            | InferenceError::RetryExhausted { attempts, .. } => *attempts,
            InferenceError::Timeout { .. }
            | InferenceError::Rejected { .. }
            | InferenceError::RequestFailed { .. }
            | InferenceError::ParseError { .. } => 1,
            InferenceError::Unavailable { .. }
            | InferenceError::Cancelled(_)
            | InferenceError::UnknownBackend(_) => 0,
        }
    }

    /// Short label used for metrics and attempt outcomes.
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Timeout { .. } => "timeout",
            InferenceError::Rejected { .. } => "rejected",
            InferenceError::Unavailable { .. } => "unavailable",
            InferenceError::Exhausted { .. } => "exhausted",
            InferenceError::Aborted { .. } => "aborted",
            InferenceError::RetryExhausted { .. } => "retry_exhausted",
            InferenceError::Cancelled(_) => "cancelled",
            InferenceError::RequestFailed { .. } => "request_failed",
            InferenceError::ParseError { .. } => "parse_error",
            InferenceError::UnknownBackend(_) => "unknown_backend",
        }
    }
}

/// Errors that can occur in the job scheduler.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    #[error("Job {0} already exists")]
    DuplicateJob(Uuid),

    #[error("Job {0} was cancelled")]
    JobCancelled(Uuid),

    #[error("Invalid transition for job {job_id} from '{from}' to '{to}'")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Scheduler is closed")]
    Closed,
}

/// Errors that can occur in the local retry queue.
#[derive(Debug, Clone, Error)]
pub enum RetryQueueError {
    #[error("Retry queue is closed")]
    Closed,

    #[error("Retry ceiling is zero for backend '{0}'")]
    Disabled(String),
}

/// Errors that can occur in the real-time fan-out hub.
#[derive(Debug, Clone, Error)]
pub enum HubError {
    #[error("Subscriber {subscription_id} overflowed its buffer of {capacity} events")]
    SubscriberOverflow {
        subscription_id: Uuid,
        capacity: usize,
    },

    #[error("Subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("Subscriber '{0}' is not authorized for any requested channel")]
    NoAuthorizedChannels(String),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors reported by the persistence collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found in store")]
    NotFound(Uuid),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error for the orchestrator facade.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    RetryQueue(#[from] RetryQueueError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Metrics registration failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let timeout = InferenceError::Timeout {
            backend: "gpu-a".to_string(),
            phase: TimeoutPhase::Read,
            elapsed: Duration::from_secs(30),
        };
        assert!(timeout.is_retryable());

        let transient = InferenceError::Rejected {
            backend: "gpu-a".to_string(),
            status: 503,
            message: "overloaded".to_string(),
            retryable: true,
        };
        assert!(transient.is_retryable());

        let fatal = InferenceError::Rejected {
            backend: "gpu-a".to_string(),
            status: 422,
            message: "bad prompt".to_string(),
            retryable: false,
        };
        assert!(!fatal.is_retryable());
        assert!(!fatal.counts_against_health());

        assert!(!InferenceError::Cancelled(Uuid::new_v4()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = InferenceError::Timeout {
            backend: "gpu-a".to_string(),
            phase: TimeoutPhase::Connect,
            elapsed: Duration::from_millis(500),
        };
        let text = err.to_string();
        assert!(text.contains("gpu-a"));
        assert!(text.contains("connect"));

        let err = HubError::SubscriberOverflow {
            subscription_id: Uuid::nil(),
            capacity: 16,
        };
        assert!(err.to_string().contains("16"));

        let err = SchedulerError::Closed;
        assert!(err.to_string().contains("closed"));
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(
            InferenceError::UnknownBackend("x".to_string()).kind(),
            "unknown_backend"
        );
        assert_eq!(InferenceError::Cancelled(Uuid::nil()).kind(), "cancelled");
    }

    #[test]
    fn test_attempt_accounting() {
        let rejected = InferenceError::Rejected {
            backend: "gpu-a".to_string(),
            status: 422,
            message: "bad prompt".to_string(),
            retryable: false,
        };
        assert_eq!(rejected.attempts(), 1);

        let aborted = InferenceError::Aborted {
            backend: "gpu-a".to_string(),
            attempts: 3,
            last: Box::new(rejected),
        };
        assert_eq!(aborted.attempts(), 3);
        assert!(!aborted.is_retryable());
        assert!(!aborted.counts_against_health());

        let unavailable = InferenceError::Unavailable {
            backend: "gpu-a".to_string(),
            health: BackendHealth::Offline,
        };
        assert_eq!(unavailable.attempts(), 0);
        assert_eq!(InferenceError::Cancelled(Uuid::nil()).attempts(), 0);
    }
}
