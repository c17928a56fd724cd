//! Request, response and attempt records for remote inference calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::JobKind;

/// Payload sent to a remote inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Job this request belongs to.
    pub job_id: Uuid,
    /// Kind of media to generate.
    pub kind: JobKind,
    /// Generation prompt.
    pub prompt: String,
    /// Backend-specific generation parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl InferenceRequest {
    /// Creates a request with empty parameters.
    pub fn new(job_id: Uuid, kind: JobKind, prompt: impl Into<String>) -> Self {
        Self {
            job_id,
            kind,
            prompt: prompt.into(),
            parameters: serde_json::Value::Null,
        }
    }

    /// Sets the generation parameters.
    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A generated artifact reported by a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaArtifact {
    /// Location of the artifact.
    pub uri: String,
    /// MIME type, when the backend reports one.
    #[serde(default)]
    pub content_type: Option<String>,
}

impl MediaArtifact {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Successful response from a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    /// Backend that produced the response.
    pub backend: String,
    /// Backend-side prediction identifier.
    #[serde(default)]
    pub prediction_id: Option<String>,
    /// Raw output document.
    #[serde(default)]
    pub output: serde_json::Value,
    /// Generated media.
    #[serde(default)]
    pub artifacts: Vec<MediaArtifact>,
    /// Attempts it took to obtain this response (filled in by the client).
    #[serde(default)]
    pub attempts: u32,
}

impl InferenceResponse {
    /// Creates an empty response for `backend`.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            prediction_id: None,
            output: serde_json::Value::Null,
            artifacts: Vec::new(),
            attempts: 0,
        }
    }

    pub fn with_artifact(mut self, artifact: MediaArtifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_prediction_id(mut self, id: impl Into<String>) -> Self {
        self.prediction_id = Some(id.into());
        self
    }
}

/// Outcome of a single outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Timeout,
    Error,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Timeout => "timeout",
            AttemptOutcome::Error => "error",
        }
    }
}

impl std::fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one outbound call to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendCallAttempt {
    /// Backend the call went to.
    pub backend: String,
    /// Job the call was made for.
    pub job_id: Uuid,
    /// 1-based attempt number within its call (or replay number).
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Error detail for failed attempts.
    pub detail: Option<String>,
}

impl BackendCallAttempt {
    /// Wall-clock duration of the attempt in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }

    pub fn is_success(&self) -> bool {
        self.outcome == AttemptOutcome::Success
    }
}
