//! Remote inference: the resilient client, its transport seam and backend
//! health.
//!
//! - **InferenceClient**: attempt budget, backoff, cancellation, retry hand-off
//! - **InferenceTransport**: one outbound attempt (`HttpTransport` over reqwest)
//! - **HealthTracker**: consecutive-failure health per backend
//! - **BackoffPolicy**: bounded exponential delays

pub mod backoff;
pub mod client;
pub mod health;
pub mod transport;
pub mod types;

pub use backoff::BackoffPolicy;
pub use client::InferenceClient;
pub use health::{Admission, BackendHealth, HealthChange, HealthTracker};
pub use transport::{HttpTransport, InferenceTransport};
pub use types::{
    AttemptOutcome, BackendCallAttempt, InferenceRequest, InferenceResponse, MediaArtifact,
};
