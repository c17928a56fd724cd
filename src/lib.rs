//! gencore: orchestration core for AI image and video generation.
//!
//! This library schedules generation jobs across an interactive and a batch
//! lane, calls failure-prone remote inference backends with timeout, retry
//! and health policy, replays exhausted calls from a local retry queue and
//! fans job events out to real-time subscribers.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod hub;
pub mod inference;
pub mod metrics;
pub mod orchestrator;
pub mod retry_queue;
pub mod scheduler;
pub mod store;
pub mod telemetry;

// Re-export commonly used types
pub use config::{BackendConfig, OrchestratorConfig};
pub use error::{
    ConfigError, HubError, InferenceError, OrchestratorError, RetryQueueError, SchedulerError,
    StoreError,
};
pub use orchestrator::Orchestrator;
