//! Local retry queue for backend calls that exhausted their synchronous
//! attempts.
//!
//! ```text
//!   InferenceClient ──enqueue/cancel──► RetryQueueHandle
//!                                              │ (unbounded mpsc)
//!                                              ▼
//!                                      ┌───────────────┐
//!                                      │  replay loop  │── JoinSet of replays
//!                                      └───────┬───────┘
//!                                              │ RetryOutcome
//!                                              ▼
//!                                   orchestrator → scheduler + hub
//! ```

pub mod queue;
pub mod task;

pub use queue::{channel, RetryCommands, RetryQueue, RetryQueueHandle};
pub use task::{RetryOutcome, RetryTask};
