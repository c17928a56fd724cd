//! Dual-lane job scheduling and dispatch.
//!
//! - **Job**: a generation request, its lane and lifecycle
//! - **LaneQueue**: priority-then-FIFO ordering within one lane
//! - **Scheduler**: interactive-first selection, degraded parking and
//!   serialized job state transitions
//! - **WorkerPool**: workers that pull from the scheduler and call backends
//!
//! # Architecture
//!
//! ```text
//!      submit ──► ┌─────────────────────────────┐ ◄── update_health
//!                 │          Scheduler          │
//!                 │  interactive │    batch     │
//!                 │  ─────────── │ ──────────── │
//!                 │        degraded parking     │
//!                 └──────────────┬──────────────┘
//!                                │ next()
//!         ┌──────────────────────┼──────────────────────┐
//!         ▼                      ▼                      ▼
//!    ┌─────────┐            ┌─────────┐            ┌─────────┐
//!    │ Worker 1│            │ Worker 2│            │ Worker N│
//!    └────┬────┘            └────┬────┘            └────┬────┘
//!         └──────── complete / report_backend_unavailable ┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use gencore::scheduler::{JobKind, JobSpec, Scheduler, WorkerPool, WorkerPoolConfig};
//!
//! let job = store.create_job(&JobSpec::new(JobKind::Image, "a red fox")).await?;
//! scheduler.submit(job).await?;
//!
//! let mut pool = WorkerPool::new(WorkerPoolConfig::new(4), scheduler, client);
//! pool.start()?;
//! // ...
//! pool.shutdown().await?;
//! ```

pub mod job;
pub mod lanes;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod worker_pool;

// Re-export main types for convenience
pub use job::{
    BackendCallRef, DegradationRecord, DegradedInfo, Job, JobKind, JobSpec, JobStatus, Lane,
};
pub use lanes::LaneQueue;
pub use scheduler::{Dispatch, Scheduler, SchedulerSnapshot};
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};
