//! Persistence seam for job records.
//!
//! The orchestration core never waits on persistence to make a scheduling
//! decision: store calls happen after the in-memory state has changed and
//! failures are logged by the caller.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::inference::MediaArtifact;
use crate::scheduler::{Job, JobSpec, JobStatus};

/// A job row as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredJob {
    pub id: Uuid,
    pub spec: JobSpec,
    pub status: JobStatus,
    pub progress: f64,
    pub metadata: serde_json::Value,
    pub media: Vec<MediaArtifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Durable job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job and returns it with its assigned id.
    async fn create_job(&self, spec: &JobSpec) -> Result<Job, StoreError>;

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: f64,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn append_media_result(
        &self,
        job_id: Uuid,
        artifacts: &[MediaArtifact],
    ) -> Result<(), StoreError>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<StoredJob>, StoreError>;
}

/// Process-local store used by the binary and tests.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, StoredJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, spec: &JobSpec) -> Result<Job, StoreError> {
        let job = Job::new(spec.clone());
        let stored = StoredJob {
            id: job.id,
            spec: spec.clone(),
            status: job.status,
            progress: job.progress,
            metadata: job.metadata(),
            media: Vec::new(),
            created_at: job.created_at,
            updated_at: job.updated_at,
        };
        self.jobs.write().await.insert(job.id, stored);
        Ok(job)
    }

    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        progress: f64,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        stored.status = status;
        stored.progress = progress;
        stored.metadata = metadata;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn append_media_result(
        &self,
        job_id: Uuid,
        artifacts: &[MediaArtifact],
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let stored = jobs.get_mut(&job_id).ok_or(StoreError::NotFound(job_id))?;
        stored.media.extend_from_slice(artifacts);
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<StoredJob>, StoreError> {
        Ok(self.jobs.read().await.get(&job_id).cloned())
    }
}
