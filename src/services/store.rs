//! Job store: the single source of truth for job state.
//!
//! Every mutation is one atomic operation here. Backends differ only in how
//! they lock; the transition rules themselves live on [`CaptionJob`].

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::job::{CancelOutcome, CaptionJob, Lease, StageOutcome, TransitionError};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &CaptionJob) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<CaptionJob>, StoreError>;

    /// Newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<CaptionJob>, StoreError>;

    /// Lease the oldest non-terminal job that nobody holds a live lease on.
    async fn claim_next(
        &self,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<(CaptionJob, Lease)>, StoreError>;

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError>;

    /// Hand the job back to the queue in its current state.
    async fn release(&self, lease: &Lease) -> Result<(), StoreError>;

    async fn advance(
        &self,
        lease: &Lease,
        outcome: StageOutcome,
        ttl: Duration,
    ) -> Result<CaptionJob, StoreError>;

    async fn cancel(&self, id: Uuid) -> Result<(CancelOutcome, CaptionJob), StoreError>;

    /// Remove the record. Returns whether it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Jobs waiting for a worker.
    async fn claimable_count(&self) -> Result<u64, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored job is not readable: {0}")]
    Corrupt(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

pub(crate) fn lease_duration(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
}

/// In-process store for development and tests.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, CaptionJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &CaptionJob) -> Result<(), StoreError> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CaptionJob>, StoreError> {
        Ok(self.jobs.lock().await.get(&id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<CaptionJob>, StoreError> {
        let jobs = self.jobs.lock().await;
        let mut all: Vec<&CaptionJob> = jobs.values().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(all
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn claim_next(
        &self,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<(CaptionJob, Lease)>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;
        let next = jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|job| job.id);

        Ok(next.and_then(|id| {
            let job = jobs.get_mut(&id)?;
            let lease = job.claim(owner, lease_duration(ttl), now);
            Some((job.clone(), lease))
        }))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&lease.job_id)
            .ok_or(TransitionError::LeaseExpired(lease.job_id))?;
        Ok(job.renew(lease, lease_duration(ttl), Utc::now())?)
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&lease.job_id)
            .ok_or(TransitionError::LeaseExpired(lease.job_id))?;
        Ok(job.release(lease, Utc::now())?)
    }

    async fn advance(
        &self,
        lease: &Lease,
        outcome: StageOutcome,
        ttl: Duration,
    ) -> Result<CaptionJob, StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&lease.job_id)
            .ok_or(TransitionError::LeaseExpired(lease.job_id))?;
        job.advance(lease, outcome, lease_duration(ttl), Utc::now())?;
        Ok(job.clone())
    }

    async fn cancel(&self, id: Uuid) -> Result<(CancelOutcome, CaptionJob), StoreError> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let outcome = job.request_cancel(Utc::now());
        Ok((outcome, job.clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().await.remove(&id).is_some())
    }

    async fn claimable_count(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|job| job.is_claimable(now))
            .count() as u64)
    }
}
