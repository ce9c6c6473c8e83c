//! Job lifecycle: submission, status, cancellation, deletion and the worker
//! pool that drives jobs through their stages.
//!
//! Workers coordinate only through the job store. A worker owns a job while
//! its lease is live; every commit presents the lease, so a worker that lost
//! it cannot overwrite the result of the one that reclaimed the job.

use chrono::Utc;
use garde::Validate;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::job::{
    CancelOutcome, CaptionJob, ErrorKind, JobError, JobState, JobStatus, Lease, Source, Stage,
    StageOutcome, StageOutput, TransitionError,
};
use crate::models::style::CaptionStyle;
use crate::services::queue::WorkQueue;
use crate::services::retry::RetryPolicy;
use crate::services::stages::Pipeline;
use crate::services::storage::Storage;
use crate::services::store::{JobStore, StoreError};
use crate::services::workspace::Workspace;

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lease_ttl: Duration,
    /// Longest an idle worker waits for a queue signal before polling the store.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub video_formats: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            video_formats: ["mp4", "avi", "mov", "mkv", "webm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Lease on job {0} expired or was reclaimed")]
    LeaseExpired(Uuid),

    #[error("Job {0} is still running; try again later")]
    Busy(Uuid),

    #[error("Invalid transition: {0}")]
    Conflict(TransitionError),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => OrchestratorError::NotFound(id),
            StoreError::Transition(TransitionError::LeaseExpired(id)) => {
                OrchestratorError::LeaseExpired(id)
            }
            StoreError::Transition(t) => OrchestratorError::Conflict(t),
            other => OrchestratorError::Store(other),
        }
    }
}

/// How one stage run ended, before anything is committed.
enum StageRun {
    Done(StageOutput),
    Failed(JobError),
    Cancelled,
    LeaseLost,
}

struct LeaseLost;

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    storage: Arc<dyn Storage>,
    pipeline: Pipeline,
    workspace: Workspace,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        pipeline: Pipeline,
        workspace: Workspace,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            store,
            queue,
            storage: pipeline.storage.clone(),
            pipeline,
            workspace,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Validate and persist a new job, then wake a worker.
    pub async fn submit(
        &self,
        source: Source,
        style: CaptionStyle,
    ) -> Result<CaptionJob, OrchestratorError> {
        style
            .validate()
            .map_err(|e| OrchestratorError::InvalidInput(e.to_string()))?;
        source
            .validate(&self.settings.video_formats)
            .map_err(OrchestratorError::InvalidInput)?;

        let job = CaptionJob::new(source, style.normalized(), Utc::now());
        self.store.insert(&job).await?;
        metrics::counter!("caption_jobs_submitted_total").increment(1);

        if let Err(e) = self.queue.notify(job.id).await {
            // Workers still find the job by polling the store.
            tracing::warn!(job_id = %job.id, error = %e, "Failed to signal work queue");
        }

        tracing::info!(job_id = %job.id, "Job submitted");
        Ok(job)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<CaptionJob, OrchestratorError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    pub async fn status(&self, job_id: Uuid) -> Result<JobStatus, OrchestratorError> {
        Ok(self.get(job_id).await?.status())
    }

    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<CaptionJob>, OrchestratorError> {
        Ok(self.store.list(limit, offset).await?)
    }

    pub async fn claim_next(
        &self,
        worker_id: &str,
    ) -> Result<Option<(CaptionJob, Lease)>, OrchestratorError> {
        let claimed = self
            .store
            .claim_next(worker_id, self.settings.lease_ttl)
            .await?;
        if let Some((job, _)) = &claimed {
            tracing::info!(job_id = %job.id, worker_id, state = %job.state, "Job claimed");
            if let Ok(depth) = self.store.claimable_count().await {
                metrics::gauge!("caption_queue_depth").set(depth as f64);
            }
        }
        Ok(claimed)
    }

    /// Commit a stage outcome under `lease`.
    pub async fn advance(
        &self,
        lease: &Lease,
        outcome: StageOutcome,
    ) -> Result<CaptionJob, OrchestratorError> {
        let job = self
            .store
            .advance(lease, outcome, self.settings.lease_ttl)
            .await?;

        match job.state {
            JobState::Completed => {
                metrics::counter!("caption_jobs_completed_total").increment(1);
                tracing::info!(job_id = %job.id, output = ?job.artifacts.output, "Job completed");
                self.remove_scratch(job.id).await;
            }
            JobState::Failed => {
                let kind = job.error.as_ref().map(|e| e.kind.to_string()).unwrap_or_default();
                metrics::counter!("caption_jobs_failed_total", "kind" => kind).increment(1);
                tracing::warn!(job_id = %job.id, error = ?job.error, "Job failed");
                self.discard_intermediates(&job).await;
            }
            state => {
                tracing::info!(job_id = %job.id, state = %state, progress = job.progress, "Job advanced");
            }
        }
        Ok(job)
    }

    /// Request cancellation. A job nobody is working on fails right away;
    /// a running job is stopped by its worker at the next boundary.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, OrchestratorError> {
        let (outcome, job) = self.store.cancel(job_id).await?;
        if outcome == CancelOutcome::Cancelled {
            metrics::counter!("caption_jobs_failed_total", "kind" => "Cancelled").increment(1);
            self.discard_intermediates(&job).await;
        }
        tracing::info!(job_id = %job_id, outcome = ?outcome, "Cancellation requested");
        Ok(outcome)
    }

    /// Cancel, wait for the job to settle, then remove everything it owns.
    pub async fn delete(&self, job_id: Uuid) -> Result<(), OrchestratorError> {
        let first = self.cancel(job_id).await?;
        let deadline = Instant::now() + self.settings.lease_ttl + self.settings.poll_interval;
        let step = (self.settings.poll_interval / 4).max(Duration::from_millis(10));

        let job = if first == CancelOutcome::Requested {
            loop {
                // Re-requesting fails the job once the holder's lease lapses.
                let (outcome, job) = self.store.cancel(job_id).await?;
                if job.state.is_terminal() {
                    if outcome == CancelOutcome::Cancelled {
                        self.discard_intermediates(&job).await;
                    }
                    break job;
                }
                if Instant::now() >= deadline {
                    return Err(OrchestratorError::Busy(job_id));
                }
                tokio::time::sleep(step).await;
            }
        } else {
            self.get(job_id).await?
        };

        let mut locators = job.artifacts.intermediate_locators();
        locators.extend(job.artifacts.output.clone());
        locators.extend(job.source.uploaded_locator().map(str::to_string));
        for locator in &locators {
            if let Err(e) = self.storage.delete(locator).await {
                tracing::warn!(job_id = %job_id, locator = %locator, error = %e, "Failed to delete artifact");
            }
        }
        self.remove_scratch(job_id).await;
        self.store.delete(job_id).await?;

        tracing::info!(job_id = %job_id, artifacts = locators.len(), "Job deleted");
        Ok(())
    }

    /// Start `count` workers that run until `shutdown` fires.
    pub fn spawn_workers(
        self: &Arc<Self>,
        count: usize,
        prefix: &str,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|i| {
                let orchestrator = self.clone();
                let worker_id = format!("{}-{}", prefix, i);
                let shutdown = shutdown.clone();
                tokio::spawn(async move { orchestrator.run_worker(worker_id, shutdown).await })
            })
            .collect()
    }

    pub async fn run_worker(&self, worker_id: String, shutdown: CancellationToken) {
        tracing::info!(worker_id = %worker_id, "Worker started");
        while !shutdown.is_cancelled() {
            match self.claim_next(&worker_id).await {
                Ok(Some((job, lease))) => self.process(job, lease, &shutdown).await,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        signal = self.queue.wait(self.settings.poll_interval) => {
                            if let Err(e) = signal {
                                tracing::warn!(worker_id = %worker_id, error = %e, "Work queue unavailable");
                                tokio::time::sleep(self.settings.poll_interval).await;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(worker_id = %worker_id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.poll_interval) => {}
                    }
                }
            }
        }
        tracing::info!(worker_id = %worker_id, "Worker stopped");
    }

    /// Drive a leased job until it is terminal, the lease is lost or the
    /// worker is shutting down.
    async fn process(&self, mut job: CaptionJob, mut lease: Lease, shutdown: &CancellationToken) {
        while let Some(stage) = job.state.stage() {
            if shutdown.is_cancelled() {
                if let Err(e) = self.store.release(&lease).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to release lease on shutdown");
                }
                tracing::info!(job_id = %job.id, state = %job.state, "Released job for shutdown");
                return;
            }

            let outcome = match self.run_stage(&job, &mut lease, stage).await {
                StageRun::Done(output) => StageOutcome::Completed(output),
                StageRun::Failed(error) => StageOutcome::Failed(error),
                StageRun::Cancelled => StageOutcome::Failed(JobError::cancelled(Some(stage))),
                StageRun::LeaseLost => {
                    tracing::warn!(job_id = %job.id, stage = %stage, "Lease lost, discarding stage result");
                    return;
                }
            };

            match self.advance(&lease, outcome).await {
                Ok(updated) => {
                    if let Some(renewed) = &updated.lease {
                        lease = renewed.clone();
                    }
                    job = updated;
                }
                Err(OrchestratorError::LeaseExpired(_)) => {
                    tracing::warn!(job_id = %job.id, stage = %stage, "Lease expired before commit, result discarded");
                    return;
                }
                Err(e) => {
                    tracing::error!(job_id = %job.id, stage = %stage, error = %e, "Failed to commit stage");
                    return;
                }
            }
        }
    }

    /// One stage with cancellation checks, bounded retry and lease renewal.
    async fn run_stage(&self, job: &CaptionJob, lease: &mut Lease, stage: Stage) -> StageRun {
        let policy = self.settings.retry;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if let Some(run) = self.check_cancelled(job.id).await {
                return run;
            }

            tracing::info!(job_id = %job.id, stage = %stage, attempt, "Running stage");
            let result = match self.workspace.prepare(job.id, stage).await {
                Ok(scratch) => {
                    match self
                        .with_lease(lease, self.pipeline.run(job, stage, &scratch))
                        .await
                    {
                        Ok(result) => result,
                        Err(LeaseLost) => return StageRun::LeaseLost,
                    }
                }
                Err(e) => Err(JobError::new(
                    ErrorKind::IoFailure,
                    format!("scratch directory: {}", e),
                )),
            };

            match result {
                Ok(output) => {
                    metrics::histogram!("caption_stage_seconds", "stage" => stage.to_string())
                        .record(started.elapsed().as_secs_f64());
                    // A cancel that arrived mid-call wins over the finished output.
                    if let Some(run) = self.check_cancelled(job.id).await {
                        self.discard_output(lease, &output).await;
                        return run;
                    }
                    return StageRun::Done(output);
                }
                Err(error) => {
                    if !error.kind.is_retryable() || !policy.should_retry(attempt) {
                        tracing::warn!(
                            job_id = %job.id,
                            stage = %stage,
                            attempt,
                            kind = %error.kind,
                            error = %error.message,
                            "Stage failed"
                        );
                        return StageRun::Failed(error.in_stage(stage, attempt));
                    }

                    let delay = policy.backoff(attempt);
                    metrics::counter!("caption_stage_retries_total", "stage" => stage.to_string())
                        .increment(1);
                    tracing::warn!(
                        job_id = %job.id,
                        stage = %stage,
                        attempt,
                        kind = %error.kind,
                        error = %error.message,
                        delay_ms = delay.as_millis() as u64,
                        "Stage attempt failed, retrying"
                    );
                    if self
                        .with_lease(lease, tokio::time::sleep(delay))
                        .await
                        .is_err()
                    {
                        return StageRun::LeaseLost;
                    }
                }
            }
        }
    }

    /// `Some` when the stage must stop: cancellation was requested or the
    /// record is gone.
    async fn check_cancelled(&self, job_id: Uuid) -> Option<StageRun> {
        match self.store.get(job_id).await {
            Ok(Some(current)) if current.cancel_requested => Some(StageRun::Cancelled),
            Ok(Some(_)) => None,
            Ok(None) => Some(StageRun::LeaseLost),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Cancellation check failed");
                None
            }
        }
    }

    /// Run `work` while renewing `lease` every third of its TTL. Gives up on
    /// the work as soon as a renewal is refused.
    async fn with_lease<T>(
        &self,
        lease: &mut Lease,
        work: impl Future<Output = T>,
    ) -> Result<T, LeaseLost> {
        let ttl = self.settings.lease_ttl;
        let period = (ttl / 3).max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Ok(output),
                _ = ticker.tick() => {
                    match self.store.renew(lease, ttl).await {
                        Ok(renewed) => *lease = renewed,
                        Err(e) => {
                            tracing::warn!(job_id = %lease.job_id, error = %e, "Lease renewal refused");
                            return Err(LeaseLost);
                        }
                    }
                }
            }
        }
    }

    /// Remove stage intermediates and scratch space of a job that will not finish.
    async fn discard_intermediates(&self, job: &CaptionJob) {
        for locator in job.artifacts.intermediate_locators() {
            if let Err(e) = self.storage.delete(&locator).await {
                tracing::warn!(job_id = %job.id, locator = %locator, error = %e, "Failed to delete intermediate");
            }
        }
        self.remove_scratch(job.id).await;
    }

    /// Remove an artifact that was written but will never be committed.
    /// Stage keys are shared by every run of a job, so the delete happens only
    /// while `lease` still holds; otherwise the key may belong to a newer run.
    async fn discard_output(&self, lease: &mut Lease, output: &StageOutput) {
        match self.store.renew(lease, self.settings.lease_ttl).await {
            Ok(renewed) => *lease = renewed,
            Err(e) => {
                tracing::warn!(job_id = %lease.job_id, locator = output.locator(), error = %e, "Lease lost, leaving output in place");
                return;
            }
        }
        if let Err(e) = self.storage.delete(output.locator()).await {
            tracing::warn!(job_id = %lease.job_id, locator = output.locator(), error = %e, "Failed to delete uncommitted output");
        }
    }

    async fn remove_scratch(&self, job_id: Uuid) {
        if let Err(e) = self.workspace.cleanup(job_id).await {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to remove scratch directory");
        }
    }
}
