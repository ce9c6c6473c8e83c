use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::models::job::{
    CancelOutcome, CaptionJob, JobArtifacts, JobError, JobState, Lease, Source, StageOutcome,
    TransitionError,
};
use crate::models::style::CaptionStyle;
use crate::services::store::{lease_duration, JobStore, StoreError};

const COLUMNS: &str = "id, source, style, state, progress, error, lease_owner, lease_token, \
                       lease_expires_at, cancel_requested, artifacts, created_at, updated_at";

const CLAIMABLE: &str = "state NOT IN ('completed', 'failed') \
                         AND (lease_expires_at IS NULL OR lease_expires_at <= NOW())";

/// PostgreSQL job store.
///
/// Each mutation locks the row with `SELECT ... FOR UPDATE`, applies the
/// transition in Rust and writes the row back inside one transaction. Lease
/// times come from the database clock so workers on different hosts agree.
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn db_now(tx: &mut Transaction<'_, Postgres>) -> Result<DateTime<Utc>, StoreError> {
        Ok(sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&mut **tx)
            .await?)
    }

    async fn lock(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Option<CaptionJob>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM caption_jobs WHERE id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Lock the job, apply `f` at database time and persist the result.
    async fn mutate<R: Send>(
        &self,
        id: Uuid,
        missing: StoreError,
        f: impl FnOnce(&mut CaptionJob, DateTime<Utc>) -> Result<R, TransitionError> + Send,
    ) -> Result<(R, CaptionJob), StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Self::db_now(&mut tx).await?;
        let mut job = Self::lock(&mut tx, id).await?.ok_or(missing)?;
        let result = f(&mut job, now)?;
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok((result, job))
    }
}

fn job_from_row(row: &PgRow) -> Result<CaptionJob, StoreError> {
    let state: String = row.try_get("state")?;
    let state = JobState::from_str(&state)
        .map_err(|_| StoreError::Corrupt(format!("unknown job state '{}'", state)))?;
    let progress: i16 = row.try_get("progress")?;

    let lease_owner: Option<String> = row.try_get("lease_owner")?;
    let lease_token: Option<Uuid> = row.try_get("lease_token")?;
    let lease_expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
    let id: Uuid = row.try_get("id")?;
    let lease = match (lease_owner, lease_token, lease_expires_at) {
        (Some(owner), Some(token), Some(expires_at)) => Some(Lease {
            job_id: id,
            owner,
            token,
            expires_at,
        }),
        _ => None,
    };

    let Json(source): Json<Source> = row.try_get("source")?;
    let Json(style): Json<CaptionStyle> = row.try_get("style")?;
    let error: Option<Json<JobError>> = row.try_get("error")?;
    let Json(artifacts): Json<JobArtifacts> = row.try_get("artifacts")?;

    Ok(CaptionJob {
        id,
        source,
        style,
        state,
        progress: progress.clamp(0, 100) as u8,
        error: error.map(|Json(e)| e),
        lease,
        cancel_requested: row.try_get("cancel_requested")?,
        artifacts,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &CaptionJob) -> Result<(), StoreError> {
    let lease = job.lease.as_ref();
    sqlx::query(
        r#"
        UPDATE caption_jobs
        SET state = $2,
            progress = $3,
            error = $4,
            lease_owner = $5,
            lease_token = $6,
            lease_expires_at = $7,
            cancel_requested = $8,
            artifacts = $9,
            updated_at = $10
        WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(job.state.as_ref())
    .bind(job.progress as i16)
    .bind(job.error.clone().map(Json))
    .bind(lease.map(|l| l.owner.clone()))
    .bind(lease.map(|l| l.token))
    .bind(lease.map(|l| l.expires_at))
    .bind(job.cancel_requested)
    .bind(Json(&job.artifacts))
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &CaptionJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO caption_jobs (id, source, style, state, progress, cancel_requested,
                                      artifacts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(Json(&job.source))
        .bind(Json(&job.style))
        .bind(job.state.as_ref())
        .bind(job.progress as i16)
        .bind(job.cancel_requested)
        .bind(Json(&job.artifacts))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CaptionJob>, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM caption_jobs WHERE id = $1", COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<CaptionJob>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM caption_jobs ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2",
            COLUMNS
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next(
        &self,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<(CaptionJob, Lease)>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Self::db_now(&mut tx).await?;
        let row = sqlx::query(&format!(
            "SELECT {} FROM caption_jobs WHERE {} ORDER BY created_at, id LIMIT 1 FOR UPDATE SKIP LOCKED",
            COLUMNS, CLAIMABLE
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };
        let mut job = job_from_row(&row)?;
        let lease = job.claim(owner, lease_duration(ttl), now);
        write_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(Some((job, lease)))
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        let missing = TransitionError::LeaseExpired(lease.job_id).into();
        let (renewed, _) = self
            .mutate(lease.job_id, missing, |job, now| {
                job.renew(lease, lease_duration(ttl), now)
            })
            .await?;
        Ok(renewed)
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let missing = TransitionError::LeaseExpired(lease.job_id).into();
        self.mutate(lease.job_id, missing, |job, now| job.release(lease, now))
            .await?;
        Ok(())
    }

    async fn advance(
        &self,
        lease: &Lease,
        outcome: StageOutcome,
        ttl: Duration,
    ) -> Result<CaptionJob, StoreError> {
        let missing = TransitionError::LeaseExpired(lease.job_id).into();
        let (_, job) = self
            .mutate(lease.job_id, missing, |job, now| {
                job.advance(lease, outcome, lease_duration(ttl), now)
            })
            .await?;
        Ok(job)
    }

    async fn cancel(&self, id: Uuid) -> Result<(CancelOutcome, CaptionJob), StoreError> {
        self.mutate(id, StoreError::NotFound(id), |job, now| {
            Ok(job.request_cancel(now))
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM caption_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn claimable_count(&self) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM caption_jobs WHERE {}", CLAIMABLE))
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn store() -> PgJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = db::init_pool(&url, 5).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        PgJobStore::new(pool)
    }

    fn job() -> CaptionJob {
        CaptionJob::new(
            Source::RemoteUrl {
                url: "https://example.com/talk.mp4".to_string(),
            },
            CaptionStyle::default(),
            Utc::now() - chrono::Duration::days(365),
        )
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL at DATABASE_URL
    async fn claim_advance_and_cancel_round_trip() {
        let store = store().await;
        let job = job();
        store.insert(&job).await.unwrap();

        let (claimed, lease) = store
            .claim_next("pg-test", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, job.id);
        assert_eq!(claimed.state, JobState::ExtractingAudio);

        let renewed = store.renew(&lease, Duration::from_secs(30)).await.unwrap();
        assert_eq!(renewed.token, lease.token);

        let (outcome, cancelled) = store.cancel(job.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Requested);
        assert!(cancelled.cancel_requested);

        let failed = store
            .advance(
                &renewed,
                StageOutcome::Failed(JobError::cancelled(None)),
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert!(failed.lease.is_none());

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.error, failed.error);
        assert!(store.delete(job.id).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL at DATABASE_URL
    async fn stale_lease_is_rejected() {
        let store = store().await;
        let job = job();
        store.insert(&job).await.unwrap();

        let (_, stale) = store
            .claim_next("pg-a", Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let (_, fresh) = store
            .claim_next("pg-b", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(stale.token, fresh.token);
        assert!(matches!(
            store.release(&stale).await,
            Err(StoreError::Transition(TransitionError::LeaseExpired(_)))
        ));
        store.release(&fresh).await.unwrap();
        store.delete(job.id).await.unwrap();
    }
}
