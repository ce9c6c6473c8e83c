use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const QUEUE_KEY: &str = "caption_pipeline:jobs";

/// Wake-up channel between submitters and idle workers.
///
/// The job store stays authoritative: a signal only tells a worker that
/// `claim_next` is worth trying, so lost or duplicated signals are harmless.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn notify(&self, job_id: Uuid) -> Result<(), QueueError>;

    /// Block up to `timeout` for a signal. `None` means the wait timed out.
    async fn wait(&self, timeout: Duration) -> Result<Option<Uuid>, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

/// Redis list shared by API servers and worker processes.
pub struct RedisWorkQueue {
    client: redis::Client,
}

impl RedisWorkQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn notify(&self, job_id: Uuid) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, job_id.to_string()).await?;
        Ok(())
    }

    async fn wait(&self, timeout: Duration) -> Result<Option<Uuid>, QueueError> {
        // BRPOP holds the connection, so it gets one of its own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let popped: Option<(String, String)> =
            conn.brpop(QUEUE_KEY, timeout.as_secs_f64().max(0.01)).await?;
        Ok(popped.and_then(|(_, id)| Uuid::parse_str(&id).ok()))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

/// In-process queue for a single binary running both API and workers.
#[derive(Default)]
pub struct LocalWorkQueue {
    pending: Mutex<VecDeque<Uuid>>,
    notify: Notify,
}

impl LocalWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkQueue for LocalWorkQueue {
    async fn notify(&self, job_id: Uuid) -> Result<(), QueueError> {
        self.pending.lock().push_back(job_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn wait(&self, timeout: Duration) -> Result<Option<Uuid>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(id) = self.pending.lock().pop_front() {
                return Ok(Some(id));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.pending.lock().pop_front());
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}
