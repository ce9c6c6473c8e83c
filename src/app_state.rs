use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::{self, PgJobStore};
use crate::services::{
    cache::TranscriptCache,
    encryption::{EncryptedStorage, EncryptionError, EncryptionService},
    media::FfmpegMedia,
    orchestrator::Orchestrator,
    queue::{LocalWorkQueue, QueueError, RedisWorkQueue, WorkQueue},
    renderer::CaptionRenderer,
    stages::Pipeline,
    storage::{LocalStorage, R2Storage, Storage, StorageError},
    store::{JobStore, MemoryJobStore},
    transcription::{TranscribeError, WorkersAiTranscriber},
    workspace::Workspace,
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub storage: Arc<dyn Storage>,
    pub cache: Arc<TranscriptCache>,
    pub max_upload_bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("Database initialization failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage initialization failed: {0}")]
    Storage(#[from] StorageError),

    #[error("Encryption initialization failed: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Work queue initialization failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Transcription client initialization failed: {0}")]
    Transcriber(#[from] TranscribeError),
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, max_upload_bytes: usize) -> Self {
        Self {
            storage: orchestrator.pipeline().storage.clone(),
            cache: orchestrator.pipeline().cache.clone(),
            orchestrator,
            max_upload_bytes,
        }
    }

    /// Wire every backend selected by `config`.
    pub async fn from_config(config: &AppConfig) -> Result<Self, StartupError> {
        let storage = build_storage(config)?;

        let store: Arc<dyn JobStore> = match &config.database_url {
            Some(url) => {
                tracing::info!("Connecting to PostgreSQL job store");
                let pool = db::init_pool(url, config.db_max_connections).await?;
                tracing::info!("Running database migrations");
                db::run_migrations(&pool).await?;
                Arc::new(PgJobStore::new(pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory job store");
                Arc::new(MemoryJobStore::new())
            }
        };

        let queue: Arc<dyn WorkQueue> = match &config.redis_url {
            Some(url) => {
                tracing::info!("Connecting to Redis work queue");
                Arc::new(RedisWorkQueue::new(url)?)
            }
            None => Arc::new(LocalWorkQueue::new()),
        };

        tracing::info!("Initializing Cloudflare Workers AI transcriber");
        let transcriber = Arc::new(WorkersAiTranscriber::new(
            &config.cf_account_id,
            &config.cf_api_token,
            config.transcription_timeout(),
        )?);

        let media = Arc::new(FfmpegMedia::new(
            &config.ffmpeg_path,
            &config.ffprobe_path,
            &config.font_dir,
            storage.clone(),
        ));

        let cache = TranscriptCache::new(config.cache_config()).with_shared_store(storage.clone());

        let pipeline = Pipeline {
            extractor: media.clone(),
            transcriber,
            compositor: media,
            storage,
            cache: Arc::new(cache),
            renderer: CaptionRenderer::new(config.render_config()),
        };

        let orchestrator = Orchestrator::new(
            store,
            queue,
            pipeline,
            Workspace::new(&config.work_dir),
            config.orchestrator_settings(),
        );

        Ok(Self::new(Arc::new(orchestrator), config.max_upload_bytes()))
    }
}

fn build_storage(config: &AppConfig) -> Result<Arc<dyn Storage>, StartupError> {
    let encryption = config
        .encryption_key
        .as_deref()
        .map(EncryptionService::new)
        .transpose()?;

    match &config.r2_bucket {
        Some(bucket) => {
            tracing::info!(bucket = %bucket, "Initializing R2 storage client");
            let r2 = R2Storage::new(
                bucket,
                &config.r2_endpoint,
                &config.r2_access_key,
                &config.r2_secret_key,
            )?;
            Ok(with_encryption(r2, encryption))
        }
        None => {
            tracing::info!(dir = %config.storage_dir, "Using local filesystem storage");
            Ok(with_encryption(
                LocalStorage::new(&config.storage_dir),
                encryption,
            ))
        }
    }
}

fn with_encryption<S: Storage + 'static>(
    storage: S,
    encryption: Option<EncryptionService>,
) -> Arc<dyn Storage> {
    match encryption {
        Some(encryption) => {
            tracing::info!("Encrypting stored artifacts with AES-256-GCM");
            Arc::new(EncryptedStorage::new(storage, encryption))
        }
        None => Arc::new(storage),
    }
}
