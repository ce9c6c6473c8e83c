//! Test harness: in-memory backends plus scripted collaborators

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use caption_pipeline::models::job::{
    CancelOutcome, CaptionJob, Lease, Source, StageOutcome, TransitionError,
};
use caption_pipeline::models::media::{MediaMetadata, PcmAudio};
use caption_pipeline::models::transcript::Segment;
use caption_pipeline::services::cache::{CacheConfig, TranscriptCache};
use caption_pipeline::services::media::{
    CompositeError, CompositeRequest, Compositor, ExtractError, MediaExtractor,
};
use caption_pipeline::services::orchestrator::{Orchestrator, OrchestratorSettings};
use caption_pipeline::services::queue::{LocalWorkQueue, WorkQueue};
use caption_pipeline::services::renderer::{CaptionRenderer, RenderConfig};
use caption_pipeline::services::retry::RetryPolicy;
use caption_pipeline::services::stages::Pipeline;
use caption_pipeline::services::storage::{MemoryStorage, Storage, StorageError};
use caption_pipeline::services::store::{JobStore, MemoryJobStore, StoreError};
use caption_pipeline::services::transcription::{TranscribeError, Transcriber};
use caption_pipeline::services::workspace::{JobScratch, Workspace};

use crate::fixtures;

/// Ordered record of collaborator calls, shared by all fakes of a harness.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct FakeExtractor {
    log: CallLog,
    pub calls: AtomicUsize,
    pub audio: PcmAudio,
    pub metadata: MediaMetadata,
}

#[async_trait]
impl MediaExtractor for FakeExtractor {
    async fn extract(
        &self,
        _source: &Source,
        scratch: &JobScratch,
    ) -> Result<(PcmAudio, MediaMetadata), ExtractError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("extract:{}", scratch.job_id));
        Ok((self.audio.clone(), self.metadata.clone()))
    }
}

pub struct FakeTranscriber {
    log: CallLog,
    pub calls: AtomicUsize,
    segments: Vec<Segment>,
    failures: Mutex<VecDeque<TranscribeError>>,
    delay: Duration,
}

impl FakeTranscriber {
    /// Queue errors returned by the next calls, in order.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = TranscribeError>) {
        self.failures.lock().extend(errors);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(&self, _audio: &PcmAudio) -> Result<Vec<Segment>, TranscribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("transcribe".to_string());
        let failure = self.failures.lock().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.segments.clone())
    }
}

pub struct FakeCompositor {
    log: CallLog,
    pub calls: AtomicUsize,
    storage: Arc<dyn Storage>,
}

impl FakeCompositor {
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Compositor for FakeCompositor {
    async fn composite(&self, request: CompositeRequest<'_>) -> Result<String, CompositeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("composite:{}", request.job_id));
        tokio::fs::write(request.scratch.path("output.mp4"), b"scratch")
            .await
            .map_err(|e| CompositeError::IoFailure(e.to_string()))?;
        let body = format!("captioned {} overlays", request.overlays.overlays.len());
        Ok(self.storage.store(body.as_bytes(), &request.output_key).await?)
    }
}

/// Pauses the first `store` of a key containing `pattern` until released.
pub struct StorageGate {
    pattern: String,
    used: AtomicBool,
    pub reached: Notify,
    pub release: Notify,
}

impl StorageGate {
    pub fn new(pattern: &str) -> Arc<Self> {
        Arc::new(Self {
            pattern: pattern.to_string(),
            used: AtomicBool::new(false),
            reached: Notify::new(),
            release: Notify::new(),
        })
    }
}

pub struct GatedStorage {
    inner: Arc<MemoryStorage>,
    gate: Option<Arc<StorageGate>>,
}

#[async_trait]
impl Storage for GatedStorage {
    async fn store(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        if let Some(gate) = &self.gate {
            if key.contains(&gate.pattern) && !gate.used.swap(true, Ordering::SeqCst) {
                gate.reached.notify_one();
                gate.release.notified().await;
            }
        }
        self.inner.store(bytes, key).await
    }

    fn locator(&self, key: &str) -> String {
        self.inner.locator(key)
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.fetch(locator).await
    }

    async fn delete(&self, locator: &str) -> Result<(), StorageError> {
        self.inner.delete(locator).await
    }
}

/// Job store wrapper that counts lease traffic and can revoke leases, the
/// way a reclaim by another worker would.
pub struct RecordingStore {
    inner: Arc<dyn JobStore>,
    claims: AtomicUsize,
    renewals: AtomicUsize,
    revoked: Mutex<Vec<Uuid>>,
    refused: Mutex<Vec<&'static str>>,
}

impl RecordingStore {
    pub fn new(inner: Arc<dyn JobStore>) -> Self {
        Self {
            inner,
            claims: AtomicUsize::new(0),
            renewals: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
            refused: Mutex::new(Vec::new()),
        }
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renewals.load(Ordering::SeqCst)
    }

    /// Refuse every later renew, advance or release presenting `token`.
    pub fn revoke(&self, token: Uuid) {
        self.revoked.lock().push(token);
    }

    /// Operations refused because their lease was revoked, in order.
    pub fn refused(&self) -> Vec<&'static str> {
        self.refused.lock().clone()
    }

    fn check(&self, lease: &Lease, operation: &'static str) -> Result<(), StoreError> {
        if self.revoked.lock().contains(&lease.token) {
            self.refused.lock().push(operation);
            return Err(TransitionError::LeaseExpired(lease.job_id).into());
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for RecordingStore {
    async fn insert(&self, job: &CaptionJob) -> Result<(), StoreError> {
        self.inner.insert(job).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<CaptionJob>, StoreError> {
        self.inner.get(id).await
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<CaptionJob>, StoreError> {
        self.inner.list(limit, offset).await
    }

    async fn claim_next(
        &self,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<(CaptionJob, Lease)>, StoreError> {
        let claimed = self.inner.claim_next(owner, ttl).await?;
        if claimed.is_some() {
            self.claims.fetch_add(1, Ordering::SeqCst);
        }
        Ok(claimed)
    }

    async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, StoreError> {
        self.check(lease, "renew")?;
        let renewed = self.inner.renew(lease, ttl).await?;
        self.renewals.fetch_add(1, Ordering::SeqCst);
        Ok(renewed)
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        self.check(lease, "release")?;
        self.inner.release(lease).await
    }

    async fn advance(
        &self,
        lease: &Lease,
        outcome: StageOutcome,
        ttl: Duration,
    ) -> Result<CaptionJob, StoreError> {
        self.check(lease, "advance")?;
        self.inner.advance(lease, outcome, ttl).await
    }

    async fn cancel(&self, id: Uuid) -> Result<(CancelOutcome, CaptionJob), StoreError> {
        self.inner.cancel(id).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner.delete(id).await
    }

    async fn claimable_count(&self) -> Result<u64, StoreError> {
        self.inner.claimable_count().await
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.inner.health_check().await
    }
}

pub struct HarnessOptions {
    pub segments: Vec<Segment>,
    pub transcribe_delay: Duration,
    pub lease_ttl: Duration,
    pub max_attempts: u32,
    pub gate: Option<Arc<StorageGate>>,
    pub store: Option<Arc<dyn JobStore>>,
    pub queue: Option<Arc<dyn WorkQueue>>,
    /// Blob storage to use, so several harnesses can share one.
    pub storage: Option<Arc<MemoryStorage>>,
    /// Back the transcript cache with the blob storage.
    pub shared_transcripts: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            segments: fixtures::hello_world(),
            transcribe_delay: Duration::ZERO,
            lease_ttl: Duration::from_secs(5),
            max_attempts: 3,
            gate: None,
            store: None,
            queue: None,
            storage: None,
            shared_transcripts: false,
        }
    }
}

pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub storage: Arc<MemoryStorage>,
    pub store: Arc<RecordingStore>,
    pub extractor: Arc<FakeExtractor>,
    pub transcriber: Arc<FakeTranscriber>,
    pub compositor: Arc<FakeCompositor>,
    pub log: CallLog,
    pub work_dir: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(HarnessOptions::default())
    }

    pub fn with_options(options: HarnessOptions) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let storage = options.storage.unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let shared: Arc<dyn Storage> = Arc::new(GatedStorage {
            inner: storage.clone(),
            gate: options.gate,
        });

        let extractor = Arc::new(FakeExtractor {
            log: log.clone(),
            calls: AtomicUsize::new(0),
            audio: fixtures::clip_audio(),
            metadata: fixtures::clip_metadata(),
        });
        let transcriber = Arc::new(FakeTranscriber {
            log: log.clone(),
            calls: AtomicUsize::new(0),
            segments: options.segments,
            failures: Mutex::new(VecDeque::new()),
            delay: options.transcribe_delay,
        });
        let compositor = Arc::new(FakeCompositor {
            log: log.clone(),
            calls: AtomicUsize::new(0),
            storage: shared.clone(),
        });

        let mut cache = TranscriptCache::new(CacheConfig::default());
        if options.shared_transcripts {
            cache = cache.with_shared_store(shared.clone());
        }

        let pipeline = Pipeline {
            extractor: extractor.clone(),
            transcriber: transcriber.clone(),
            compositor: compositor.clone(),
            storage: shared,
            cache: Arc::new(cache),
            renderer: CaptionRenderer::new(RenderConfig::default()),
        };

        let settings = OrchestratorSettings {
            lease_ttl: options.lease_ttl,
            poll_interval: Duration::from_millis(20),
            retry: RetryPolicy {
                max_attempts: options.max_attempts,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..OrchestratorSettings::default()
        };

        let work_dir = std::env::temp_dir().join(format!("caption-pipeline-test-{}", Uuid::new_v4()));
        let store = Arc::new(RecordingStore::new(
            options
                .store
                .unwrap_or_else(|| Arc::new(MemoryJobStore::new()) as Arc<dyn JobStore>),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            options
                .queue
                .unwrap_or_else(|| Arc::new(LocalWorkQueue::new()) as Arc<dyn WorkQueue>),
            pipeline,
            Workspace::new(&work_dir),
            settings,
        ));

        Self {
            orchestrator,
            storage,
            store,
            extractor,
            transcriber,
            compositor,
            log,
            work_dir,
        }
    }

    /// Start `count` workers; cancel the returned token to stop them.
    pub fn start_workers(&self, count: usize) -> Workers {
        let shutdown = CancellationToken::new();
        let handles = self
            .orchestrator
            .spawn_workers(count, "test-worker", shutdown.clone());
        Workers { shutdown, handles }
    }

    pub async fn wait_for_terminal(&self, job_id: Uuid) -> CaptionJob {
        wait_for_terminal(&self.orchestrator, job_id, Duration::from_secs(10)).await
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

pub struct Workers {
    shutdown: CancellationToken,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Workers {
    pub async fn stop(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            handle.await.expect("worker panicked");
        }
    }
}

/// Poll until the job is completed or failed.
pub async fn wait_for_terminal(
    orchestrator: &Orchestrator,
    job_id: Uuid,
    timeout: Duration,
) -> CaptionJob {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = orchestrator.get(job_id).await.expect("job lookup failed");
        if job.state.is_terminal() {
            return job;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "job {} did not finish within {:?}; last state {}",
                job_id, timeout, job.state
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
