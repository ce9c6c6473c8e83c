//! Transcription cache keyed by audio fingerprint.
//!
//! Each distinct audio content is transcribed once: concurrent requests for
//! the same fingerprint share one in-flight computation, failures are
//! broadcast to every waiter of that attempt and never stored, and entries are
//! handed out as `Arc`s so eviction cannot pull a transcript from under a
//! reader.
//!
//! A cache may also be backed by shared [`Storage`]: a computing caller
//! first looks for `transcripts/{fingerprint}.json` there and writes every
//! fresh transcript back, so separate worker processes transcribe identical
//! audio once between them.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::models::transcript::{Segment, Transcript};
use crate::services::storage::{transcript_key, Storage, StorageError};
use crate::services::transcription::TranscribeError;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Upper bound on the summed size of cached segments.
    pub max_bytes: usize,
    pub ttl: Duration,
    /// Allowed disagreement between cached coverage and the job's audio length.
    pub tolerance_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 512,
            max_bytes: 64 * 1024 * 1024,
            ttl: Duration::from_secs(86_400),
            tolerance_ms: 500,
        }
    }
}

/// How a transcript was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheLookup {
    /// Served from a stored entry.
    Hit,
    /// This caller ran the computation.
    Computed,
    /// Another caller's in-flight computation was awaited.
    Joined,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    /// Hits answered by the shared store rather than this process.
    pub shared_hits: u64,
    pub misses: u64,
    pub joins: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

type FlightResult = Option<Result<Arc<Transcript>, TranscribeError>>;

struct Flight {
    id: u64,
    tx: watch::Sender<FlightResult>,
}

struct Entry {
    transcript: Arc<Transcript>,
    bytes: usize,
    last_used_at: DateTime<Utc>,
    last_used_tick: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    inflight: HashMap<String, Flight>,
    tick: u64,
    next_flight: u64,
    stats: CacheStats,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn remove(&mut self, fingerprint: &str) -> Option<Entry> {
        let entry = self.entries.remove(fingerprint)?;
        self.stats.bytes = self.stats.bytes.saturating_sub(entry.bytes);
        self.stats.entries = self.entries.len();
        Some(entry)
    }

    /// Fresh, consistent entry for `fingerprint`, refreshing its recency.
    fn lookup(
        &mut self,
        fingerprint: &str,
        audio_duration_ms: u64,
        config: &CacheConfig,
        now: DateTime<Utc>,
    ) -> Option<Arc<Transcript>> {
        let entry = self.entries.get(fingerprint)?;
        let (expired, mismatched) = staleness(&entry.transcript, audio_duration_ms, config, now);

        if expired || mismatched {
            tracing::debug!(
                fingerprint = %fingerprint,
                expired,
                mismatched,
                "Discarding cached transcript"
            );
            self.remove(fingerprint);
            self.stats.invalidations += 1;
            return None;
        }

        let tick = self.next_tick();
        let entry = self.entries.get_mut(fingerprint)?;
        entry.last_used_at = now;
        entry.last_used_tick = tick;
        Some(entry.transcript.clone())
    }

    fn insert(&mut self, transcript: Arc<Transcript>, config: &CacheConfig, now: DateTime<Utc>) {
        let fingerprint = transcript.fingerprint.clone();
        self.remove(&fingerprint);
        let bytes = transcript.byte_size();
        let tick = self.next_tick();
        self.entries.insert(
            fingerprint.clone(),
            Entry {
                transcript,
                bytes,
                last_used_at: now,
                last_used_tick: tick,
            },
        );
        self.stats.bytes += bytes;
        self.stats.entries = self.entries.len();
        self.evict(&fingerprint, config);
    }

    /// Drop least-recently-used entries until within bounds. The entry just
    /// inserted is never the victim.
    fn evict(&mut self, keep: &str, config: &CacheConfig) {
        while self.entries.len() > config.max_entries || self.stats.bytes > config.max_bytes {
            let victim = self
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != keep)
                .min_by_key(|(_, e)| e.last_used_tick)
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = self.remove(&victim) {
                tracing::debug!(
                    fingerprint = %victim,
                    bytes = entry.bytes,
                    last_used_at = %entry.last_used_at,
                    "Evicting cached transcript"
                );
            }
            self.stats.evictions += 1;
            metrics::counter!("transcript_cache_evictions_total").increment(1);
        }
    }
}

/// `(expired, mismatched)` for a transcript judged against a job's audio.
fn staleness(
    transcript: &Transcript,
    audio_duration_ms: u64,
    config: &CacheConfig,
    now: DateTime<Utc>,
) -> (bool, bool) {
    let ttl = chrono::Duration::from_std(config.ttl).unwrap_or(chrono::Duration::MAX);
    let expired = now.signed_duration_since(transcript.created_at) >= ttl;
    let mismatched = transcript.audio_duration_ms.abs_diff(audio_duration_ms)
        > config.tolerance_ms
        || transcript.coverage_end_ms() > audio_duration_ms + config.tolerance_ms;
    (expired, mismatched)
}

enum Role {
    Leader(u64),
    Follower(watch::Receiver<FlightResult>),
}

pub struct TranscriptCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    shared: Option<Arc<dyn Storage>>,
}

impl TranscriptCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            shared: None,
        }
    }

    /// Read through and write through `storage`, which other processes share.
    pub fn with_shared_store(mut self, storage: Arc<dyn Storage>) -> Self {
        self.shared = Some(storage);
        self
    }

    /// Return the transcript for `fingerprint`, running `compute` only if no
    /// usable entry exists and no other caller is already computing it.
    pub async fn get_or_compute<F, Fut>(
        &self,
        fingerprint: &str,
        audio_duration_ms: u64,
        compute: F,
    ) -> Result<(Arc<Transcript>, CacheLookup), TranscribeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Segment>, TranscribeError>>,
    {
        let mut compute = Some(compute);
        loop {
            let role = {
                let mut guard = self.inner.lock();
                let inner = &mut *guard;
                if let Some(transcript) =
                    inner.lookup(fingerprint, audio_duration_ms, &self.config, Utc::now())
                {
                    inner.stats.hits += 1;
                    metrics::counter!("transcript_cache_hits_total").increment(1);
                    return Ok((transcript, CacheLookup::Hit));
                }
                match inner.inflight.get(fingerprint) {
                    Some(flight) => {
                        inner.stats.joins += 1;
                        Role::Follower(flight.tx.subscribe())
                    }
                    None => {
                        inner.next_flight += 1;
                        let id = inner.next_flight;
                        let (tx, _rx) = watch::channel(None);
                        inner.inflight.insert(fingerprint.to_string(), Flight { id, tx });
                        Role::Leader(id)
                    }
                }
            };

            match role {
                Role::Follower(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(value) => value.clone(),
                        // Leader went away without an answer; take another turn.
                        Err(_) => continue,
                    };
                    if let Some(result) = outcome {
                        return result.map(|t| (t, CacheLookup::Joined));
                    }
                }
                Role::Leader(id) => {
                    let Some(compute) = compute.take() else {
                        return Err(TranscribeError::ModelFailure(
                            "transcription already attempted by this caller".to_string(),
                        ));
                    };
                    let mut flight = FlightGuard {
                        cache: self,
                        fingerprint,
                        id,
                        finished: false,
                    };

                    if let Some(transcript) = self.load_shared(fingerprint, audio_duration_ms).await
                    {
                        {
                            let mut inner = self.inner.lock();
                            inner.stats.hits += 1;
                            inner.stats.shared_hits += 1;
                        }
                        metrics::counter!("transcript_cache_hits_total").increment(1);
                        flight.finish(Ok(transcript.clone()));
                        return Ok((transcript, CacheLookup::Hit));
                    }

                    self.inner.lock().stats.misses += 1;
                    metrics::counter!("transcript_cache_misses_total").increment(1);
                    let result = compute().await.map(|segments| {
                        Arc::new(Transcript::new(
                            fingerprint,
                            audio_duration_ms,
                            segments,
                            Utc::now(),
                        ))
                    });
                    if let Ok(transcript) = &result {
                        self.save_shared(transcript).await;
                    }
                    flight.finish(result.clone());
                    return result.map(|t| (t, CacheLookup::Computed));
                }
            }
        }
    }

    /// Look up without computing. Counts as a use.
    #[cfg(test)]
    fn get(&self, fingerprint: &str, audio_duration_ms: u64) -> Option<Arc<Transcript>> {
        self.inner
            .lock()
            .lookup(fingerprint, audio_duration_ms, &self.config, Utc::now())
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    /// Fresh transcript from the shared store. Unreadable, expired or
    /// mismatched objects are removed and reported as absent.
    async fn load_shared(&self, fingerprint: &str, audio_duration_ms: u64) -> Option<Arc<Transcript>> {
        let storage = self.shared.as_ref()?;
        let locator = storage.locator(&transcript_key(fingerprint));
        let bytes = match storage.fetch(&locator).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return None,
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Failed to read shared transcript");
                return None;
            }
        };

        let usable = match serde_json::from_slice::<Transcript>(&bytes) {
            Ok(transcript) => {
                let (expired, mismatched) =
                    staleness(&transcript, audio_duration_ms, &self.config, Utc::now());
                let foreign = transcript.fingerprint != fingerprint;
                if expired || mismatched || foreign {
                    tracing::debug!(
                        fingerprint = %fingerprint,
                        expired,
                        mismatched,
                        foreign,
                        "Discarding shared transcript"
                    );
                    None
                } else {
                    Some(transcript)
                }
            }
            Err(e) => {
                tracing::warn!(fingerprint = %fingerprint, error = %e, "Shared transcript is corrupt");
                None
            }
        };

        match usable {
            Some(transcript) => Some(Arc::new(transcript)),
            None => {
                self.inner.lock().stats.invalidations += 1;
                if let Err(e) = storage.delete(&locator).await {
                    tracing::warn!(fingerprint = %fingerprint, error = %e, "Failed to remove shared transcript");
                }
                None
            }
        }
    }

    async fn save_shared(&self, transcript: &Transcript) {
        let Some(storage) = &self.shared else { return };
        let body = match serde_json::to_vec(transcript) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(fingerprint = %transcript.fingerprint, error = %e, "Failed to encode transcript");
                return;
            }
        };
        if let Err(e) = storage
            .store(&body, &transcript_key(&transcript.fingerprint))
            .await
        {
            tracing::warn!(fingerprint = %transcript.fingerprint, error = %e, "Failed to share transcript");
        }
    }
}

/// Clears the in-flight slot even if the leader's future is dropped mid-way.
struct FlightGuard<'a> {
    cache: &'a TranscriptCache,
    fingerprint: &'a str,
    id: u64,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(&mut self, result: Result<Arc<Transcript>, TranscribeError>) {
        let mut inner = self.cache.inner.lock();
        if let Ok(transcript) = &result {
            inner.insert(transcript.clone(), &self.cache.config, Utc::now());
        }
        if let Some(flight) = self.take_flight(&mut inner) {
            flight.tx.send_replace(Some(result));
        }
        self.finished = true;
    }

    fn take_flight(&self, inner: &mut Inner) -> Option<Flight> {
        match inner.inflight.get(self.fingerprint) {
            Some(flight) if flight.id == self.id => inner.inflight.remove(self.fingerprint),
            _ => None,
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let mut inner = self.cache.inner.lock();
            self.take_flight(&mut inner);
        }
    }
}
