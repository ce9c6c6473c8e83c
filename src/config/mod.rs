use serde::Deserialize;
use std::time::Duration;

use crate::services::cache::CacheConfig;
use crate::services::orchestrator::OrchestratorSettings;
use crate::services::renderer::{OverflowPolicy, RenderConfig};
use crate::services::retry::RetryPolicy;

/// Runtime configuration read from the environment (and `.env` if present).
///
/// Every backend is optional: without `DATABASE_URL`, `REDIS_URL` or
/// `R2_BUCKET` the process falls back to in-memory or local equivalents.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Ignored by worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Address the worker binary serves `/metrics` on; unset disables it.
    pub worker_metrics_addr: Option<String>,

    /// PostgreSQL connection string
    pub database_url: Option<String>,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// Redis connection string for the work queue
    pub redis_url: Option<String>,

    /// Cloudflare account ID
    #[serde(default)]
    pub cf_account_id: String,

    /// Cloudflare Workers AI API token
    #[serde(default)]
    pub cf_api_token: String,

    /// R2 bucket name; local storage is used when unset
    pub r2_bucket: Option<String>,

    /// R2 access key ID (S3-compatible)
    #[serde(default)]
    pub r2_access_key: String,

    /// R2 secret access key (S3-compatible)
    #[serde(default)]
    pub r2_secret_key: String,

    /// R2 endpoint URL
    #[serde(default)]
    pub r2_endpoint: String,

    /// Root directory of the local storage backend
    #[serde(default = "default_storage_dir")]
    pub storage_dir: String,

    /// AES-256-GCM key (base64-encoded, 32 bytes). Artifacts are stored in
    /// the clear when unset.
    pub encryption_key: Option<String>,

    /// Scratch space for per-job stage directories
    #[serde(default = "default_work_dir")]
    pub work_dir: String,

    /// Workers spawned by the worker binary
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Workers the API server runs in-process; 0 disables them
    #[serde(default = "default_embedded_workers")]
    pub embedded_workers: usize,

    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_max_stage_attempts")]
    pub max_stage_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Allowed gap between cached transcript coverage and audio length
    #[serde(default = "default_coverage_tolerance_ms")]
    pub coverage_tolerance_ms: u64,

    #[serde(default = "default_transcription_timeout_secs")]
    pub transcription_timeout_secs: u64,

    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Comma-separated container extensions accepted at submission
    #[serde(default = "default_video_formats")]
    pub video_formats: String,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: String,

    /// Directory holding the caption font files
    #[serde(default = "default_font_dir")]
    pub font_dir: String,

    #[serde(default)]
    pub caption_overflow: OverflowPolicy,

    #[serde(default = "default_caption_max_lines")]
    pub caption_max_lines: usize,

    #[serde(default)]
    pub highlight_words: bool,

    #[serde(default = "default_highlight_color")]
    pub highlight_color: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_db_max_connections() -> u32 {
    20
}

fn default_storage_dir() -> String {
    "./data/storage".to_string()
}

fn default_work_dir() -> String {
    std::env::temp_dir()
        .join("caption-pipeline")
        .to_string_lossy()
        .into_owned()
}

fn default_worker_count() -> usize {
    4
}

fn default_embedded_workers() -> usize {
    2
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_stage_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_cache_max_entries() -> usize {
    512
}

fn default_cache_max_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_coverage_tolerance_ms() -> u64 {
    500
}

fn default_transcription_timeout_secs() -> u64 {
    300
}

fn default_max_upload_mb() -> usize {
    500
}

fn default_video_formats() -> String {
    "mp4,avi,mov,mkv,webm".to_string()
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_ffprobe_path() -> String {
    "ffprobe".to_string()
}

fn default_font_dir() -> String {
    "./fonts".to_string()
}

fn default_caption_max_lines() -> usize {
    2
}

fn default_highlight_color() -> String {
    "#FFFF00".to_string()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs.max(1))
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_secs(self.transcription_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }

    pub fn video_formats(&self) -> Vec<String> {
        self.video_formats
            .split(',')
            .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_stage_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_entries: self.cache_max_entries.max(1),
            max_bytes: self.cache_max_bytes,
            ttl: Duration::from_secs(self.cache_ttl_secs),
            tolerance_ms: self.coverage_tolerance_ms,
        }
    }

    pub fn render_config(&self) -> RenderConfig {
        RenderConfig {
            max_lines: self.caption_max_lines.max(1),
            overflow: self.caption_overflow,
            highlight_words: self.highlight_words,
            highlight_color: self.highlight_color.clone(),
            ..RenderConfig::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            lease_ttl: self.lease_ttl(),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(10)),
            retry: self.retry_policy(),
            video_formats: self.video_formats(),
        }
    }
}
