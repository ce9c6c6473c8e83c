pub mod audio;
pub mod cache;
pub mod encryption;
pub mod font_metrics;
pub mod media;
pub mod orchestrator;
pub mod queue;
pub mod renderer;
pub mod retry;
pub mod stages;
pub mod storage;
pub mod store;
pub mod transcription;
pub mod workspace;

/// Register descriptions for every metric the pipeline records.
pub fn describe_metrics() {
    metrics::describe_counter!("caption_jobs_submitted_total", "Total captioning jobs submitted");
    metrics::describe_counter!("caption_jobs_completed_total", "Total captioning jobs completed");
    metrics::describe_counter!(
        "caption_jobs_failed_total",
        "Total captioning jobs failed, by error kind"
    );
    metrics::describe_histogram!(
        "caption_stage_seconds",
        metrics::Unit::Seconds,
        "Wall time of a single stage attempt"
    );
    metrics::describe_counter!(
        "caption_stage_retries_total",
        "Stage attempts retried after a retryable failure"
    );
    metrics::describe_gauge!(
        "caption_queue_depth",
        "Jobs waiting to be claimed by a worker"
    );
    metrics::describe_counter!("transcript_cache_hits_total", "Transcript cache hits");
    metrics::describe_counter!("transcript_cache_misses_total", "Transcript cache misses");
    metrics::describe_counter!(
        "transcript_cache_evictions_total",
        "Transcript cache entries evicted for capacity or age"
    );
}
