use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::job::ErrorKind;
use crate::models::media::PcmAudio;
use crate::models::transcript::{secs_to_ms, Segment, Word};
use crate::services::audio;

/// Speech-to-text collaborator.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &PcmAudio) -> Result<Vec<Segment>, TranscribeError>;
}

const WHISPER_MODEL: &str = "@cf/openai/whisper-large-v3-turbo";

/// Client for the Cloudflare Workers AI Whisper model.
pub struct WorkersAiTranscriber {
    http: Client,
    account_id: String,
    api_token: String,
}

#[derive(Deserialize)]
struct WhisperResponse {
    result: WhisperResult,
}

#[derive(Deserialize)]
struct WhisperResult {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
    #[serde(default)]
    words: Vec<WhisperWord>,
}

#[derive(Deserialize)]
struct WhisperWord {
    word: String,
    start: f64,
    end: f64,
}

impl WorkersAiTranscriber {
    pub fn new(
        account_id: &str,
        api_token: &str,
        timeout: Duration,
    ) -> Result<Self, TranscribeError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TranscribeError::ModelFailure(e.to_string()))?;
        Ok(Self {
            http,
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
        })
    }
}

#[async_trait]
impl Transcriber for WorkersAiTranscriber {
    /// Send normalized audio to Whisper and collect timed segments with word timings.
    async fn transcribe(&self, pcm: &PcmAudio) -> Result<Vec<Segment>, TranscribeError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, WHISPER_MODEL
        );

        let wav = audio::encode_wav(pcm)
            .map_err(|e| TranscribeError::ModelFailure(format!("WAV encoding failed: {}", e)))?;

        let request_body = serde_json::json!({
            "audio": base64::engine::general_purpose::STANDARD.encode(wav),
            "task": "transcribe",
            "vad_filter": true
        });

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .json(&request_body)
            .send()
            .await
            .map_err(TranscribeError::from_http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscribeError::ModelFailure(format!(
                "Whisper returned {}: {}",
                status, body
            )));
        }

        let whisper: WhisperResponse = response.json().await.map_err(TranscribeError::from_http)?;

        Ok(whisper
            .result
            .segments
            .into_iter()
            .map(|s| {
                let words: Vec<Word> = s
                    .words
                    .into_iter()
                    .map(|w| Word {
                        text: w.word,
                        start_ms: secs_to_ms(w.start),
                        end_ms: secs_to_ms(w.end),
                    })
                    .collect();
                let mut segment = Segment::from_secs(s.start, s.end, s.text);
                segment.confidence = s.avg_logprob.map(|p| p.exp().clamp(0.0, 1.0) as f32);
                if !words.is_empty() {
                    segment.words = Some(words);
                }
                segment
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscribeError {
    #[error("Transcription model failed: {0}")]
    ModelFailure(String),

    #[error("Transcription timed out: {0}")]
    Timeout(String),
}

impl TranscribeError {
    fn from_http(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TranscribeError::Timeout(e.to_string())
        } else {
            TranscribeError::ModelFailure(e.to_string())
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TranscribeError::ModelFailure(_) => ErrorKind::ModelFailure,
            TranscribeError::Timeout(_) => ErrorKind::TransientStageFailure,
        }
    }
}
