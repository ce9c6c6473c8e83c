use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timed word inside a segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Word {
    pub text: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

/// A timed stretch of recognized speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_ms: u64,
    pub end_ms: u64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub words: Option<Vec<Word>>,
}

impl Segment {
    pub fn new(start_ms: u64, end_ms: u64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
            confidence: None,
            words: None,
        }
    }

    /// Build from the seconds-based timing transcription models report.
    pub fn from_secs(start: f64, end: f64, text: impl Into<String>) -> Self {
        Self::new(secs_to_ms(start), secs_to_ms(end), text)
    }

    pub fn with_words(mut self, words: Vec<Word>) -> Self {
        self.words = Some(words);
        self
    }

    /// Approximate heap footprint, used for cache accounting.
    pub fn byte_size(&self) -> usize {
        let words = self
            .words
            .as_ref()
            .map(|w| w.iter().map(|w| w.text.len() + 16).sum())
            .unwrap_or(0);
        self.text.len() + words + 32
    }
}

pub fn secs_to_ms(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs * 1000.0).round() as u64
    } else {
        0
    }
}

/// Timed text for one distinct audio content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub fingerprint: String,
    pub audio_duration_ms: u64,
    pub segments: Vec<Segment>,
    pub created_at: DateTime<Utc>,
}

impl Transcript {
    /// Normalize raw model output into ordered, non-overlapping segments.
    pub fn new(
        fingerprint: impl Into<String>,
        audio_duration_ms: u64,
        segments: Vec<Segment>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            audio_duration_ms,
            segments: normalize_segments(segments),
            created_at,
        }
    }

    /// End of the last segment.
    pub fn coverage_end_ms(&self) -> u64 {
        self.segments.last().map(|s| s.end_ms).unwrap_or(0)
    }

    pub fn byte_size(&self) -> usize {
        self.fingerprint.len() + self.segments.iter().map(Segment::byte_size).sum::<usize>()
    }
}

/// Sort by start, drop empty text, clip overlaps, keep start strictly increasing.
pub fn normalize_segments(mut segments: Vec<Segment>) -> Vec<Segment> {
    segments.retain(|s| !s.text.trim().is_empty());
    segments.sort_by(|a, b| a.start_ms.cmp(&b.start_ms).then(a.end_ms.cmp(&b.end_ms)));

    let mut out: Vec<Segment> = Vec::with_capacity(segments.len());
    for (i, mut segment) in segments.iter().cloned().enumerate() {
        if let Some(prev) = out.last() {
            if segment.start_ms <= prev.start_ms {
                continue;
            }
            if segment.start_ms < prev.end_ms {
                segment.start_ms = prev.end_ms;
            }
        }
        if let Some(next) = segments[i + 1..].iter().find(|n| n.start_ms > segment.start_ms) {
            segment.end_ms = segment.end_ms.min(next.start_ms);
        }
        if segment.end_ms <= segment.start_ms {
            continue;
        }
        segment.text = segment.text.trim().to_string();
        if let Some(words) = segment.words.take() {
            let words = normalize_words(words, segment.start_ms, segment.end_ms);
            segment.words = (!words.is_empty()).then_some(words);
        }
        out.push(segment);
    }
    out
}

fn normalize_words(words: Vec<Word>, start_ms: u64, end_ms: u64) -> Vec<Word> {
    let mut cursor = start_ms;
    let mut out = Vec::with_capacity(words.len());
    for word in words {
        let text = word.text.trim();
        if text.is_empty() {
            continue;
        }
        let start = word.start_ms.clamp(cursor, end_ms);
        let end = word.end_ms.clamp(start, end_ms);
        out.push(Word {
            text: text.to_string(),
            start_ms: start,
            end_ms: end,
        });
        cursor = start;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_unordered_overlapping_segments() {
        let segments = vec![
            Segment::new(2_500, 4_000, "world"),
            Segment::new(0, 3_000, "hello"),
            Segment::new(4_000, 4_000, "empty span"),
            Segment::new(5_000, 6_000, "   "),
        ];
        let normalized = normalize_segments(segments);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].text, "hello");
        assert_eq!(normalized[0].end_ms, 2_500);
        assert_eq!(normalized[1].start_ms, 2_500);
        assert!(normalized
            .windows(2)
            .all(|w| w[0].end_ms <= w[1].start_ms && w[0].start_ms < w[1].start_ms));
    }

    #[test]
    fn duplicate_starts_keep_the_shorter_first() {
        let normalized = normalize_segments(vec![
            Segment::new(1_000, 3_000, "long"),
            Segment::new(1_000, 2_000, "short"),
        ]);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized[0].text, "short");
    }

    #[test]
    fn words_are_clamped_into_segment() {
        let segment = Segment::new(1_000, 2_000, "a b").with_words(vec![
            Word {
                text: "a".to_string(),
                start_ms: 900,
                end_ms: 1_400,
            },
            Word {
                text: "b".to_string(),
                start_ms: 1_300,
                end_ms: 2_600,
            },
        ]);
        let normalized = normalize_segments(vec![segment]);
        let words = normalized[0].words.as_ref().unwrap();
        assert_eq!(words[0].start_ms, 1_000);
        assert_eq!(words[1].end_ms, 2_000);
    }

    #[test]
    fn seconds_round_to_milliseconds() {
        let segment = Segment::from_secs(0.0, 2.0006, "hello");
        assert_eq!(segment.end_ms, 2_001);
        assert_eq!(secs_to_ms(-1.0), 0);
        assert_eq!(secs_to_ms(f64::NAN), 0);
    }
}
