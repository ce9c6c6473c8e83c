use serde::{Deserialize, Serialize};

use crate::models::style::FontFamily;

/// One rendered text line, positioned in frame pixels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayLine {
    pub text: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
}

/// The currently spoken word, drawn in a distinct colour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub line: usize,
    pub word: usize,
    pub text: String,
    pub x: i32,
    pub width: u32,
    pub fill: String,
}

/// Caption box shown over `[start_ms, end_ms)` of the video timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overlay {
    pub start_ms: u64,
    pub end_ms: u64,
    pub x: i32,
    pub y: i32,
    pub box_width: u32,
    pub box_height: u32,
    pub font_family: FontFamily,
    pub font_size: u32,
    pub line_height: u32,
    pub fill: String,
    pub stroke: String,
    pub stroke_width: u32,
    pub lines: Vec<OverlayLine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub highlight: Option<Highlight>,
}

/// Ordered overlay descriptors for one video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayTrack {
    pub width: u32,
    pub height: u32,
    pub overlays: Vec<Overlay>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OverlayTimingError {
    #[error("overlay {index} has empty or inverted range {start_ms}..{end_ms}")]
    EmptyRange {
        index: usize,
        start_ms: u64,
        end_ms: u64,
    },

    #[error("overlay {index} ends at {end_ms}ms, past the video duration of {duration_ms}ms")]
    PastEnd {
        index: usize,
        end_ms: u64,
        duration_ms: u64,
    },

    #[error("overlay {index} starts at {start_ms}ms before the previous one ends at {previous_end_ms}ms")]
    Overlap {
        index: usize,
        start_ms: u64,
        previous_end_ms: u64,
    },
}

impl OverlayTrack {
    /// Canonical serialized form. Field order is fixed by the struct layout.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Overlays must be non-empty ranges, ordered, non-overlapping and
    /// inside `[0, duration_ms]`.
    pub fn validate_timing(&self, duration_ms: u64) -> Result<(), OverlayTimingError> {
        let mut previous_end = 0u64;
        for (index, overlay) in self.overlays.iter().enumerate() {
            if overlay.end_ms <= overlay.start_ms {
                return Err(OverlayTimingError::EmptyRange {
                    index,
                    start_ms: overlay.start_ms,
                    end_ms: overlay.end_ms,
                });
            }
            if overlay.end_ms > duration_ms {
                return Err(OverlayTimingError::PastEnd {
                    index,
                    end_ms: overlay.end_ms,
                    duration_ms,
                });
            }
            if index > 0 && overlay.start_ms < previous_end {
                return Err(OverlayTimingError::Overlap {
                    index,
                    start_ms: overlay.start_ms,
                    previous_end_ms: previous_end,
                });
            }
            previous_end = overlay.end_ms;
        }
        Ok(())
    }
}
