//! Test fixtures: sources, styles, audio and transcripts used across suites

use caption_pipeline::models::job::Source;
use caption_pipeline::models::media::{MediaMetadata, PcmAudio};
use caption_pipeline::models::style::{CaptionPosition, CaptionStyle};
use caption_pipeline::models::transcript::Segment;

pub const FRAME_WIDTH: u32 = 1280;
pub const FRAME_HEIGHT: u32 = 720;
pub const CLIP_MS: u64 = 10_000;

pub fn remote_source(url: &str) -> Source {
    Source::RemoteUrl {
        url: url.to_string(),
    }
}

pub fn bottom_style(font_size: u32) -> CaptionStyle {
    CaptionStyle {
        position: CaptionPosition::Bottom,
        font_size,
        ..CaptionStyle::default()
    }
}

/// Ten seconds of a deterministic mono tone at 16 kHz.
pub fn clip_audio() -> PcmAudio {
    let rate = 16_000u32;
    let frames = (CLIP_MS * rate as u64 / 1000) as usize;
    let samples = (0..frames)
        .map(|i| (((i % 64) as i32 - 32) * 512) as i16)
        .collect();
    PcmAudio::new(samples, rate, 1)
}

pub fn clip_metadata() -> MediaMetadata {
    MediaMetadata {
        duration_ms: CLIP_MS,
        width: FRAME_WIDTH,
        height: FRAME_HEIGHT,
        fps: 30.0,
        format: "mp4".to_string(),
    }
}

pub fn hello_world() -> Vec<Segment> {
    vec![
        Segment::from_secs(0.0, 2.0, "hello"),
        Segment::from_secs(2.5, 4.0, "world"),
    ]
}
