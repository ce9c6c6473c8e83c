//! PCM normalization, content fingerprints and WAV encoding.
//!
//! The fingerprint is computed over normalized samples rather than container
//! bytes, so the same speech re-encoded into another format still maps to the
//! same transcript.

use sha2::{Digest, Sha256};
use std::io::Cursor;

use crate::models::media::PcmAudio;

/// Sample rate every clip is normalized to before fingerprinting.
pub const NORMALIZED_SAMPLE_RATE: u32 = 16_000;

/// Downmix to mono and resample to [`NORMALIZED_SAMPLE_RATE`].
pub fn normalize(audio: &PcmAudio) -> PcmAudio {
    let mono = downmix(&audio.samples, audio.channels);
    let samples = resample(&mono, audio.sample_rate, NORMALIZED_SAMPLE_RATE);
    PcmAudio::new(samples, NORMALIZED_SAMPLE_RATE, 1)
}

fn downmix(samples: &[i16], channels: u16) -> Vec<i16> {
    match channels {
        0 | 1 => samples.to_vec(),
        n => samples
            .chunks_exact(n as usize)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / n as i32) as i16
            })
            .collect(),
    }
}

/// Linear interpolation resampling.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = source_pos - source_idx as f64;

            if source_idx + 1 >= samples.len() {
                samples[source_idx]
            } else {
                let left = samples[source_idx] as f64;
                let right = samples[source_idx + 1] as f64;
                (left + (right - left) * fraction).round() as i16
            }
        })
        .collect()
}

/// Lowercase hex SHA-256 over normalized little-endian samples.
pub fn fingerprint(normalized: &PcmAudio) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.sample_rate.to_le_bytes());
    hasher.update(normalized.channels.to_le_bytes());
    for sample in &normalized.samples {
        hasher.update(sample.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Encode as a 16-bit PCM WAV file in memory.
pub fn encode_wav(audio: &PcmAudio) -> Result<Vec<u8>, hound::Error> {
    let mut cursor = Cursor::new(Vec::new());
    let spec = hound::WavSpec {
        channels: audio.channels.max(1),
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
    for &sample in &audio.samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(cursor.into_inner())
}

pub fn decode_wav(bytes: &[u8]) -> Result<PcmAudio, hound::Error> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))?;
    let spec = reader.spec();
    let samples = reader
        .samples::<i16>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(PcmAudio::new(samples, spec.sample_rate, spec.channels))
}
