//! # Audio Frame Decoding
//!
//! Converts the binary audio frame of a transcription job into the 16 kHz
//! mono f32 samples the engine consumes.
//!
//! ## Accepted Encodings:
//! - **RIFF/WAV**: 16-bit PCM or 32-bit float, mono or multi-channel
//!   (multi-channel input is downmixed by averaging)
//! - **Raw PCM**: little-endian 32-bit float samples, assumed mono 16 kHz

use anyhow::{anyhow, bail, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Sample rate the engine expects.
pub const SAMPLE_RATE: u32 = 16_000;

/// Decode one binary frame into mono f32 samples.
pub fn decode_frame(data: &[u8]) -> Result<Vec<f32>> {
    if data.is_empty() {
        bail!("Audio data is empty");
    }
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_raw_f32(data)
    }
}

fn decode_wav(data: &[u8]) -> Result<Vec<f32>> {
    let mut cursor = Cursor::new(data);
    let (header, samples) = wav::read(&mut cursor).map_err(|e| anyhow!("Invalid WAV data: {}", e))?;

    if header.sampling_rate != SAMPLE_RATE {
        bail!(
            "Sample rate mismatch: expected {}, got {}",
            SAMPLE_RATE,
            header.sampling_rate
        );
    }

    let samples: Vec<f32> = match samples {
        wav::BitDepth::Sixteen(samples) => samples
            .into_iter()
            .map(|s| s as f32 / i16::MAX as f32)
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(samples) => samples,
        other => bail!("Unsupported WAV bit depth: {:?}", other),
    };

    Ok(downmix(samples, header.channel_count as usize))
}

fn decode_raw_f32(data: &[u8]) -> Result<Vec<f32>> {
    if data.len() % 4 != 0 {
        bail!("Raw audio length must be a multiple of 4 bytes for f32 samples");
    }

    let mut cursor = Cursor::new(data);
    let mut samples = Vec::with_capacity(data.len() / 4);
    while let Ok(sample) = cursor.read_f32::<LittleEndian>() {
        samples.push(sample);
    }
    Ok(samples)
}

/// Average interleaved channels down to mono.
fn downmix(samples: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples;
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
