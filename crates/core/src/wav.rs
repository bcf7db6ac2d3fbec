//! Minimal PCM16 WAV framing.
//!
//! The gateway only ever writes the trivial 44-byte RIFF/WAVE/fmt/data
//! layout the backend expects, so the encoder is hand-rolled; reading back
//! goes through `hound` for the sanity checks around synthesized audio.

use std::io::Cursor;

use crate::{audio, CoreError};

/// Size of the canonical PCM header this module emits.
pub const HEADER_LEN: usize = 44;

/// Encode float32 samples (clamped to `[-1, 1]`) as a mono PCM16 WAV blob.
pub fn encode_pcm16(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let pcm = audio::f32_to_pcm16(samples);
    let data_len = (pcm.len() * 2) as u32;
    let byte_rate = sample_rate * 2;

    let mut out = Vec::with_capacity(HEADER_LEN + pcm.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for sample in pcm {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Decode a WAV blob into float32 samples, averaging stereo down to mono.
pub fn decode_to_f32(bytes: &[u8]) -> Result<Vec<f32>, CoreError> {
    let reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| CoreError::Wav(e.to_string()))?;
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| CoreError::Wav(e.to_string()))?,
        hound::SampleFormat::Int => {
            let max_val = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max_val))
                .collect::<Result<_, _>>()
                .map_err(|e| CoreError::Wav(e.to_string()))?
        }
    };
    if spec.channels == 2 {
        Ok(samples
            .chunks(2)
            .map(|pair| (pair[0] + pair.get(1).copied().unwrap_or(0.0)) / 2.0)
            .collect())
    } else {
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_44_bytes() {
        let blob = encode_pcm16(&[], 16_000);
        assert_eq!(blob.len(), HEADER_LEN);
        assert_eq!(&blob[0..4], b"RIFF");
        assert_eq!(&blob[8..12], b"WAVE");
        assert_eq!(&blob[36..40], b"data");
    }

    #[test]
    fn sample_count_survives_round_trip() {
        let samples: Vec<f32> = (0..160).map(|i| (i as f32 / 160.0).sin() * 0.25).collect();
        let blob = encode_pcm16(&samples, 16_000);
        assert_eq!(blob.len(), HEADER_LEN + samples.len() * 2);
        let decoded = decode_to_f32(&blob).unwrap();
        assert_eq!(decoded.len(), samples.len());
    }

    #[test]
    fn out_of_range_samples_are_clamped() {
        let blob = encode_pcm16(&[4.0, -4.0], 16_000);
        let decoded = decode_to_f32(&blob).unwrap();
        assert!(decoded[0] > 0.99 && decoded[0] <= 1.0);
        assert!(decoded[1] < -0.99 && decoded[1] >= -1.0);
    }
}
