//! PCM sample conversion.
//!
//! Wire format is mono PCM16 little-endian; the detector and transcription
//! path work on float32 in `[-1, 1]`.

/// Convert signed 16-bit samples to float32 in `[-1, 1]`.
pub fn pcm16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| f32::from(s) / 32768.0).collect()
}

/// Convert float32 samples to signed 16-bit, clamping to `[-1, 1]`.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Interpret little-endian bytes as PCM16 samples. A trailing odd byte is
/// ignored.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Root-mean-square energy of a float32 frame.
pub fn frame_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|&s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm16_round_trip_preserves_scale() {
        let samples = vec![0i16, 16384, -16384, 32767, -32768];
        let floats = pcm16_to_f32(&samples);
        assert!((floats[0]).abs() < f32::EPSILON);
        assert!((floats[1] - 0.5).abs() < 1e-3);
        assert!((floats[4] + 1.0).abs() < 1e-3);
    }

    #[test]
    fn f32_conversion_clamps() {
        let out = f32_to_pcm16(&[2.0, -2.0, 0.0]);
        assert_eq!(out, vec![32767, -32767, 0]);
    }

    #[test]
    fn odd_byte_is_ignored() {
        let out = bytes_to_pcm16(&[0x01, 0x00, 0xFF]);
        assert_eq!(out, vec![1]);
    }

    #[test]
    fn energy_of_silence_is_zero() {
        assert_eq!(frame_energy(&[]), 0.0);
        assert_eq!(frame_energy(&[0.0; 512]), 0.0);
        assert!(frame_energy(&[0.5; 512]) > 0.4);
    }
}
