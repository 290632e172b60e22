//! # Amplification
//!
//! Applies a gain multiplier to a frame of 16-bit samples. Each sample is scaled
//! as a float, rounded to nearest and clamped to the 16-bit range, so the
//! output can never wrap around regardless of gain.
//!
//! The output buffer is supplied by the caller and reused across frames; the
//! per-sample loop does not allocate.

use crate::error::{AppResult, CaptureError};
use byteorder::{ByteOrder, LittleEndian};

/// Gains this close to unity leave the frame untouched.
pub const UNITY_GAIN_EPSILON: f32 = 0.01;

#[derive(Debug, Clone, Copy, Default)]
pub struct AmplificationProcessor;

impl AmplificationProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Whether `gain` takes the pass-through path.
    pub fn is_unity(gain: f32) -> bool {
        (gain - 1.0).abs() < UNITY_GAIN_EPSILON
    }

    /// Amplify `input` into `output`.
    ///
    /// ## Parameters:
    /// - **input**: samples of the current frame
    /// - **output**: destination, must be exactly as long as `input`
    /// - **gain**: finite, non-negative multiplier
    ///
    /// ## Returns:
    /// A processing error for a non-finite or negative gain, or a length
    /// mismatch. `output` is not written in that case.
    pub fn apply(&self, input: &[i16], output: &mut [i16], gain: f32) -> AppResult<()> {
        Self::check_gain(gain)?;

        if input.len() != output.len() {
            return Err(CaptureError::Processing(format!(
                "output buffer holds {} samples, frame has {}",
                output.len(),
                input.len()
            )));
        }

        if Self::is_unity(gain) {
            output.copy_from_slice(input);
            return Ok(());
        }

        for (out, &sample) in output.iter_mut().zip(input) {
            *out = Self::scale(sample, gain);
        }

        Ok(())
    }

    /// Amplify a frame in place.
    pub fn apply_in_place(&self, samples: &mut [i16], gain: f32) -> AppResult<()> {
        Self::check_gain(gain)?;

        if Self::is_unity(gain) {
            return Ok(());
        }

        for sample in samples.iter_mut() {
            *sample = Self::scale(*sample, gain);
        }

        Ok(())
    }

    /// Byte-level variant over little-endian PCM.
    ///
    /// `output` is resized to the input length; its allocation is reused when
    /// large enough. With unity gain the bytes are copied verbatim.
    pub fn apply_bytes(&self, input: &[u8], output: &mut Vec<u8>, gain: f32) -> AppResult<()> {
        Self::check_gain(gain)?;

        if input.len() % 2 != 0 {
            return Err(CaptureError::Validation(format!(
                "Audio data length must be even for 16-bit samples, got {} bytes",
                input.len()
            )));
        }

        output.clear();
        output.extend_from_slice(input);

        if Self::is_unity(gain) {
            return Ok(());
        }

        for pair in output.chunks_exact_mut(2) {
            let sample = LittleEndian::read_i16(pair);
            LittleEndian::write_i16(pair, Self::scale(sample, gain));
        }

        Ok(())
    }

    fn check_gain(gain: f32) -> AppResult<()> {
        if !gain.is_finite() || gain < 0.0 {
            return Err(CaptureError::Processing(format!(
                "gain must be a finite non-negative number, got {}",
                gain
            )));
        }
        Ok(())
    }

    #[inline]
    fn scale(sample: i16, gain: f32) -> i16 {
        let scaled = (sample as f32 * gain).round();
        scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sweep() -> Vec<i16> {
        (i16::MIN..=i16::MAX).step_by(97).chain([i16::MIN, -1, 0, 1, i16::MAX]).collect()
    }

    #[test]
    fn test_unity_gain_is_identity() {
        let amp = AmplificationProcessor::new();
        let input = sweep();
        for gain in [1.0, 1.009, 0.991] {
            let mut output = vec![0; input.len()];
            amp.apply(&input, &mut output, gain).unwrap();
            assert_eq!(output, input);
        }

        let bytes: Vec<u8> = input.iter().flat_map(|s| s.to_le_bytes()).collect();
        let mut out_bytes = Vec::new();
        amp.apply_bytes(&bytes, &mut out_bytes, 1.0).unwrap();
        assert_eq!(out_bytes, bytes);
    }

    #[test]
    fn test_output_stays_in_range_for_all_gains() {
        let amp = AmplificationProcessor::new();
        let input = sweep();
        let mut output = vec![0; input.len()];
        let mut gain = 0.1f32;
        while gain <= 10.0 {
            amp.apply(&input, &mut output, gain).unwrap();
            // Extremes must saturate, not wrap.
            let last = output.len() - 1;
            if gain > 1.0 {
                assert_eq!(output[last], i16::MAX);
                assert_eq!(output[last - 4], i16::MIN);
            }
            for (i, &o) in output.iter().enumerate() {
                let expected = (input[i] as f32 * gain).round();
                if expected > 0.0 {
                    assert!(o >= 0, "sign flipped at gain {}", gain);
                } else if expected < 0.0 {
                    assert!(o <= 0, "sign flipped at gain {}", gain);
                }
            }
            gain += 0.1;
        }
    }

    #[test]
    fn test_rounding_to_nearest() {
        let amp = AmplificationProcessor::new();
        let mut output = [0i16; 4];
        amp.apply(&[3, -3, 5, 1000], &mut output, 1.5).unwrap();
        assert_eq!(output, [5, -5, 8, 1500]);
    }

    #[test]
    fn test_bytes_variant_matches_samples() {
        let amp = AmplificationProcessor::new();
        let input: Vec<i16> = vec![100, -200, 16000, -16000, 30000];
        let bytes: Vec<u8> = input.iter().flat_map(|s| s.to_le_bytes()).collect();

        let mut sample_out = vec![0; input.len()];
        amp.apply(&input, &mut sample_out, 2.5).unwrap();

        let mut byte_out = Vec::new();
        amp.apply_bytes(&bytes, &mut byte_out, 2.5).unwrap();
        let expected: Vec<u8> = sample_out.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(byte_out, expected);
    }

    #[test]
    fn test_in_place() {
        let amp = AmplificationProcessor::new();
        let mut samples = [1000i16, -1000, 20000];
        amp.apply_in_place(&mut samples, 2.0).unwrap();
        assert_eq!(samples, [2000, -2000, i16::MAX]);
    }

    #[test]
    fn test_invalid_gain_and_length() {
        let amp = AmplificationProcessor::new();
        let mut output = [0i16; 2];
        for gain in [f32::NAN, f32::INFINITY, -1.0] {
            let err = amp.apply(&[1, 2], &mut output, gain).unwrap_err();
            assert_eq!(err.kind(), "processing_error");
        }
        assert!(amp.apply(&[1, 2, 3], &mut output, 2.0).is_err());
        assert!(amp.apply_bytes(&[0u8; 3], &mut Vec::new(), 2.0).is_err());
    }
}
