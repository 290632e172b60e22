//! # Signal Analysis
//!
//! Pure per-frame measurements used by the gain controller and the voice
//! activity detector. Every function is O(n) over the frame, allocation-free,
//! and safe to call on the capture thread.
//!
//! ## Measurements:
//! - **Level**: mean absolute sample value normalised by 32768, clamped to 1.0
//! - **Variation**: sample standard deviation, in raw sample units
//! - **Zero-crossing rate**: sign changes between neighbours per sample

/// Full-scale magnitude of a 16-bit sample.
pub const FULL_SCALE: f32 = 32768.0;

/// Normalised loudness of a frame in `[0.0, 1.0]`.
///
/// An empty frame has level 0.0.
pub fn compute_level(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    // i64 accumulator: 2400 samples * 32768 cannot overflow, and neither can
    // much longer frames.
    let sum: i64 = samples.iter().map(|&s| (s as i64).abs()).sum();
    let mean_abs = sum as f64 / samples.len() as f64;
    ((mean_abs / FULL_SCALE as f64) as f32).min(1.0)
}

/// Standard deviation of the samples.
///
/// Returns `None` ("no variation") for frames shorter than two samples, which
/// the detector treats as not speech. Uses the unbiased (n - 1) estimator.
pub fn compute_variation(samples: &[i16]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }

    let n = samples.len() as f64;
    let mean = samples.iter().map(|&s| s as f64).sum::<f64>() / n;
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let d = s as f64 - mean;
            d * d
        })
        .sum();

    Some((sum_sq / (n - 1.0)).sqrt())
}

/// Fraction of samples at which the sign flips relative to the previous one.
///
/// Zero counts as non-negative, so a run of `0, 5, 0` has no crossings.
pub fn compute_zero_crossing_rate(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] >= 0) != (pair[1] >= 0))
        .count();

    crossings as f32 / samples.len() as f32
}

/// All three measurements for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalStats {
    pub level: f32,
    pub std_dev: Option<f64>,
    pub zero_crossing_rate: f32,
}

impl SignalStats {
    pub fn measure(samples: &[i16]) -> Self {
        Self {
            level: compute_level(samples),
            std_dev: compute_variation(samples),
            zero_crossing_rate: compute_zero_crossing_rate(samples),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_signals::*;
    use super::*;

    #[test]
    fn test_level_of_silence_and_full_scale() {
        assert_eq!(compute_level(&[]), 0.0);
        assert_eq!(compute_level(&[0; 2400]), 0.0);
        assert_eq!(compute_level(&[i16::MIN; 16]), 1.0);
        let near_full = compute_level(&[i16::MAX; 16]);
        assert!(near_full > 0.9999 && near_full <= 1.0);
    }

    #[test]
    fn test_level_uses_mean_absolute_value() {
        let samples = [16384, -16384, 16384, -16384];
        assert!((compute_level(&samples) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sine_level_matches_target() {
        let samples = sine_at_level(0.3, 600.0, 24_000, 2400);
        assert!((compute_level(&samples) - 0.3).abs() < 0.01);
    }

    #[test]
    fn test_variation_requires_two_samples() {
        assert_eq!(compute_variation(&[]), None);
        assert_eq!(compute_variation(&[1234]), None);
        assert_eq!(compute_variation(&[500; 100]), Some(0.0));
    }

    #[test]
    fn test_variation_of_known_series() {
        // mean 0, squared deviations sum to 4 * 100^2, n - 1 = 3
        let std = compute_variation(&[100, -100, 100, -100]).unwrap();
        assert!((std - (40_000.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_zero_crossing_rate() {
        assert_eq!(compute_zero_crossing_rate(&[]), 0.0);
        assert_eq!(compute_zero_crossing_rate(&[0, 5, 0, 7]), 0.0);
        assert_eq!(compute_zero_crossing_rate(&[1, -1, 1, -1]), 0.75);

        // 600 Hz at 24 kHz: two crossings every 40 samples
        let samples = sine_at_level(0.3, 600.0, 24_000, 2400);
        let zcr = compute_zero_crossing_rate(&samples);
        assert!((zcr - 0.05).abs() < 0.002, "zcr was {}", zcr);
    }

    #[test]
    fn test_zcr_stays_in_unit_range() {
        let zcr = compute_zero_crossing_rate(&alternating(1000, 2400));
        assert!(zcr > 0.99 && zcr <= 1.0);
    }
}
