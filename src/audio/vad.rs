//! # Voice Activity Detection
//!
//! A four-gate detector over the per-frame measurements in
//! [`analysis`](super::analysis). A frame is speech only when every gate passes:
//!
//! 1. `level >= min_level` (silence floor)
//! 2. `level <= max_level` (clipping / noise ceiling)
//! 3. `std_dev > min_std_dev` (rules out constant and electrical noise; raw sample units)
//! 4. `min_zcr <= zcr <= max_zcr` (speech-typical spectral turnover band)
//!
//! The gates trade recall for precision: steady hums and clipped transients are
//! suppressed at the cost of occasionally dropping very quiet or very sibilant
//! speech.

use super::analysis::SignalStats;
use crate::error::{AppResult, CaptureError};
use serde::{Deserialize, Serialize};

/// Detector thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Silence floor on the normalised level
    pub min_level: f32,
    /// Ceiling above which loud frames are treated as clipping
    pub max_level: f32,
    /// Minimum standard deviation in sample units (not normalised)
    pub min_std_dev: f64,
    /// Lower edge of the accepted zero-crossing band
    pub min_zcr: f32,
    /// Upper edge of the accepted zero-crossing band
    pub max_zcr: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            min_level: 0.02,
            max_level: 0.95,
            min_std_dev: 100.0,
            min_zcr: 0.01,
            max_zcr: 0.30,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> AppResult<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);

        if !in_unit(self.min_level) || !in_unit(self.max_level) || self.min_level > self.max_level {
            return Err(CaptureError::Config(format!(
                "VAD level band must satisfy 0 <= min_level <= max_level <= 1, got {}..{}",
                self.min_level, self.max_level
            )));
        }

        if !self.min_std_dev.is_finite() || self.min_std_dev < 0.0 {
            return Err(CaptureError::Config(format!(
                "VAD min_std_dev must be a non-negative number, got {}",
                self.min_std_dev
            )));
        }

        if !in_unit(self.min_zcr) || !in_unit(self.max_zcr) || self.min_zcr > self.max_zcr {
            return Err(CaptureError::Config(format!(
                "VAD zero-crossing band must satisfy 0 <= min_zcr <= max_zcr <= 1, got {}..{}",
                self.min_zcr, self.max_zcr
            )));
        }

        Ok(())
    }
}

/// The first gate a frame failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VadRejection {
    TooQuiet,
    Clipping,
    NoVariation,
    ZcrOutOfBand,
}

impl VadRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            VadRejection::TooQuiet => "too_quiet",
            VadRejection::Clipping => "clipping",
            VadRejection::NoVariation => "no_variation",
            VadRejection::ZcrOutOfBand => "zcr_out_of_band",
        }
    }
}

/// Outcome for one frame, with the values it was computed from.
///
/// Recomputed for every frame and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VadDecision {
    pub is_speech: bool,
    pub level: f32,
    pub std_dev: Option<f64>,
    pub zero_crossing_rate: f32,
    pub rejection: Option<VadRejection>,
}

#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    config: VadConfig,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Boolean speech decision.
    pub fn classify(&self, level: f32, std_dev: Option<f64>, zcr: f32) -> bool {
        self.rejection(level, std_dev, zcr).is_none()
    }

    /// Decision plus diagnostics, for logging and the event channel.
    pub fn evaluate(&self, level: f32, std_dev: Option<f64>, zcr: f32) -> VadDecision {
        let rejection = self.rejection(level, std_dev, zcr);
        VadDecision {
            is_speech: rejection.is_none(),
            level,
            std_dev,
            zero_crossing_rate: zcr,
            rejection,
        }
    }

    /// Measure and classify a frame in one call.
    pub fn evaluate_samples(&self, samples: &[i16]) -> VadDecision {
        let stats = SignalStats::measure(samples);
        self.evaluate(stats.level, stats.std_dev, stats.zero_crossing_rate)
    }

    fn rejection(&self, level: f32, std_dev: Option<f64>, zcr: f32) -> Option<VadRejection> {
        let cfg = &self.config;

        // NaN fails every comparison, so it falls through to a rejection.
        if !(level >= cfg.min_level) {
            return Some(VadRejection::TooQuiet);
        }
        if !(level <= cfg.max_level) {
            return Some(VadRejection::Clipping);
        }
        match std_dev {
            Some(sd) if sd > cfg.min_std_dev => {}
            _ => return Some(VadRejection::NoVariation),
        }
        if !(zcr >= cfg.min_zcr && zcr <= cfg.max_zcr) {
            return Some(VadRejection::ZcrOutOfBand);
        }
        None
    }
}

impl Default for VoiceActivityDetector {
    fn default() -> Self {
        Self::new(VadConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::super::analysis::compute_level;
    use super::super::analysis::test_signals::{alternating, sine_at_level, square};
    use super::*;

    fn detector() -> VoiceActivityDetector {
        VoiceActivityDetector::default()
    }

    #[test]
    fn test_level_gates_reject_outside_band() {
        let vad = detector();
        for level in [0.0, 0.005, 0.0199, 0.951, 0.98, 1.0] {
            assert!(!vad.classify(level, Some(5000.0), 0.05), "level {} accepted", level);
        }
        assert!(vad.classify(0.02, Some(5000.0), 0.05));
        assert!(vad.classify(0.95, Some(5000.0), 0.05));
    }

    #[test]
    fn test_variation_gate() {
        let vad = detector();
        assert!(!vad.classify(0.3, None, 0.05));
        assert!(!vad.classify(0.3, Some(100.0), 0.05));
        assert!(vad.classify(0.3, Some(100.5), 0.05));
    }

    #[test]
    fn test_zcr_band() {
        let vad = detector();
        assert!(!vad.classify(0.3, Some(5000.0), 0.009));
        assert!(vad.classify(0.3, Some(5000.0), 0.01));
        assert!(vad.classify(0.3, Some(5000.0), 0.30));
        assert!(!vad.classify(0.3, Some(5000.0), 0.31));
    }

    #[test]
    fn test_constant_buffer_is_never_speech() {
        let vad = detector();
        for value in [0i16, 800, 6000, -12000, 30000] {
            let decision = vad.evaluate_samples(&vec![value; 2400]);
            assert!(!decision.is_speech, "constant {} accepted", value);
        }
        let decision = vad.evaluate_samples(&vec![6000; 2400]);
        assert_eq!(decision.rejection, Some(VadRejection::NoVariation));
    }

    #[test]
    fn test_sine_frame_is_speech() {
        let decision = detector().evaluate_samples(&sine_at_level(0.3, 600.0, 24_000, 2400));
        assert!(decision.is_speech);
        assert!(decision.std_dev.unwrap() > 100.0);
        assert_eq!(decision.rejection, None);
    }

    #[test]
    fn test_near_full_scale_is_clipping() {
        // 600 Hz at 24 kHz; a sine this loud would saturate and read lower
        let frame = square(32_113, 20, 2400);
        assert!(compute_level(&frame) > 0.95);

        let decision = detector().evaluate_samples(&frame);
        assert!(!decision.is_speech);
        assert_eq!(decision.rejection, Some(VadRejection::Clipping));
    }

    #[test]
    fn test_hiss_rejected_by_zcr() {
        let decision = detector().evaluate_samples(&alternating(4000, 2400));
        assert_eq!(decision.rejection, Some(VadRejection::ZcrOutOfBand));
    }

    #[test]
    fn test_nan_level_rejected() {
        assert!(!detector().classify(f32::NAN, Some(5000.0), 0.05));
    }

    #[test]
    fn test_config_validation() {
        assert!(VadConfig::default().validate().is_ok());
        let inverted = VadConfig { min_level: 0.5, max_level: 0.1, ..VadConfig::default() };
        assert!(inverted.validate().is_err());
        let bad_zcr = VadConfig { max_zcr: 1.5, ..VadConfig::default() };
        assert!(bad_zcr.validate().is_err());
    }
}
