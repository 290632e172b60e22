//! # Automatic Gain Control
//!
//! Adapts a gain multiplier so the average post-amplification level drifts
//! toward a target. Reacts to slow loudness changes (distance from the mic,
//! ambient noise) without audible pumping:
//!
//! - a warm-up period of `warmup_frames` levels before any adjustment
//! - a dead band of `tolerance` around the target
//! - each adjustment is an exponential blend (`smoothing` of the old gain,
//!   `1 - smoothing` of the proposal), so one update moves the gain by at most a
//!   bounded step
//!
//! With AGC disabled the gain is pinned to `fixed_amplification` and the level
//! history is never consulted.

use super::buffer::LevelHistory;
use crate::error::{AppResult, CaptureError};
use serde::{Deserialize, Serialize};

/// Number of recent levels the controller averages over.
pub const GAIN_HISTORY_CAPACITY: usize = 50;

pub type GainHistory = LevelHistory<GAIN_HISTORY_CAPACITY>;

/// AGC tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgcConfig {
    pub enabled: bool,
    /// Target average level, 0..1
    pub target_level: f32,
    /// Gain used when AGC is disabled, and the starting gain when enabled
    pub fixed_amplification: f32,
    /// Dead band: no adjustment while |target - average| <= tolerance
    pub tolerance: f32,
    /// Scales how hard one adjustment pushes (`factor = 1 + diff * rate`)
    pub adjustment_rate: f32,
    /// Weight of the previous gain in the blend
    pub smoothing: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// Levels required before the first adjustment
    pub warmup_frames: usize,
    /// Informational only. Amplification always clamps at the 16-bit boundary.
    pub clipping_prevention: bool,
}

impl Default for AgcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_level: 0.5,
            fixed_amplification: 2.0,
            tolerance: 0.1,
            adjustment_rate: 0.5,
            smoothing: 0.9,
            min_gain: 0.5,
            max_gain: 10.0,
            warmup_frames: 10,
            clipping_prevention: true,
        }
    }
}

impl AgcConfig {
    /// Gain a fresh controller starts from: the fixed amplification, kept in range.
    pub fn initial_gain(&self) -> f32 {
        self.fixed_amplification.clamp(self.min_gain, self.max_gain)
    }

    pub fn validate(&self) -> AppResult<()> {
        if !(self.target_level > 0.0 && self.target_level <= 1.0) {
            return Err(CaptureError::Config(format!(
                "AGC target_level must be in (0, 1], got {}",
                self.target_level
            )));
        }

        if !(self.min_gain > 0.0 && self.min_gain <= self.max_gain && self.max_gain.is_finite()) {
            return Err(CaptureError::Config(format!(
                "AGC gain range must satisfy 0 < min_gain <= max_gain, got {}..{}",
                self.min_gain, self.max_gain
            )));
        }

        let fixed = self.fixed_amplification;
        if !(fixed >= self.min_gain && fixed <= self.max_gain) {
            return Err(CaptureError::Config(format!(
                "fixed_amplification {} is outside the gain range {}..{}",
                self.fixed_amplification, self.min_gain, self.max_gain
            )));
        }

        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(CaptureError::Config(format!(
                "AGC smoothing must be in [0, 1), got {}",
                self.smoothing
            )));
        }

        if !(self.tolerance >= 0.0) || !(self.adjustment_rate > 0.0) {
            return Err(CaptureError::Config(
                "AGC tolerance must be >= 0 and adjustment_rate > 0".to_string(),
            ));
        }

        if self.warmup_frames == 0 || self.warmup_frames > GAIN_HISTORY_CAPACITY {
            return Err(CaptureError::Config(format!(
                "AGC warmup_frames must be in 1..={}, got {}",
                GAIN_HISTORY_CAPACITY, self.warmup_frames
            )));
        }

        Ok(())
    }
}

/// Gain multiplier plus the window of levels it was derived from.
#[derive(Debug, Clone)]
pub struct GainState {
    pub current_gain: f32,
    pub recent_levels: GainHistory,
}

/// Owned by the capture thread; nothing else writes it.
#[derive(Debug, Clone)]
pub struct GainController {
    config: AgcConfig,
    state: GainState,
}

impl GainController {
    pub fn new(config: AgcConfig) -> Self {
        Self {
            state: GainState {
                current_gain: config.initial_gain(),
                recent_levels: GainHistory::new(),
            },
            config,
        }
    }

    pub fn config(&self) -> &AgcConfig {
        &self.config
    }

    pub fn state(&self) -> &GainState {
        &self.state
    }

    /// Gain to apply to the next frame.
    pub fn current_gain(&self) -> f32 {
        self.state.current_gain
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Feed the post-amplification level of the frame just processed.
    ///
    /// ## Returns:
    /// The gain for the next frame, or a processing error if `level` is not a
    /// finite number (the state is left untouched in that case).
    pub fn update(&mut self, level: f32) -> AppResult<f32> {
        if !self.config.enabled {
            self.state.current_gain = self.config.fixed_amplification;
            return Ok(self.state.current_gain);
        }

        if !level.is_finite() {
            return Err(CaptureError::Processing(format!(
                "AGC received a non-finite level: {}",
                level
            )));
        }

        self.state.recent_levels.push(level);

        if self.state.recent_levels.len() < self.config.warmup_frames {
            return Ok(self.state.current_gain);
        }

        let average = match self.state.recent_levels.mean() {
            Some(avg) => avg,
            None => return Ok(self.state.current_gain),
        };
        let diff = self.config.target_level - average;

        if diff.abs() > self.config.tolerance {
            let factor = 1.0 + diff * self.config.adjustment_rate;
            let proposed = (self.state.current_gain * factor)
                .clamp(self.config.min_gain, self.config.max_gain);
            let blended = self.state.current_gain * self.config.smoothing
                + proposed * (1.0 - self.config.smoothing);
            // Both terms are inside the range, the clamp only absorbs rounding.
            self.state.current_gain = blended.clamp(self.config.min_gain, self.config.max_gain);
        }

        Ok(self.state.current_gain)
    }

    /// Forget the history and return to the starting gain.
    pub fn reset(&mut self) {
        self.state.recent_levels.clear();
        self.state.current_gain = self.config.initial_gain();
    }

    /// Distance between the target and the current history average.
    pub fn level_error(&self) -> Option<f32> {
        self.state
            .recent_levels
            .mean()
            .map(|avg| self.config.target_level - avg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_holds_gain() {
        let mut agc = GainController::new(AgcConfig::default());
        for _ in 0..9 {
            assert_eq!(agc.update(0.05).unwrap(), 2.0);
        }
        // 10th level completes warm-up; average 0.05 is far below 0.5
        let gain = agc.update(0.05).unwrap();
        assert!(gain > 2.0);
    }

    #[test]
    fn test_single_adjustment_matches_formula() {
        let mut agc = GainController::new(AgcConfig::default());
        for _ in 0..10 {
            agc.update(0.1).unwrap();
        }
        // diff = 0.4, factor = 1.2, proposed = 2.4, blended = 1.8 + 0.24
        assert!((agc.current_gain() - 2.04).abs() < 1e-5);
    }

    #[test]
    fn test_steady_input_at_target_is_stable() {
        let mut agc = GainController::new(AgcConfig::default());
        let start = agc.current_gain();
        for _ in 0..200 {
            agc.update(0.5).unwrap();
        }
        assert_eq!(agc.current_gain(), start);
        assert!(agc.level_error().unwrap().abs() <= 0.1);
    }

    #[test]
    fn test_dead_band() {
        let mut agc = GainController::new(AgcConfig::default());
        for _ in 0..30 {
            agc.update(0.45).unwrap();
            agc.update(0.58).unwrap();
        }
        assert_eq!(agc.current_gain(), 2.0);
    }

    #[test]
    fn test_gain_stays_in_range() {
        let mut agc = GainController::new(AgcConfig::default());
        for _ in 0..1000 {
            let gain = agc.update(0.0).unwrap();
            assert!((0.5..=10.0).contains(&gain));
        }
        assert!(agc.current_gain() > 9.0);

        for _ in 0..1000 {
            let gain = agc.update(1.0).unwrap();
            assert!((0.5..=10.0).contains(&gain));
        }
        assert!(agc.current_gain() < 0.6);
    }

    #[test]
    fn test_step_is_bounded() {
        let mut agc = GainController::new(AgcConfig::default());
        let mut previous = agc.current_gain();
        for i in 0..500 {
            let level = if (i / 40) % 2 == 0 { 0.0 } else { 1.0 };
            let gain = agc.update(level).unwrap();
            // worst case |factor - 1| = 0.25, blended by 0.1
            assert!((gain - previous).abs() <= previous * 0.025 + 1e-5);
            previous = gain;
        }
    }

    #[test]
    fn test_disabled_pins_fixed_gain() {
        let config = AgcConfig {
            enabled: false,
            ..AgcConfig::default()
        };
        let mut agc = GainController::new(config);
        for level in [0.0, 0.01, 0.9, 1.0, 0.3] {
            assert_eq!(agc.update(level).unwrap(), 2.0);
        }
        assert!(agc.state().recent_levels.is_empty());
    }

    #[test]
    fn test_non_finite_level_is_processing_error() {
        let mut agc = GainController::new(AgcConfig::default());
        let err = agc.update(f32::NAN).unwrap_err();
        assert_eq!(err.kind(), "processing_error");
        assert!(agc.state().recent_levels.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut agc = GainController::new(AgcConfig::default());
        for _ in 0..50 {
            agc.update(0.01).unwrap();
        }
        assert!(agc.current_gain() > 2.0);
        agc.reset();
        assert_eq!(agc.current_gain(), 2.0);
        assert!(agc.state().recent_levels.is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(AgcConfig::default().validate().is_ok());
        let out_of_range = AgcConfig { fixed_amplification: 20.0, ..AgcConfig::default() };
        assert!(out_of_range.validate().is_err());
        let no_target = AgcConfig { target_level: 0.0, ..AgcConfig::default() };
        assert!(no_target.validate().is_err());
    }
}
