//! # Configuration Management
//!
//! Loads the agent's settings from layered sources:
//! - Default values (built into the code)
//! - A TOML file (`config.toml` in the working directory, or an explicit path)
//! - Environment variables with the `APP_` prefix
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP_AUDIO__DEVICE`, `APP_AGC__TARGET_LEVEL`, ...).
//!    Sections and keys are separated by a double underscore so that keys
//!    containing `_` stay intact.
//! 2. Configuration file
//! 3. Default values (the `Default` impls)
//!
//! ## Sections:
//! - **audio**: capture format, frame interval, device selection
//! - **vad**: voice activity thresholds
//! - **agc**: gain control tuning and fixed amplification
//! - **transport**: service URL and queue sizes
//! - **session**: confidence threshold and refresh behaviour

use crate::audio::agc::AgcConfig;
use crate::audio::vad::VadConfig;
use crate::audio::{BIT_DEPTH, CHANNELS, FRAME_INTERVAL_MS, SAMPLE_RATE};
use crate::error::{AppResult, CaptureError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration, one field per section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub agc: AgcConfig,
    pub transport: TransportConfig,
    pub session: SessionConfig,
}

/// Capture format and device settings.
///
/// ## Fields:
/// - `sample_rate`, `bit_depth`, `channels`: fixed at 24000 / 16 / 1; kept
///   configurable so a mismatch is reported instead of silently ignored
/// - `frame_interval_ms`: delivery interval, 100 ms gives 2400-sample frames
/// - `capture_queue_frames`: frames buffered between the driver callback and
///   the capture thread before new frames are dropped
/// - `device`: `"default"`, an index from `devices`, or a device name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub frame_interval_ms: u32,
    pub capture_queue_frames: usize,
    pub device: String,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            bit_depth: BIT_DEPTH,
            channels: CHANNELS,
            frame_interval_ms: FRAME_INTERVAL_MS,
            capture_queue_frames: 8,
            device: "default".to_string(),
        }
    }
}

/// Connection to the transcription service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// `ws://` or `wss://` endpoint
    pub url: String,
    /// Speech frames waiting to be sent before new ones are dropped
    pub transmit_queue_frames: usize,
    /// Capacity of the pipeline event channel
    pub event_queue_capacity: usize,
    /// Capacity of the inbound event channel
    pub inbound_queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765".to_string(),
            transmit_queue_frames: 32,
            event_queue_capacity: 256,
            inbound_queue_capacity: 64,
        }
    }
}

/// Session reporting and device refresh behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Transcriptions below this confidence are logged as low confidence
    pub confidence_threshold: f64,
    /// Keep the AGC history across a device refresh
    pub preserve_gain_on_refresh: bool,
    /// Seconds between status log lines in `run`
    pub status_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            preserve_gain_on_refresh: false,
            status_interval_secs: 10,
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, a file and the environment.
    ///
    /// ## Parameters:
    /// - **path**: explicit config file; must exist when given. Without it an
    ///   optional `config.toml` in the working directory is used.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_TRANSPORT__URL=wss://stt.example.com/ws`
    /// - `APP_AGC__ENABLED=false`
    /// - `APP_AUDIO__DEVICE=2`
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("config").required(false)),
        };

        let config: AppConfig = builder
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is usable.
    ///
    /// ## What this checks:
    /// - capture format is 24000 Hz, 16-bit, mono and the interval is non-zero
    /// - VAD bands are ordered and inside their ranges
    /// - AGC target, gain range and fixed amplification are consistent
    /// - queue capacities are non-zero and the URL is a WebSocket URL
    pub fn validate(&self) -> AppResult<()> {
        let audio = &self.audio;
        if audio.sample_rate != SAMPLE_RATE
            || audio.bit_depth != BIT_DEPTH
            || audio.channels != CHANNELS
        {
            return Err(CaptureError::Config(format!(
                "audio format must be {} Hz / {}-bit / {} channel, got {} Hz / {}-bit / {} channel(s)",
                SAMPLE_RATE,
                BIT_DEPTH,
                CHANNELS,
                audio.sample_rate,
                audio.bit_depth,
                audio.channels
            )));
        }

        if audio.frame_interval_ms == 0 {
            return Err(CaptureError::Config(
                "frame_interval_ms must be greater than 0".to_string(),
            ));
        }

        if audio.capture_queue_frames == 0 {
            return Err(CaptureError::Config(
                "capture_queue_frames must be greater than 0".to_string(),
            ));
        }

        self.vad.validate()?;
        self.agc.validate()?;

        let transport = &self.transport;
        if !(transport.url.starts_with("ws://") || transport.url.starts_with("wss://")) {
            return Err(CaptureError::Config(format!(
                "transport url must start with ws:// or wss://, got '{}'",
                transport.url
            )));
        }

        if transport.transmit_queue_frames == 0
            || transport.event_queue_capacity == 0
            || transport.inbound_queue_capacity == 0
        {
            return Err(CaptureError::Config("queue capacities must be greater than 0".to_string()));
        }

        if !(0.0..=1.0).contains(&self.session.confidence_threshold) {
            return Err(CaptureError::Config(format!(
                "confidence_threshold must be in [0, 1], got {}",
                self.session.confidence_threshold
            )));
        }

        Ok(())
    }

    /// Apply a partial JSON override, e.g. `{"agc": {"enabled": false}}`.
    ///
    /// Only the keys present are changed. The result is validated and the
    /// configuration is left untouched if the override is malformed or invalid.
    pub fn update_from_json(&mut self, json_str: &str) -> AppResult<()> {
        let patch: serde_json::Value = serde_json::from_str(json_str)?;
        if !patch.is_object() {
            return Err(CaptureError::Validation(
                "configuration override must be a JSON object".to_string(),
            ));
        }

        let mut current = serde_json::to_value(&*self)?;
        merge_json(&mut current, patch);

        let updated: AppConfig = serde_json::from_value(current)?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CaptureError::Config(format!("failed to render configuration: {}", e)))
    }
}

/// Recursively overlay `patch` onto `base`. Objects merge, everything else replaces.
fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.audio.frame_interval_ms, 100);
        assert_eq!(config.agc.fixed_amplification, 2.0);
        assert_eq!(config.session.confidence_threshold, 0.7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 16_000;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.transport.url = "http://localhost".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.vad.min_level = 0.99;
        assert_eq!(config.validate().unwrap_err().kind(), "config_error");
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"agc": {"enabled": false, "fixed_amplification": 3.0}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert!(!config.agc.enabled);
        assert_eq!(config.agc.fixed_amplification, 3.0);
        // untouched keys keep their values
        assert_eq!(config.agc.target_level, 0.5);
        assert_eq!(config.transport.url, "ws://127.0.0.1:8765");
    }

    #[test]
    fn test_invalid_update_leaves_config_unchanged() {
        let mut config = AppConfig::default();
        let before = config.clone();
        assert!(config.update_from_json(r#"{"agc": {"fixed_amplification": 50.0}}"#).is_err());
        assert!(config.update_from_json("[1, 2]").is_err());
        assert!(config.update_from_json("{nope").is_err());
        assert_eq!(config, before);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[audio]
device = "USB Microphone"

[vad]
min_level = 0.05

[transport]
url = "wss://stt.example.com/ws"
"#
        )
        .unwrap();

        let config = AppConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.audio.device, "USB Microphone");
        assert_eq!(config.vad.min_level, 0.05);
        assert_eq!(config.vad.max_level, 0.95);
        assert_eq!(config.transport.url, "wss://stt.example.com/ws");
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[agc]\ntarget_level = 2.0").unwrap();
        assert!(AppConfig::load(Some(file.path())).is_err());
        assert!(AppConfig::load(Some(Path::new("/nonexistent/agent.toml"))).is_err());
    }

    #[test]
    fn test_toml_rendering() {
        let rendered = AppConfig::default().to_toml().unwrap();
        assert!(rendered.contains("[agc]"));
        assert!(rendered.contains("confidence_threshold = 0.7"));
    }
}
