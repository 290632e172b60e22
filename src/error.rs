//! # Error Handling
//!
//! Defines the crate-wide error type and how lower-level errors (cpal, config,
//! JSON, WebSocket) are folded into it.
//!
//! ## Error Categories:
//! - **Device**: the input device could not be opened or started. Fatal for the
//!   capture path; the pipeline never starts.
//! - **Stream**: the device failed mid-stream (unplugged, driver fault). Capture
//!   halts but the caller may recover by refreshing the device.
//! - **Processing**: a single frame could not be analysed or amplified. The
//!   pipeline substitutes the raw frame and keeps going.
//! - **Transport**: the outbound channel rejected a frame. Reported, never retried here.
//! - **Config / Validation / Lifecycle**: bad settings, malformed input, or an
//!   operation called in the wrong lifecycle state.

use thiserror::Error;

/// Errors raised by the capture agent.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(CaptureError::Device("no default input device".to_string()));
/// ```
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The input device could not be opened, configured or started
    #[error("Device error: {0}")]
    Device(String),

    /// The device failed after capture had started
    #[error("Stream error: {0}")]
    Stream(String),

    /// A single frame could not be processed
    #[error("Processing error: {0}")]
    Processing(String),

    /// The outbound transport rejected or dropped a message
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration file or environment variable problems
    #[error("Configuration error: {0}")]
    Config(String),

    /// Input data failed validation (odd byte length, bad JSON override, ...)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation not allowed in the current lifecycle state
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

impl CaptureError {
    /// Machine-readable error type, used in pipeline events and status reports.
    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Device(_) => "device_error",
            CaptureError::Stream(_) => "stream_error",
            CaptureError::Processing(_) => "processing_error",
            CaptureError::Transport(_) => "transport_error",
            CaptureError::Config(_) => "config_error",
            CaptureError::Validation(_) => "validation_error",
            CaptureError::Lifecycle(_) => "lifecycle_error",
        }
    }

    /// Whether the session can continue after this error.
    ///
    /// Only device-level failures stop capture. A mid-stream device failure is
    /// still recoverable through a device refresh.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CaptureError::Device(_) | CaptureError::Config(_) | CaptureError::Lifecycle(_)
        )
    }
}

impl From<config::ConfigError> for CaptureError {
    fn from(err: config::ConfigError) -> Self {
        CaptureError::Config(err.to_string())
    }
}

/// JSON errors almost always come from a malformed override or a bad inbound
/// message, so they are validation failures rather than internal ones.
impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Validation(format!("JSON parsing error: {}", err))
    }
}

impl From<cpal::DevicesError> for CaptureError {
    fn from(err: cpal::DevicesError) -> Self {
        CaptureError::Device(format!("failed to enumerate input devices: {}", err))
    }
}

impl From<cpal::SupportedStreamConfigsError> for CaptureError {
    fn from(err: cpal::SupportedStreamConfigsError) -> Self {
        CaptureError::Device(format!("failed to query device formats: {}", err))
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(err: cpal::BuildStreamError) -> Self {
        CaptureError::Device(format!("failed to open input stream: {}", err))
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(err: cpal::PlayStreamError) -> Self {
        CaptureError::Device(format!("failed to start input stream: {}", err))
    }
}

impl From<cpal::StreamError> for CaptureError {
    fn from(err: cpal::StreamError) -> Self {
        CaptureError::Stream(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for CaptureError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        CaptureError::Transport(err.to_string())
    }
}

/// Shorthand for `Result<T, CaptureError>`.
pub type AppResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(!CaptureError::Device("gone".into()).is_recoverable());
        assert!(CaptureError::Stream("unplugged".into()).is_recoverable());
        assert!(CaptureError::Processing("nan gain".into()).is_recoverable());
        assert!(CaptureError::Transport("closed".into()).is_recoverable());
    }

    #[test]
    fn test_json_error_maps_to_validation() {
        let err: CaptureError = serde_json::from_str::<serde_json::Value>("{oops")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), "validation_error");
        assert!(err.to_string().starts_with("Validation error: JSON parsing error"));
    }
}
