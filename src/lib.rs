//! # Voice Capture Agent
//!
//! Captures microphone audio in 100 ms frames, normalises loudness with an
//! automatic gain controller, detects speech and streams the speech frames to
//! a transcription service over WebSocket.
//!
//! ## Module Layout:
//! - **audio**: the capture pipeline (analysis, VAD, AGC, amplifier, transmitter, session)
//! - **config**: layered configuration (defaults, TOML file, `APP_` environment)
//! - **device**: input device enumeration and selection
//! - **error**: the crate error type
//! - **health**: status report and microphone probe
//! - **state**: the capture context that owns a running capture
//! - **websocket**: wire protocol and the WebSocket transport

pub mod audio;
pub mod config;
pub mod device;
pub mod error;
pub mod health;
pub mod state;
pub mod websocket;

pub use config::AppConfig;
pub use error::{AppResult, CaptureError};
pub use state::{CaptureContext, Lifecycle};
