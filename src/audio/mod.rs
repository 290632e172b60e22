//! # Audio Processing Module
//!
//! Real-time capture pipeline for speech transcription. Frames flow from the
//! microphone through level analysis, automatic gain control, amplification
//! and voice activity detection; speech frames are queued for the transport.
//!
//! ## Key Components:
//! - **capture**: device stream, frame chunking and the capture thread
//! - **analysis**: level, variation and zero-crossing measurements
//! - **vad**: speech / non-speech decision
//! - **agc**: gain controller with a rolling level history
//! - **amplifier**: gain application with clamping
//! - **processor**: the per-frame pipeline tying the above together
//! - **transmitter**: non-blocking hand-off to the outbound sink
//! - **session**: per-session counters and lifecycle
//! - **meter**, **metrics**, **events**: diagnostics read off the capture thread
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 24kHz (24,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod agc;
pub mod amplifier;
pub mod analysis;
pub mod buffer;
pub mod capture;
pub mod events;
pub mod meter;
pub mod metrics;
pub mod processor;
pub mod session;
pub mod transmitter;
pub mod vad;

pub const SAMPLE_RATE: u32 = 24_000;
pub const BIT_DEPTH: u16 = 16;
pub const CHANNELS: u16 = 1;
pub const FRAME_INTERVAL_MS: u32 = 100;
