//! # Capture Metrics
//!
//! Counters shared between the capture thread, the transmit worker and the
//! status report. Plain atomics, so the capture thread never waits on a lock to
//! bump a counter.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CaptureMetrics {
    /// Frames that reached the pipeline
    frames_captured: AtomicU64,
    /// Frames classified as speech
    speech_frames: AtomicU64,
    /// Frames accepted by the transmit queue
    frames_queued: AtomicU64,
    /// Frames lost before reaching the pipeline (driver-side channel full)
    frames_dropped_capture: AtomicU64,
    /// Frames lost on the transmit side (queue full, stop, sink failure)
    frames_dropped_transmit: AtomicU64,
    processing_errors: AtomicU64,
    device_errors: AtomicU64,
    transport_errors: AtomicU64,
}

/// Point-in-time copy for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub frames_captured: u64,
    pub speech_frames: u64,
    pub frames_queued: u64,
    pub frames_dropped_capture: u64,
    pub frames_dropped_transmit: u64,
    pub processing_errors: u64,
    pub device_errors: u64,
    pub transport_errors: u64,
}

impl CaptureMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self, is_speech: bool) {
        self.frames_captured.fetch_add(1, Ordering::Relaxed);
        if is_speech {
            self.speech_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_queued(&self) {
        self.frames_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_capture_drops(&self, count: u64) {
        self.frames_dropped_capture.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_transmit_drops(&self, count: u64) {
        self.frames_dropped_transmit.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_processing_error(&self) {
        self.processing_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_device_error(&self) {
        self.device_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            speech_frames: self.speech_frames.load(Ordering::Relaxed),
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            frames_dropped_capture: self.frames_dropped_capture.load(Ordering::Relaxed),
            frames_dropped_transmit: self.frames_dropped_transmit.load(Ordering::Relaxed),
            processing_errors: self.processing_errors.load(Ordering::Relaxed),
            device_errors: self.device_errors.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
        }
    }
}

impl MetricsSnapshot {
    /// Share of captured frames classified as speech (0.0 to 1.0).
    pub fn speech_ratio(&self) -> f64 {
        if self.frames_captured > 0 {
            self.speech_frames as f64 / self.frames_captured as f64
        } else {
            0.0
        }
    }

    /// Share of captured frames that hit a processing error.
    pub fn error_rate(&self) -> f64 {
        if self.frames_captured > 0 {
            self.processing_errors as f64 / self.frames_captured as f64
        } else {
            0.0
        }
    }
}
