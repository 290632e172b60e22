//! # Status Report and Microphone Probe
//!
//! Diagnostics for the capture agent:
//! - [`status_report`]: JSON snapshot of a [`CaptureContext`], logged
//!   periodically by `run`
//! - [`probe_microphone`]: open the device for a few seconds without a
//!   transport and report whether any signal came in

use crate::audio::buffer::samples_per_interval;
use crate::audio::capture::ActiveCapture;
use crate::audio::events::{event_channel, PipelineEvent};
use crate::audio::metrics::CaptureMetrics;
use crate::audio::processor::FrameProcessor;
use crate::config::AppConfig;
use crate::device::{DeviceManager, DeviceSelection};
use crate::error::AppResult;
use crate::state::CaptureContext;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Average raw level above which the probe counts as a pass.
pub const PROBE_MIN_LEVEL: f32 = 0.001;

pub fn status_report(ctx: &CaptureContext) -> serde_json::Value {
    let metrics = ctx.metrics().snapshot();
    let meter = ctx.meter().snapshot();
    let config = ctx.config();

    json!({
        "status": if ctx.capture_failed() { "degraded" } else { ctx.lifecycle().as_str() },
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": ctx.uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "url": config.transport.url,
        },
        "device": {
            "selection": ctx.selection().to_string(),
            "name": ctx.device_name(),
            "capturing": ctx.is_capturing(),
        },
        "levels": meter,
        "agc": {
            "enabled": config.agc.enabled,
            "target_level": config.agc.target_level,
            "last_gain_applied": meter.gain,
        },
        "metrics": {
            "frames_captured": metrics.frames_captured,
            "speech_frames": metrics.speech_frames,
            "speech_ratio": metrics.speech_ratio(),
            "frames_queued": metrics.frames_queued,
            "frames_dropped_capture": metrics.frames_dropped_capture,
            "frames_dropped_transmit": metrics.frames_dropped_transmit,
            "processing_errors": metrics.processing_errors,
            "error_rate": metrics.error_rate(),
            "device_errors": metrics.device_errors,
            "transport_errors": metrics.transport_errors,
        },
        "session": ctx.session().map(|s| s.snapshot()),
    })
}

/// Outcome of a microphone self-test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    pub device: String,
    pub duration_seconds: u64,
    pub frames: u64,
    pub speech_frames: u64,
    pub average_level: f32,
    pub peak_level: f32,
    pub passed: bool,
}

impl ProbeReport {
    /// Summarise the raw levels of the frames seen during a probe.
    pub fn from_levels(
        device: String,
        duration_seconds: u64,
        levels: &[f32],
        speech_frames: u64,
    ) -> Self {
        let frames = levels.len() as u64;
        let average_level = if levels.is_empty() {
            0.0
        } else {
            levels.iter().sum::<f32>() / levels.len() as f32
        };
        let peak_level = levels.iter().copied().fold(0.0f32, f32::max);

        Self {
            device,
            duration_seconds,
            frames,
            speech_frames,
            average_level,
            peak_level,
            passed: frames > 0 && average_level > PROBE_MIN_LEVEL,
        }
    }
}

/// Capture from the configured device for `seconds` and report what arrived.
///
/// Nothing is transmitted; frames go through the normal pipeline so the
/// speech count reflects the configured VAD and AGC.
pub async fn probe_microphone(
    config: &AppConfig,
    selection: &DeviceSelection,
    seconds: u64,
) -> AppResult<ProbeReport> {
    let device = DeviceManager::new().select(selection)?;
    let metrics = Arc::new(CaptureMetrics::new());
    let (events, receiver) = event_channel(config.transport.event_queue_capacity);

    let audio = &config.audio;
    let processor = FrameProcessor::new(
        config.agc,
        config.vad,
        samples_per_interval(audio.sample_rate, audio.frame_interval_ms),
    )
    .with_metrics(metrics.clone())
    .with_events(events.clone());

    let capture = ActiveCapture::start(&device, audio, processor, metrics.clone(), events)
        .map_err(|failure| failure.error)?;
    let device_name = capture.device_name().to_string();
    info!("Probing '{}' for {} second(s)", device_name, seconds);

    let mut levels = Vec::new();
    let collect = |levels: &mut Vec<f32>| {
        for event in receiver.try_iter() {
            if let PipelineEvent::Frame(report) = event {
                levels.push(report.original_level);
            }
        }
    };

    let deadline = tokio::time::Instant::now() + Duration::from_secs(seconds);
    let mut tick = tokio::time::interval(Duration::from_millis(u64::from(audio.frame_interval_ms)));
    while tokio::time::Instant::now() < deadline {
        tick.tick().await;
        collect(&mut levels);
    }

    let processor = capture.stop()?;
    collect(&mut levels);

    let speech_frames = metrics.snapshot().speech_frames;
    let report = ProbeReport::from_levels(device_name, seconds, &levels, speech_frames);
    info!(
        "Probe finished: {} frames processed, average level {:.4}, {}",
        processor.frames_processed(),
        report.average_level,
        if report.passed { "pass" } else { "fail" }
    );
    Ok(report)
}
