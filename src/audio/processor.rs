//! # Frame Processing Pipeline
//!
//! Runs once per captured frame, synchronously, on the capture thread:
//!
//! 1. **Level**: loudness of the raw frame
//! 2. **Gain**: the controller's current gain
//! 3. **Amplify**: scale and clamp into a reused output buffer
//! 4. **Post level**: loudness after amplification, fed back to the controller
//!    (the adjusted gain applies to the next frame)
//! 5. **Classify**: voice activity detection on the amplified frame
//! 6. **Transmit**: speech frames are queued for sending, never awaited
//!
//! ## Failure Handling:
//! A frame that cannot be amplified is passed through raw with a gain of 1.0
//! ("fail open"). The error is counted and published as an event, and
//! processing of later frames carries on. Nothing here can halt capture.

use super::agc::{AgcConfig, GainController};
use super::amplifier::AmplificationProcessor;
use super::analysis::compute_level;
use super::buffer::AudioBuffer;
use super::events::{EventPublisher, FrameReport, PipelineEvent};
use super::meter::LevelMeter;
use super::metrics::CaptureMetrics;
use super::transmitter::FrameQueue;
use super::vad::{VadConfig, VadDecision, VoiceActivityDetector};
use crate::error::{AppResult, CaptureError};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameOutcome {
    pub sequence: u64,
    pub original_level: f32,
    pub processed_level: f32,
    pub gain_applied: f32,
    pub vad: VadDecision,
    /// Accepted by the transmit queue
    pub queued: bool,
    /// Processing failed and the raw frame was used
    pub passthrough: bool,
}

/// Owns every piece of per-frame state. Lives on the capture thread.
pub struct FrameProcessor {
    agc: GainController,
    vad: VoiceActivityDetector,
    amplifier: AmplificationProcessor,
    output: Vec<i16>,
    sequence: u64,
    queue: Option<FrameQueue>,
    meter: LevelMeter,
    metrics: Arc<CaptureMetrics>,
    events: EventPublisher,
}

impl FrameProcessor {
    /// Build a pipeline from already validated settings.
    ///
    /// ## Parameters:
    /// - **agc** / **vad**: tuning, normally from `AppConfig`
    /// - **frame_samples**: expected frame length, used to pre-size the output buffer
    pub fn new(agc: AgcConfig, vad: VadConfig, frame_samples: usize) -> Self {
        let agc = GainController::new(agc);
        Self {
            meter: LevelMeter::new(agc.current_gain()),
            agc,
            vad: VoiceActivityDetector::new(vad),
            amplifier: AmplificationProcessor::new(),
            output: Vec::with_capacity(frame_samples),
            sequence: 0,
            queue: None,
            metrics: Arc::new(CaptureMetrics::new()),
            events: EventPublisher::disabled(),
        }
    }

    /// Forward speech frames to this queue.
    pub fn with_queue(mut self, queue: FrameQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_meter(mut self, meter: LevelMeter) -> Self {
        self.meter = meter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<CaptureMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    /// Replace the transmit queue, e.g. after the transport was rebuilt.
    pub fn set_queue(&mut self, queue: Option<FrameQueue>) {
        self.queue = queue;
    }

    pub fn gain_controller(&self) -> &GainController {
        &self.agc
    }

    /// Forget the AGC history and restore the starting gain.
    pub fn reset_gain(&mut self) {
        self.agc.reset();
        debug!("Gain state reset to {:.2}", self.agc.current_gain());
    }

    pub fn frames_processed(&self) -> u64 {
        self.sequence
    }

    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    /// Run the pipeline on one frame of samples.
    pub fn process(&mut self, samples: &[i16]) -> FrameOutcome {
        self.sequence += 1;
        let sequence = self.sequence;

        let original_level = compute_level(samples);
        let gain = self.agc.current_gain();

        let (processed_level, gain_applied, passthrough) = match self.amplify(samples, gain) {
            Ok(level) => (level, gain, false),
            Err(e) => {
                self.report_error(&e, sequence);
                self.output.clear();
                self.output.extend_from_slice(samples);
                (original_level, 1.0, true)
            }
        };

        if !passthrough {
            if let Err(e) = self.agc.update(processed_level) {
                self.report_error(&e, sequence);
            }
        }

        let vad = self.vad.evaluate_samples(&self.output);
        self.metrics.record_frame(vad.is_speech);
        self.meter
            .record(original_level, processed_level, gain_applied, vad.is_speech);

        let queued = self.transmit(
            sequence,
            processed_level,
            original_level,
            gain_applied,
            vad.is_speech,
        );

        trace!(
            "frame {}: level {:.3} -> {:.3}, gain {:.2}, speech {}{}",
            sequence,
            original_level,
            processed_level,
            gain_applied,
            vad.is_speech,
            vad.rejection.map(|r| format!(" ({})", r.as_str())).unwrap_or_default()
        );

        let outcome = FrameOutcome {
            sequence,
            original_level,
            processed_level,
            gain_applied,
            vad,
            queued,
            passthrough,
        };

        self.events.publish(PipelineEvent::Frame(FrameReport {
            sequence,
            original_level,
            processed_level,
            gain_applied,
            vad,
            queued,
        }));

        outcome
    }

    /// Decode little-endian PCM and run the pipeline.
    ///
    /// An odd byte count cannot be decoded at all, so unlike amplification
    /// failures this is returned to the caller.
    pub fn process_bytes(&mut self, data: &[u8]) -> AppResult<FrameOutcome> {
        let buffer = AudioBuffer::from_le_bytes(data)?;
        Ok(self.process(buffer.samples()))
    }

    /// The processed samples of the most recent frame.
    pub fn last_output(&self) -> &[i16] {
        &self.output
    }

    fn amplify(&mut self, samples: &[i16], gain: f32) -> AppResult<f32> {
        self.output.clear();
        self.output.resize(samples.len(), 0);
        self.amplifier.apply(samples, &mut self.output, gain)?;
        Ok(compute_level(&self.output))
    }

    fn transmit(&self, sequence: u64, post: f32, pre: f32, gain: f32, is_speech: bool) -> bool {
        let Some(queue) = &self.queue else {
            return false;
        };

        match queue.send(sequence, &self.output, post, pre, gain, is_speech) {
            Ok(queued) => queued,
            Err(e) => {
                debug!("Frame {} not queued: {}", sequence, e);
                self.metrics.record_transport_error();
                self.events.publish(PipelineEvent::from_error(&e, sequence));
                false
            }
        }
    }

    fn report_error(&self, err: &CaptureError, sequence: u64) {
        warn!("Frame {} processing failed, passing through: {}", sequence, err);
        self.metrics.record_processing_error();
        self.events.publish(PipelineEvent::from_error(err, sequence));
    }
}

impl std::fmt::Debug for FrameProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameProcessor")
            .field("sequence", &self.sequence)
            .field("gain", &self.agc.current_gain())
            .field("has_queue", &self.queue.is_some())
            .finish()
    }
}
