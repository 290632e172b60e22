//! # Capture Context
//!
//! The one object that owns a running capture: configuration, the selected
//! device, shared diagnostics and the pieces that move frames. It is built
//! explicitly and passed around; there is no global instance.
//!
//! ## Lifecycle:
//! ```text
//! Initialized --start--> Active --stop--> Initialized
//!      |                   |
//!      +-----dispose-------+--dispose--> Disposed
//! ```
//! Every operation checks the current phase and returns a lifecycle error when
//! called out of order. `dispose` is idempotent.
//!
//! ## Ownership:
//! - **Shared, lock-free**: `CaptureMetrics` (Arc of atomics), `LevelMeter`,
//!   the event publisher. Readers never contend with the capture thread.
//! - **Exclusive**: the `FrameProcessor` (and with it the gain state) lives on
//!   the capture thread while running and is parked here between runs.
//! - **Thread-bound**: the cpal stream inside `ActiveCapture` is not `Send`, so
//!   the context stays on the task that created it.

use crate::audio::buffer::samples_per_interval;
use crate::audio::capture::{ActiveCapture, StartFailure};
use crate::audio::events::{event_channel, EventPublisher, PipelineEvent};
use crate::audio::meter::LevelMeter;
use crate::audio::metrics::CaptureMetrics;
use crate::audio::processor::FrameProcessor;
use crate::audio::session::{SessionSnapshot, SessionState};
use crate::audio::transmitter::{FrameSink, FrameTransmitter, SHUTDOWN_SEND_TIMEOUT};
use crate::config::AppConfig;
use crate::device::{DeviceManager, DeviceSelection};
use crate::error::{AppResult, CaptureError};
use crossbeam_channel::Receiver;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Phase of a [`CaptureContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Initialized,
    Active,
    Disposed,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Initialized => "initialized",
            Lifecycle::Active => "active",
            Lifecycle::Disposed => "disposed",
        }
    }
}

pub struct CaptureContext {
    config: AppConfig,
    selection: DeviceSelection,
    devices: DeviceManager,
    metrics: Arc<CaptureMetrics>,
    meter: LevelMeter,
    events: EventPublisher,
    event_receiver: Receiver<PipelineEvent>,
    session: Option<Arc<SessionState>>,
    transmitter: Option<FrameTransmitter>,
    capture: Option<ActiveCapture>,
    /// Processor kept between runs so gain state survives a stop
    parked: Option<FrameProcessor>,
    lifecycle: Lifecycle,
    created_at: Instant,
}

impl CaptureContext {
    /// Build a context from a validated configuration.
    ///
    /// The device named in `config.audio.device` is resolved lazily on start.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        let selection: DeviceSelection = config.audio.device.parse()?;
        let (events, event_receiver) = event_channel(config.transport.event_queue_capacity);

        Ok(Self {
            meter: LevelMeter::new(config.agc.initial_gain()),
            config,
            selection,
            devices: DeviceManager::new(),
            metrics: Arc::new(CaptureMetrics::new()),
            events,
            event_receiver,
            session: None,
            transmitter: None,
            capture: None,
            parked: None,
            lifecycle: Lifecycle::Initialized,
            created_at: Instant::now(),
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn selection(&self) -> &DeviceSelection {
        &self.selection
    }

    pub fn metrics(&self) -> &Arc<CaptureMetrics> {
        &self.metrics
    }

    pub fn meter(&self) -> &LevelMeter {
        &self.meter
    }

    /// Consumer side of the pipeline event channel. Clones share the queue.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.event_receiver.clone()
    }

    /// The session of the current or most recent run.
    pub fn session(&self) -> Option<&Arc<SessionState>> {
        self.session.as_ref()
    }

    /// Name of the open device, if capture is running.
    pub fn device_name(&self) -> Option<&str> {
        self.capture.as_ref().map(|c| c.device_name())
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Whether the driver reported a stream error on the running capture.
    pub fn capture_failed(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.has_failed())
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.created_at.elapsed().as_secs()
    }

    /// Change the device used by the next start or refresh.
    pub fn set_device(&mut self, selection: DeviceSelection) -> AppResult<()> {
        self.ensure_not_disposed("set_device")?;
        self.config.audio.device = selection.to_string();
        self.selection = selection;
        Ok(())
    }

    /// Open a session, start the transmitter and begin capturing.
    ///
    /// ## Parameters:
    /// - **sink**: outbound transport; usually the WebSocket write half
    ///
    /// ## Errors:
    /// A lifecycle error outside `Initialized`. A device error if the
    /// microphone cannot be opened; the transmitter is torn down again, the
    /// context stays `Initialized` and the gain state stays parked.
    pub async fn start(&mut self, sink: Box<dyn FrameSink>) -> AppResult<Arc<SessionState>> {
        match self.lifecycle {
            Lifecycle::Initialized => {}
            Lifecycle::Active => {
                return Err(CaptureError::Lifecycle("capture is already active".to_string()));
            }
            Lifecycle::Disposed => {
                return Err(CaptureError::Lifecycle("capture context was disposed".to_string()));
            }
        }

        let session = Arc::new(SessionState::new());
        let transmitter = FrameTransmitter::spawn(
            sink,
            self.config.transport.transmit_queue_frames,
            session.clone(),
            self.metrics.clone(),
            self.events.clone(),
        );

        let mut processor = self.take_processor();
        processor.set_queue(Some(transmitter.queue()));

        let capture = match self.open_capture(processor) {
            Ok(capture) => capture,
            Err(e) => {
                warn!("Capture failed to start: {}", e);
                if let Err(stop_err) = transmitter.stop().await {
                    warn!("Transmitter shutdown after failed start: {}", stop_err);
                }
                session.close();
                return Err(e);
            }
        };

        info!(
            "Capture session {} active on '{}'",
            session.session_id(),
            capture.device_name()
        );

        self.capture = Some(capture);
        self.transmitter = Some(transmitter);
        self.session = Some(session.clone());
        self.lifecycle = Lifecycle::Active;
        Ok(session)
    }

    /// Stop capturing and close the session.
    ///
    /// In-flight processing completes, the device is closed, queued frames are
    /// dropped and `stop_voice_recognition` is sent. The gain state is parked
    /// for the next start.
    pub async fn stop(&mut self) -> AppResult<SessionSnapshot> {
        if self.lifecycle != Lifecycle::Active {
            return Err(CaptureError::Lifecycle(format!(
                "cannot stop capture while {}",
                self.lifecycle.as_str()
            )));
        }

        if let Some(capture) = self.capture.take() {
            match capture.stop() {
                Ok(mut processor) => {
                    processor.set_queue(None);
                    self.parked = Some(processor);
                }
                Err(e) => warn!("Capture thread did not stop cleanly: {}", e),
            }
        }

        if let Some(transmitter) = self.transmitter.take() {
            match transmitter.stop().await {
                Ok(mut sink) => {
                    match tokio::time::timeout(SHUTDOWN_SEND_TIMEOUT, sink.close()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => debug!("Sink close failed: {}", e),
                        Err(_) => warn!("Sink did not close within {:?}", SHUTDOWN_SEND_TIMEOUT),
                    }
                }
                Err(e) => warn!("Transmitter did not stop cleanly: {}", e),
            }
        }

        self.lifecycle = Lifecycle::Initialized;

        let snapshot = match &self.session {
            Some(session) => session.close(),
            None => {
                return Err(CaptureError::Lifecycle(
                    "active capture without a session".to_string(),
                ));
            }
        };
        info!(
            "Capture session {} closed after {} frames ({} sent)",
            snapshot.session_id, snapshot.frame_count, snapshot.successful_send_count
        );
        Ok(snapshot)
    }

    /// Reopen the input device without touching the session or transmitter.
    ///
    /// ## Parameters:
    /// - **preserve_gain**: keep the AGC history; otherwise it is reset to the
    ///   starting gain
    ///
    /// If reopening fails the context stays `Active` with capture halted and
    /// the processor parked, and a later refresh may try again.
    pub fn refresh_device(&mut self, preserve_gain: bool) -> AppResult<()> {
        if self.lifecycle != Lifecycle::Active {
            return Err(CaptureError::Lifecycle(format!(
                "cannot refresh device while {}",
                self.lifecycle.as_str()
            )));
        }

        info!("Refreshing input device '{}'", self.selection);

        let stopped = match self.capture.take() {
            Some(capture) => Some(capture.stop()?),
            None => None,
        };
        let processor = self.prepare_refresh(stopped, preserve_gain);

        let capture = self.open_capture(processor)?;
        info!("Capture resumed on '{}'", capture.device_name());
        self.capture = Some(capture);
        Ok(())
    }

    /// Release everything. Safe to call more than once.
    pub async fn dispose(&mut self) -> AppResult<()> {
        match self.lifecycle {
            Lifecycle::Disposed => return Ok(()),
            Lifecycle::Active => {
                self.stop().await?;
            }
            Lifecycle::Initialized => {}
        }

        self.parked = None;
        self.lifecycle = Lifecycle::Disposed;
        debug!("Capture context disposed");
        Ok(())
    }

    /// The parked processor, or a fresh one wired to this context's diagnostics.
    fn take_processor(&mut self) -> FrameProcessor {
        self.parked.take().unwrap_or_else(|| {
            let audio = &self.config.audio;
            FrameProcessor::new(
                self.config.agc,
                self.config.vad,
                samples_per_interval(audio.sample_rate, audio.frame_interval_ms),
            )
            .with_meter(self.meter.clone())
            .with_metrics(self.metrics.clone())
            .with_events(self.events.clone())
        })
    }

    /// Processor for a reopened device: the one just stopped (else the parked
    /// or a fresh one), gain history reset unless `preserve_gain`, wired to
    /// the running transmitter.
    fn prepare_refresh(
        &mut self,
        stopped: Option<FrameProcessor>,
        preserve_gain: bool,
    ) -> FrameProcessor {
        let mut processor = match stopped {
            Some(processor) => processor,
            None => self.take_processor(),
        };
        if !preserve_gain {
            processor.reset_gain();
        }
        processor.set_queue(self.transmitter.as_ref().map(|t| t.queue()));
        processor
    }

    fn open_capture(&mut self, processor: FrameProcessor) -> AppResult<ActiveCapture> {
        let device = match self.devices.select(&self.selection) {
            Ok(device) => device,
            Err(e) => return Err(self.recover_failed_open(StartFailure::new(e, processor))),
        };

        ActiveCapture::start(
            &device,
            &self.config.audio,
            processor,
            self.metrics.clone(),
            self.events.clone(),
        )
        .map_err(|failure| self.recover_failed_open(failure))
    }

    /// Report a device that would not open and park the processor it handed back.
    fn recover_failed_open(&mut self, failure: StartFailure) -> CaptureError {
        self.metrics.record_device_error();
        self.events.publish(PipelineEvent::from_error(&failure.error, 0));
        match failure.processor {
            Some(mut processor) => {
                processor.set_queue(None);
                self.parked = Some(processor);
            }
            None => warn!("Gain state lost with the failed capture thread"),
        }
        failure.error
    }

    fn ensure_not_disposed(&self, operation: &str) -> AppResult<()> {
        if self.lifecycle == Lifecycle::Disposed {
            return Err(CaptureError::Lifecycle(format!(
                "{} called on a disposed capture context",
                operation
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for CaptureContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureContext")
            .field("lifecycle", &self.lifecycle)
            .field("selection", &self.selection)
            .field("capturing", &self.capture.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::analysis::test_signals::sine_at_level;
    use crate::audio::capture::negotiate_format;
    use crate::websocket::OutboundEvent;
    use async_trait::async_trait;

    struct NullSink;

    #[async_trait]
    impl FrameSink for NullSink {
        async fn send(&mut self, _event: OutboundEvent) -> AppResult<()> {
            Ok(())
        }
    }

    fn speech_frame(level: f64) -> Vec<i16> {
        sine_at_level(level, 600.0, 24_000, 2400)
    }

    /// A processor whose AGC has climbed above the starting gain.
    fn trained_processor(config: &AppConfig) -> FrameProcessor {
        let mut processor = FrameProcessor::new(config.agc, config.vad, 2400);
        let quiet = speech_frame(0.05);
        for _ in 0..30 {
            processor.process(&quiet);
        }
        assert!(processor.gain_controller().current_gain() > config.agc.initial_gain());
        processor
    }

    #[test]
    fn test_new_context_is_initialized() {
        let ctx = CaptureContext::new(AppConfig::default()).unwrap();
        assert_eq!(ctx.lifecycle(), Lifecycle::Initialized);
        assert_eq!(ctx.selection(), &DeviceSelection::Default);
        assert!(!ctx.is_capturing());
        assert!(ctx.session().is_none());
        assert_eq!(ctx.meter().gain(), 2.0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.audio.channels = 2;
        assert!(CaptureContext::new(config).is_err());
    }

    #[tokio::test]
    async fn test_stop_and_refresh_require_active() {
        let mut ctx = CaptureContext::new(AppConfig::default()).unwrap();
        assert_eq!(ctx.stop().await.unwrap_err().kind(), "lifecycle_error");
        assert_eq!(ctx.refresh_device(false).unwrap_err().kind(), "lifecycle_error");
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent_and_final() {
        let mut ctx = CaptureContext::new(AppConfig::default()).unwrap();
        ctx.dispose().await.unwrap();
        ctx.dispose().await.unwrap();
        assert_eq!(ctx.lifecycle(), Lifecycle::Disposed);

        let err = ctx.start(Box::new(NullSink)).await.unwrap_err();
        assert_eq!(err.kind(), "lifecycle_error");
        assert!(ctx.set_device(DeviceSelection::Index(0)).is_err());
    }

    #[test]
    fn test_set_device_updates_config() {
        let mut ctx = CaptureContext::new(AppConfig::default()).unwrap();
        ctx.set_device(DeviceSelection::Name("USB".into())).unwrap();
        assert_eq!(ctx.config().audio.device, "USB");
        assert_eq!(ctx.selection(), &DeviceSelection::Name("USB".into()));
    }

    #[test]
    fn test_failed_open_parks_learned_gain() {
        let mut ctx = CaptureContext::new(AppConfig::default()).unwrap();
        let trained = trained_processor(ctx.config());
        let learned = trained.gain_controller().current_gain();

        let error = negotiate_format(&[], 24_000, 1).unwrap_err();
        let returned = ctx.recover_failed_open(StartFailure::new(error, trained));
        assert_eq!(returned.kind(), "device_error");
        assert_eq!(ctx.metrics().snapshot().device_errors, 1);
        assert!(ctx
            .events()
            .try_iter()
            .any(|e| matches!(e, PipelineEvent::DeviceError { recoverable: false, .. })));

        // The next attempt resumes from the learned gain, not a fresh controller.
        let resumed = ctx.prepare_refresh(None, true);
        assert_eq!(resumed.gain_controller().current_gain(), learned);
        assert!(!resumed.gain_controller().state().recent_levels.is_empty());
    }

    #[tokio::test]
    async fn test_refresh_resets_gain_unless_preserved() {
        let mut ctx = CaptureContext::new(AppConfig::default()).unwrap();
        ctx.transmitter = Some(FrameTransmitter::spawn(
            Box::new(NullSink),
            8,
            Arc::new(SessionState::new()),
            ctx.metrics.clone(),
            EventPublisher::disabled(),
        ));
        let speech = speech_frame(0.15);

        let trained = trained_processor(ctx.config());
        let learned = trained.gain_controller().current_gain();

        let mut kept = ctx.prepare_refresh(Some(trained), true);
        assert_eq!(kept.gain_controller().current_gain(), learned);
        assert!(!kept.gain_controller().state().recent_levels.is_empty());
        assert!(kept.process(&speech).queued);

        let mut reset = ctx.prepare_refresh(Some(kept), false);
        assert_eq!(reset.gain_controller().current_gain(), 2.0);
        assert!(reset.gain_controller().state().recent_levels.is_empty());
        assert!(reset.process(&speech).queued);

        if let Some(transmitter) = ctx.transmitter.take() {
            transmitter.stop().await.unwrap();
        }
    }
}
