//! # Audio Frame Source
//!
//! Opens an input device through cpal and turns its callback stream into fixed
//! 100 ms frames of 24 kHz mono 16-bit PCM.
//!
//! ## Threads:
//! - **Driver callback**: converts samples to i16, downmixes to mono, cuts
//!   fixed-length frames and offers them to a bounded channel with `try_send`.
//!   It never blocks; when the channel is full the frame is dropped and counted.
//! - **Capture thread**: owns the [`FrameProcessor`] and runs the pipeline on
//!   each frame in arrival order. On stop it finishes the frame in hand, drops
//!   the rest and hands the processor back, gain state included.

use super::buffer::samples_per_interval;
use super::events::{EventPublisher, PipelineEvent};
use super::metrics::CaptureMetrics;
use super::processor::FrameProcessor;
use crate::config::AudioConfig;
use crate::error::{AppResult, CaptureError};

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfigRange};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How often the capture thread re-checks the running flag while idle.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// Stream format negotiated with the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    /// Channels delivered by the device; downmixed to mono
    pub device_channels: u16,
    pub sample_format: SampleFormat,
}

/// Pick a device configuration at the target rate.
///
/// ## Preference Order:
/// 1. native i16 with the requested channel count
/// 2. i16 with any channel count
/// 3. f32, then u16, with the requested channel count first
///
/// The pipeline does not resample, so a device that cannot deliver the target
/// rate is a device error.
pub fn negotiate_format(
    ranges: &[SupportedStreamConfigRange],
    sample_rate: u32,
    channels: u16,
) -> AppResult<CaptureFormat> {
    let supports_rate = |r: &SupportedStreamConfigRange| {
        r.min_sample_rate().0 <= sample_rate && r.max_sample_rate().0 >= sample_rate
    };

    let rank = |r: &SupportedStreamConfigRange| -> Option<u8> {
        if !supports_rate(r) {
            return None;
        }
        let format_rank = match r.sample_format() {
            SampleFormat::I16 => 0,
            SampleFormat::F32 => 2,
            SampleFormat::U16 => 4,
            _ => return None,
        };
        let channel_rank = if r.channels() == channels { 0 } else { 1 };
        Some(format_rank + channel_rank)
    };

    ranges
        .iter()
        .filter_map(|r| rank(r).map(|score| (score, r)))
        .min_by_key(|(score, _)| *score)
        .map(|(_, r)| CaptureFormat {
            sample_rate,
            device_channels: r.channels().max(1),
            sample_format: r.sample_format(),
        })
        .ok_or_else(|| {
            CaptureError::Device(format!(
                "device offers no i16/f32/u16 input format at {} Hz",
                sample_rate
            ))
        })
}

/// Convert a normalised float sample to 16-bit.
#[inline]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[inline]
pub fn u16_to_i16(sample: u16) -> i16 {
    (sample as i32 - 32768) as i16
}

/// Cuts the callback stream into fixed-length mono frames.
///
/// Lives inside the driver callback. Its buffers are allocated once; the only
/// per-frame allocation is the `Vec` handed to the capture thread.
pub struct FrameChunker {
    frame_samples: usize,
    pending: Vec<i16>,
    sender: Sender<Vec<i16>>,
    metrics: Arc<CaptureMetrics>,
}

impl FrameChunker {
    pub fn new(
        frame_samples: usize,
        sender: Sender<Vec<i16>>,
        metrics: Arc<CaptureMetrics>,
    ) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            frame_samples,
            pending: Vec::with_capacity(frame_samples * 2),
            sender,
            metrics,
        }
    }

    /// Append interleaved device samples and emit every complete frame.
    pub fn push<T, F>(&mut self, data: &[T], channels: usize, mut convert: F)
    where
        T: Copy,
        F: FnMut(T) -> i16,
    {
        if channels <= 1 {
            self.pending.extend(data.iter().copied().map(&mut convert));
        } else {
            for frame in data.chunks(channels) {
                let sum: i32 = frame.iter().map(|&s| convert(s) as i32).sum();
                self.pending.push((sum / frame.len() as i32) as i16);
            }
        }

        while self.pending.len() >= self.frame_samples {
            let frame: Vec<i16> = self.pending.drain(..self.frame_samples).collect();
            match self.sender.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => self.metrics.record_capture_drops(1),
                Err(TrySendError::Disconnected(_)) => {
                    self.pending.clear();
                    break;
                }
            }
        }
    }
}

/// Start the capture thread.
///
/// The thread runs until `running` is cleared or every sender is gone, then
/// returns the processor. Frames still queued at that point are dropped.
pub fn spawn_capture_thread(
    mut processor: FrameProcessor,
    frames: Receiver<Vec<i16>>,
    running: Arc<AtomicBool>,
    metrics: Arc<CaptureMetrics>,
) -> AppResult<JoinHandle<FrameProcessor>> {
    std::thread::Builder::new()
        .name("audio-capture".to_string())
        .spawn(move || {
            debug!("Capture thread started");
            loop {
                match frames.recv_timeout(IDLE_POLL) {
                    Ok(frame) => {
                        if !running.load(Ordering::Acquire) {
                            metrics.record_capture_drops(1);
                            break;
                        }
                        processor.process(&frame);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if !running.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            let leftover = frames.try_iter().count() as u64;
            if leftover > 0 {
                metrics.record_capture_drops(leftover);
                debug!("Dropped {} captured frames on stop", leftover);
            }
            debug!("Capture thread finished after {} frames", processor.frames_processed());
            processor
        })
        .map_err(|e| CaptureError::Device(format!("failed to spawn capture thread: {}", e)))
}

/// A failed [`ActiveCapture::start`].
///
/// The processor comes back unless the capture thread could not be spawned,
/// so learned gain survives a device that refuses to open.
pub struct StartFailure {
    pub error: CaptureError,
    pub processor: Option<FrameProcessor>,
}

impl StartFailure {
    pub fn new(error: CaptureError, processor: FrameProcessor) -> Self {
        Self {
            error,
            processor: Some(processor),
        }
    }
}

/// A running input stream plus its capture thread.
///
/// Holds the cpal stream, which is not `Send` on every platform, so this stays
/// on the task that created it.
pub struct ActiveCapture {
    stream: cpal::Stream,
    worker: JoinHandle<FrameProcessor>,
    running: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    device_name: String,
    format: CaptureFormat,
}

/// A built but not yet playing stream, with the receiving end of its frames.
struct OpenedStream {
    stream: cpal::Stream,
    frames: Receiver<Vec<i16>>,
    failed: Arc<AtomicBool>,
    device_name: String,
    format: CaptureFormat,
}

impl ActiveCapture {
    /// Open `device`, start the stream and the capture thread.
    ///
    /// ## Errors:
    /// Any failure to negotiate, build or start the stream is a device error.
    /// The processor is handed back inside the [`StartFailure`].
    pub fn start(
        device: &cpal::Device,
        audio: &AudioConfig,
        processor: FrameProcessor,
        metrics: Arc<CaptureMetrics>,
        events: EventPublisher,
    ) -> Result<Self, StartFailure> {
        let opened = match open_stream(device, audio, &metrics, events) {
            Ok(opened) => opened,
            Err(e) => return Err(StartFailure::new(e, processor)),
        };

        let running = Arc::new(AtomicBool::new(true));
        let worker = spawn_capture_thread(processor, opened.frames, running.clone(), metrics)
            .map_err(|error| StartFailure {
                error,
                processor: None,
            })?;

        if let Err(e) = opened.stream.play() {
            running.store(false, Ordering::Release);
            drop(opened.stream);
            return Err(StartFailure {
                error: e.into(),
                processor: worker.join().ok(),
            });
        }

        info!("Capture started on '{}'", opened.device_name);

        Ok(Self {
            stream: opened.stream,
            worker,
            running,
            failed: opened.failed,
            device_name: opened.device_name,
            format: opened.format,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Whether the driver reported a stream error since start.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Stop the stream, finish the in-flight frame and return the processor.
    pub fn stop(self) -> AppResult<FrameProcessor> {
        self.running.store(false, Ordering::Release);
        if let Err(e) = self.stream.pause() {
            warn!("Failed to pause input stream: {}", e);
        }
        drop(self.stream);

        let processor = self
            .worker
            .join()
            .map_err(|_| CaptureError::Stream("capture thread panicked".to_string()))?;

        info!("Capture stopped on '{}'", self.device_name);
        Ok(processor)
    }
}

fn open_stream(
    device: &cpal::Device,
    audio: &AudioConfig,
    metrics: &Arc<CaptureMetrics>,
    events: EventPublisher,
) -> AppResult<OpenedStream> {
    let device_name = device.name().unwrap_or_else(|_| "unknown input device".to_string());
    let ranges: Vec<SupportedStreamConfigRange> = device.supported_input_configs()?.collect();
    let format = negotiate_format(&ranges, audio.sample_rate, audio.channels)?;

    info!(
        "Opening '{}' at {} Hz, {} channel(s), {:?}",
        device_name, format.sample_rate, format.device_channels, format.sample_format
    );

    let config = StreamConfig {
        channels: format.device_channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let frame_samples = samples_per_interval(audio.sample_rate, audio.frame_interval_ms);
    let (sender, frames) = bounded(audio.capture_queue_frames.max(1));
    let failed = Arc::new(AtomicBool::new(false));

    let err_fn = {
        let failed = failed.clone();
        let metrics = metrics.clone();
        move |err: cpal::StreamError| {
            let err = CaptureError::from(err);
            error!("Input stream failed: {}", err);
            failed.store(true, Ordering::Release);
            metrics.record_device_error();
            events.publish(PipelineEvent::from_error(&err, 0));
        }
    };

    let channels = usize::from(format.device_channels);
    let mut chunker = FrameChunker::new(frame_samples, sender, metrics.clone());

    let stream = match format.sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| chunker.push(data, channels, |s| s),
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                chunker.push(data, channels, f32_to_i16)
            },
            err_fn,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                chunker.push(data, channels, u16_to_i16)
            },
            err_fn,
            None,
        )?,
        other => {
            return Err(CaptureError::Device(format!(
                "unsupported sample format: {:?}",
                other
            )));
        }
    };

    Ok(OpenedStream {
        stream,
        frames,
        failed,
        device_name,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::agc::AgcConfig;
    use crate::audio::vad::VadConfig;

    fn chunker(
        frame_samples: usize,
        capacity: usize,
    ) -> (FrameChunker, Receiver<Vec<i16>>, Arc<CaptureMetrics>) {
        let (sender, receiver) = bounded(capacity);
        let metrics = Arc::new(CaptureMetrics::new());
        (FrameChunker::new(frame_samples, sender, metrics.clone()), receiver, metrics)
    }

    #[test]
    fn test_sample_conversion() {
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(1.0), i16::MAX);
        assert_eq!(f32_to_i16(-1.0), i16::MIN);
        assert_eq!(f32_to_i16(2.5), i16::MAX);
        assert_eq!(f32_to_i16(0.5), 16384);
        assert_eq!(u16_to_i16(32768), 0);
        assert_eq!(u16_to_i16(0), i16::MIN);
        assert_eq!(u16_to_i16(u16::MAX), i16::MAX);
    }

    #[test]
    fn test_chunker_emits_fixed_frames() {
        let (mut chunker, receiver, _) = chunker(4, 8);
        chunker.push(&[1i16, 2, 3], 1, |s| s);
        assert!(receiver.try_recv().is_err());
        chunker.push(&[4i16, 5, 6, 7, 8, 9], 1, |s| s);

        assert_eq!(receiver.try_recv().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(receiver.try_recv().unwrap(), vec![5, 6, 7, 8]);
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn test_chunker_downmixes_stereo() {
        let (mut chunker, receiver, _) = chunker(2, 8);
        chunker.push(&[0.5f32, -0.5, 0.25, 0.25], 2, f32_to_i16);
        assert_eq!(receiver.try_recv().unwrap(), vec![0, 8192]);
    }

    #[test]
    fn test_chunker_counts_drops_when_full() {
        let (mut chunker, receiver, metrics) = chunker(2, 1);
        chunker.push(&[1i16, 1, 2, 2, 3, 3], 1, |s| s);
        assert_eq!(metrics.snapshot().frames_dropped_capture, 2);
        assert_eq!(receiver.try_recv().unwrap(), vec![1, 1]);
    }

    #[test]
    fn test_capture_thread_returns_processor() {
        let (sender, receiver) = bounded(16);
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(CaptureMetrics::new());
        let processor = FrameProcessor::new(AgcConfig::default(), VadConfig::default(), 2400)
            .with_metrics(metrics.clone());

        let worker =
            spawn_capture_thread(processor, receiver, running.clone(), metrics.clone()).unwrap();
        for _ in 0..3 {
            sender.send(vec![0i16; 2400]).unwrap();
        }
        drop(sender);

        let processor = worker.join().unwrap();
        assert_eq!(processor.frames_processed(), 3);
        assert_eq!(metrics.snapshot().frames_captured, 3);
    }

    #[test]
    fn test_capture_thread_stops_on_flag() {
        let (sender, receiver) = bounded::<Vec<i16>>(16);
        let running = Arc::new(AtomicBool::new(true));
        let metrics = Arc::new(CaptureMetrics::new());
        let processor = FrameProcessor::new(AgcConfig::default(), VadConfig::default(), 2400);

        sender.send(vec![0i16; 2400]).unwrap();
        sender.send(vec![0i16; 2400]).unwrap();
        running.store(false, Ordering::Release);

        let worker =
            spawn_capture_thread(processor, receiver, running.clone(), metrics.clone()).unwrap();
        let processor = worker.join().unwrap();
        assert_eq!(processor.frames_processed(), 0);
        assert_eq!(metrics.snapshot().frames_dropped_capture, 2);
        drop(sender);
    }

    #[test]
    fn test_negotiation_needs_target_rate() {
        use cpal::SupportedBufferSize;
        let range = |channels, min, max, format| {
            SupportedStreamConfigRange::new(
                channels,
                SampleRate(min),
                SampleRate(max),
                SupportedBufferSize::Unknown,
                format,
            )
        };

        let ranges = vec![
            range(2, 8_000, 48_000, SampleFormat::F32),
            range(1, 8_000, 48_000, SampleFormat::I16),
            range(1, 44_100, 48_000, SampleFormat::I16),
        ];
        let format = negotiate_format(&ranges, 24_000, 1).unwrap();
        assert_eq!(format.sample_format, SampleFormat::I16);
        assert_eq!(format.device_channels, 1);

        let only_stereo_float = vec![range(2, 8_000, 48_000, SampleFormat::F32)];
        let format = negotiate_format(&only_stereo_float, 24_000, 1).unwrap();
        assert_eq!(format.device_channels, 2);
        assert_eq!(format.sample_format, SampleFormat::F32);

        let too_fast = vec![range(1, 44_100, 48_000, SampleFormat::I16)];
        let err = negotiate_format(&too_fast, 24_000, 1).unwrap_err();
        assert_eq!(err.kind(), "device_error");
    }
}
