//! # Frame Transmitter
//!
//! Moves speech frames from the capture thread to the transcription service
//! without ever blocking capture.
//!
//! ## Flow:
//! 1. The capture thread calls [`FrameQueue::send`]. Non-speech frames are
//!    discarded there; speech frames are pushed with `try_send` into a bounded
//!    queue (a full queue drops the frame and counts it).
//! 2. One tokio task drains the queue in order, base64-encodes each frame and
//!    hands an `audio_chunk` to the [`FrameSink`].
//! 3. The task opens the session with `start_voice_recognition` and closes it
//!    with `stop_voice_recognition`.
//!
//! ## Stop Semantics:
//! Stopping cancels the worker. A send still waiting on the sink is abandoned,
//! every frame not yet handed over is dropped and counted, and the sink is
//! handed back to the caller. `stop_voice_recognition` gets
//! [`SHUTDOWN_SEND_TIMEOUT`] to go out, so a stalled socket cannot hold up
//! shutdown.

use super::buffer::pcm_to_le_bytes;
use super::events::{EventPublisher, PipelineEvent};
use super::metrics::CaptureMetrics;
use super::session::SessionState;
use crate::error::{AppResult, CaptureError};
use crate::websocket::OutboundEvent;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound on each message sent while shutting down.
pub const SHUTDOWN_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Destination for outbound protocol messages.
///
/// Implemented by the WebSocket write half; tests use in-memory sinks.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, event: OutboundEvent) -> AppResult<()>;

    /// Release the underlying transport. Default: nothing to release.
    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// One speech frame waiting to be sent.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub sequence: u64,
    /// Little-endian 16-bit PCM
    pub pcm: Vec<u8>,
    pub processed_level: f32,
    pub original_level: f32,
    pub gain_applied: f32,
}

impl OutboundFrame {
    pub fn into_event(self) -> OutboundEvent {
        OutboundEvent::AudioChunk {
            audio: BASE64.encode(&self.pcm),
            audio_level: self.processed_level,
            original_level: self.original_level,
            gain_applied: self.gain_applied,
            has_voice: true,
        }
    }
}

/// Producer side used by the capture thread. Cheap to clone.
#[derive(Debug, Clone)]
pub struct FrameQueue {
    sender: mpsc::Sender<OutboundFrame>,
    metrics: Arc<CaptureMetrics>,
}

impl FrameQueue {
    /// Offer a processed frame for transmission.
    ///
    /// ## Parameters:
    /// - **processed**: the amplified frame
    /// - **post_level** / **pre_level**: levels after and before amplification
    /// - **gain**: the gain that was applied
    /// - **is_speech**: VAD decision; non-speech frames are never sent
    ///
    /// ## Returns:
    /// - **Ok(true)**: queued
    /// - **Ok(false)**: not speech, nothing to do
    /// - **Err(Transport)**: queue full or closed; the frame is dropped
    pub fn send(
        &self,
        sequence: u64,
        processed: &[i16],
        post_level: f32,
        pre_level: f32,
        gain: f32,
        is_speech: bool,
    ) -> AppResult<bool> {
        if !is_speech {
            return Ok(false);
        }

        let frame = OutboundFrame {
            sequence,
            pcm: pcm_to_le_bytes(processed),
            processed_level: post_level,
            original_level: pre_level,
            gain_applied: gain,
        };

        match self.sender.try_send(frame) {
            Ok(()) => {
                self.metrics.record_queued();
                Ok(true)
            }
            Err(TrySendError::Full(frame)) => {
                self.metrics.record_transmit_drops(1);
                Err(CaptureError::Transport(format!(
                    "transmit queue full, dropped frame {}",
                    frame.sequence
                )))
            }
            Err(TrySendError::Closed(frame)) => {
                self.metrics.record_transmit_drops(1);
                Err(CaptureError::Transport(format!(
                    "transmitter stopped, dropped frame {}",
                    frame.sequence
                )))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Handle to the running transmit worker.
pub struct FrameTransmitter {
    queue: FrameQueue,
    cancel: CancellationToken,
    worker: JoinHandle<Box<dyn FrameSink>>,
    session: Arc<SessionState>,
}

impl FrameTransmitter {
    /// Spawn the worker on the current tokio runtime.
    ///
    /// ## Parameters:
    /// - **sink**: where messages go
    /// - **capacity**: bounded queue size in frames
    /// - **session**: counters updated after each send
    pub fn spawn(
        sink: Box<dyn FrameSink>,
        capacity: usize,
        session: Arc<SessionState>,
        metrics: Arc<CaptureMetrics>,
        events: EventPublisher,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            sink,
            receiver,
            cancel.clone(),
            session.clone(),
            metrics.clone(),
            events,
        ));

        Self {
            queue: FrameQueue { sender, metrics },
            cancel,
            worker,
            session,
        }
    }

    /// Producer handle for the capture thread.
    pub fn queue(&self) -> FrameQueue {
        self.queue.clone()
    }

    pub fn session(&self) -> &Arc<SessionState> {
        &self.session
    }

    /// Cancel the worker, drop queued frames and recover the sink.
    pub async fn stop(self) -> AppResult<Box<dyn FrameSink>> {
        self.cancel.cancel();
        drop(self.queue);
        self.worker
            .await
            .map_err(|e| CaptureError::Transport(format!("transmit worker failed: {}", e)))
    }
}

async fn run_worker(
    mut sink: Box<dyn FrameSink>,
    mut receiver: mpsc::Receiver<OutboundFrame>,
    cancel: CancellationToken,
    session: Arc<SessionState>,
    metrics: Arc<CaptureMetrics>,
    events: EventPublisher,
) -> Box<dyn FrameSink> {
    let session_id = session.session_id().to_string();

    let start = OutboundEvent::StartVoiceRecognition {
        session_id: session_id.clone(),
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        result = sink.send(start) => {
            if let Err(e) = result {
                report_transport_error(&e, &metrics, &events);
            }
        }
    }
    if let Err(e) = session.activate() {
        warn!("Transmit worker started on an inactive session: {}", e);
    }
    info!("Transmitter started for session {}", session_id);

    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = receiver.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let sequence = frame.sequence;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                metrics.record_transmit_drops(1);
                debug!("Abandoned frame {} stalled in the sink", sequence);
                break;
            }
            result = sink.send(frame.into_event()) => result,
        };
        match result {
            Ok(()) => {
                session.record_frame_sent(true);
                debug!("Sent frame {}", sequence);
            }
            Err(e) => {
                session.record_frame_sent(false);
                metrics.record_transmit_drops(1);
                report_transport_error(&e, &metrics, &events);
            }
        }
    }

    receiver.close();
    let mut dropped = 0u64;
    while receiver.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        metrics.record_transmit_drops(dropped);
        debug!("Dropped {} queued frames on stop", dropped);
    }

    let stop = OutboundEvent::StopVoiceRecognition {
        session_id: session_id.clone(),
    };
    match tokio::time::timeout(SHUTDOWN_SEND_TIMEOUT, sink.send(stop)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => report_transport_error(&e, &metrics, &events),
        Err(_) => {
            let e = CaptureError::Transport(format!(
                "stop_voice_recognition not sent within {:?}",
                SHUTDOWN_SEND_TIMEOUT
            ));
            report_transport_error(&e, &metrics, &events);
        }
    }
    info!("Transmitter stopped for session {}", session_id);

    sink
}

fn report_transport_error(err: &CaptureError, metrics: &CaptureMetrics, events: &EventPublisher) {
    warn!("Transport error: {}", err);
    metrics.record_transport_error();
    events.publish(PipelineEvent::from_error(err, 0));
}
