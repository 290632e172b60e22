//! # Pipeline Events
//!
//! One-way channel from the capture thread to whoever wants to observe the
//! pipeline (status display, the run loop's device-refresh logic, tests).
//!
//! ## Key Properties:
//! - **Bounded**: the channel has a fixed capacity chosen at construction
//! - **Never blocks the producer**: `publish` uses `try_send`; when the channel
//!   is full the event is discarded and counted
//! - **Optional consumer**: if the receiver is dropped, publishing is a no-op

use super::vad::VadDecision;
use crate::error::CaptureError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Per-frame summary published after the pipeline ran.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    /// Monotonic frame number within one capture run, starting at 1
    pub sequence: u64,
    pub original_level: f32,
    pub processed_level: f32,
    pub gain_applied: f32,
    pub vad: VadDecision,
    /// Whether the frame was accepted by the transmit queue
    pub queued: bool,
}

/// Something the capture pipeline wants the outside world to know.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    Frame(FrameReport),
    /// A frame failed processing and was passed through raw
    ProcessingError { sequence: u64, message: String },
    /// The device failed; `recoverable` means a refresh may bring it back
    DeviceError { message: String, recoverable: bool },
    /// The transmit path rejected a frame or the sink failed
    TransportError { message: String },
}

impl PipelineEvent {
    /// Build the matching error event for a `CaptureError`.
    pub fn from_error(err: &CaptureError, sequence: u64) -> Self {
        match err {
            CaptureError::Processing(_) | CaptureError::Validation(_) => {
                PipelineEvent::ProcessingError {
                    sequence,
                    message: err.to_string(),
                }
            }
            CaptureError::Transport(_) => PipelineEvent::TransportError {
                message: err.to_string(),
            },
            _ => PipelineEvent::DeviceError {
                message: err.to_string(),
                recoverable: err.is_recoverable(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, PipelineEvent::Frame(_))
    }
}

/// Producer half. Cheap to clone; every clone shares the drop counter.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: Option<Sender<PipelineEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventPublisher {
    /// A publisher with no consumer. Every event is discarded silently.
    pub fn disabled() -> Self {
        Self {
            sender: None,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Offer an event without blocking.
    ///
    /// ## Returns:
    /// `true` if the event was enqueued.
    pub fn publish(&self, event: PipelineEvent) -> bool {
        let Some(sender) = &self.sender else {
            return false;
        };

        match sender.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Events discarded because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Create a bounded event channel.
pub fn event_channel(capacity: usize) -> (EventPublisher, Receiver<PipelineEvent>) {
    let (sender, receiver) = bounded(capacity.max(1));
    (
        EventPublisher {
            sender: Some(sender),
            dropped: Arc::new(AtomicU64::new(0)),
        },
        receiver,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_event(msg: &str) -> PipelineEvent {
        PipelineEvent::TransportError { message: msg.to_string() }
    }

    #[test]
    fn test_full_channel_counts_drops() {
        let (publisher, receiver) = event_channel(2);
        assert!(publisher.publish(error_event("a")));
        assert!(publisher.publish(error_event("b")));
        assert!(!publisher.publish(error_event("c")));
        assert_eq!(publisher.dropped(), 1);

        assert_eq!(receiver.try_iter().count(), 2);
        assert!(publisher.publish(error_event("d")));
    }

    #[test]
    fn test_dropped_receiver_is_not_an_error() {
        let (publisher, receiver) = event_channel(1);
        drop(receiver);
        assert!(!publisher.publish(error_event("gone")));
        assert_eq!(publisher.dropped(), 0);
        assert!(!EventPublisher::disabled().publish(error_event("none")));
    }

    #[test]
    fn test_error_mapping() {
        let event = PipelineEvent::from_error(&CaptureError::Processing("nan".into()), 7);
        assert!(matches!(event, PipelineEvent::ProcessingError { sequence: 7, .. }));

        let event = PipelineEvent::from_error(&CaptureError::Stream("unplugged".into()), 0);
        assert!(matches!(event, PipelineEvent::DeviceError { recoverable: true, .. }));

        let event = PipelineEvent::from_error(&CaptureError::Device("no device".into()), 0);
        assert!(matches!(event, PipelineEvent::DeviceError { recoverable: false, .. }));
        assert!(event.is_error());
    }

    #[test]
    fn test_events_serialize_with_type_tag() {
        let json = serde_json::to_value(error_event("closed")).unwrap();
        assert_eq!(json["type"], "transport_error");
        assert_eq!(json["message"], "closed");
    }
}
