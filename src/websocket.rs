//! # WebSocket Transport
//!
//! Client side of the streaming channel to the transcription service.
//!
//! ## Message Format:
//! Every message is a JSON text frame with a `type` discriminator.
//! - **Agent → Service**: `start_voice_recognition`, `audio_chunk` (base64 PCM
//!   plus levels and gain), `stop_voice_recognition`, `ping`
//! - **Service → Agent**: `connection_established`, `transcription_result`,
//!   `macro_executed`, `audio_chunk_received`, `recording_started`,
//!   `recording_stopped`, `error`, `pong`. Anything else is tolerated and
//!   logged as unknown.
//!
//! ## Connection Handling:
//! `connect` performs a single handshake. The socket is split: the write half
//! becomes a [`FrameSink`] for the transmit worker, the read half is driven by
//! [`spawn_inbound_reader`], which feeds transcription confidences into the
//! session and forwards every event to the caller.

use crate::audio::session::SessionState;
use crate::audio::transmitter::FrameSink;
use crate::error::{AppResult, CaptureError};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Messages sent by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// Announces a new recognition session
    #[serde(rename = "start_voice_recognition")]
    StartVoiceRecognition {
        session_id: String,
    },

    /// One processed frame that passed voice activity detection
    #[serde(rename = "audio_chunk")]
    AudioChunk {
        /// Base64 of the little-endian 16-bit PCM bytes
        audio: String,
        /// Level after amplification
        audio_level: f32,
        /// Level before amplification
        original_level: f32,
        gain_applied: f32,
        has_voice: bool,
    },

    /// Ends the recognition session
    #[serde(rename = "stop_voice_recognition")]
    StopVoiceRecognition {
        session_id: String,
    },

    /// Heartbeat
    #[serde(rename = "ping")]
    Ping {
        timestamp: String,
    },
}

impl OutboundEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            OutboundEvent::StartVoiceRecognition { .. } => "start_voice_recognition",
            OutboundEvent::AudioChunk { .. } => "audio_chunk",
            OutboundEvent::StopVoiceRecognition { .. } => "stop_voice_recognition",
            OutboundEvent::Ping { .. } => "ping",
        }
    }
}

/// Messages received from the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundEvent {
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        server_time: Option<String>,
        #[serde(default)]
        features: Vec<String>,
    },

    /// Result of transcribing recently sent audio
    #[serde(rename = "transcription_result")]
    TranscriptionResult {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        confidence: f64,
        #[serde(default)]
        timestamp: Option<String>,
        #[serde(default)]
        success: bool,
    },

    /// A voice command matched and ran on the service side
    #[serde(rename = "macro_executed")]
    MacroExecuted {
        #[serde(flatten)]
        details: serde_json::Map<String, serde_json::Value>,
    },

    /// Acknowledgement of an `audio_chunk`
    #[serde(rename = "audio_chunk_received")]
    AudioChunkReceived {
        #[serde(default)]
        success: bool,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        audio_level: Option<f32>,
        #[serde(default)]
        audio_length: Option<u64>,
    },

    #[serde(rename = "recording_started")]
    RecordingStarted {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "recording_stopped")]
    RecordingStopped {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        #[serde(default)]
        timestamp: Option<String>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default)]
        timestamp: Option<String>,
    },

    /// Any other `type`
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    pub fn parse(text: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Write half of the socket.
pub struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send(&mut self, event: OutboundEvent) -> AppResult<()> {
        let json = serde_json::to_string(&event).map_err(|e| {
            CaptureError::Transport(format!("failed to encode {}: {}", event.type_name(), e))
        })?;
        self.sink.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn close(&mut self) -> AppResult<()> {
        self.sink.close().await?;
        Ok(())
    }
}

/// Read half of the socket, handed to [`spawn_inbound_reader`].
pub struct WebSocketSource {
    stream: SplitStream<WsStream>,
}

/// Open the connection to the transcription service.
///
/// ## Parameters:
/// - **url**: `ws://` or `wss://` endpoint
///
/// ## Returns:
/// The write half as a sink and the read half for the inbound reader. Fails
/// with a transport error if the handshake does not complete; there is no retry.
pub async fn connect(url: &str) -> AppResult<(WebSocketSink, WebSocketSource)> {
    info!("Connecting to transcription service at {}", url);

    let (stream, response) = connect_async(url)
        .await
        .map_err(|e| CaptureError::Transport(format!("failed to connect to {}: {}", url, e)))?;

    debug!("WebSocket handshake completed with status {}", response.status());

    let (sink, stream) = stream.split();
    Ok((WebSocketSink { sink }, WebSocketSource { stream }))
}

/// Inbound handling shared by the socket reader and tests.
///
/// Successful transcription results feed their confidence into the session.
/// Results under `confidence_threshold` are still counted, only flagged in the logs.
pub fn handle_inbound(event: &InboundEvent, session: &SessionState, confidence_threshold: f64) {
    match event {
        InboundEvent::TranscriptionResult {
            transcript,
            confidence,
            success,
            ..
        } => {
            if !*success {
                debug!("Transcription failed on the service side");
                return;
            }
            session.record_confidence(*confidence);
            if *confidence < confidence_threshold {
                warn!(
                    "Low confidence transcription ({:.2} < {:.2}): {}",
                    confidence, confidence_threshold, transcript
                );
            } else {
                info!("Transcription ({:.2}): {}", confidence, transcript);
            }
        }
        InboundEvent::ConnectionEstablished { client_id, features, .. } => {
            info!(
                "Service acknowledged connection (client_id: {:?}, features: {:?})",
                client_id, features
            );
        }
        InboundEvent::MacroExecuted { details } => {
            info!("Macro executed: {}", serde_json::Value::Object(details.clone()));
        }
        InboundEvent::AudioChunkReceived { success: false, reason, .. } => {
            debug!("Service rejected audio chunk: {:?}", reason);
        }
        InboundEvent::Error { message, .. } => {
            warn!("Service reported an error: {}", message);
        }
        InboundEvent::Unknown => {
            debug!("Ignoring inbound message of unknown type");
        }
        _ => {}
    }
}

/// Drive the read half until the socket closes or `cancel` fires.
///
/// Every parsed event is forwarded on `forward` after the session has seen it.
/// A slow or absent consumer never stalls the socket: forwarding uses
/// `try_send` and drops the event when the channel is full or closed.
pub fn spawn_inbound_reader(
    source: WebSocketSource,
    session: Arc<SessionState>,
    confidence_threshold: f64,
    forward: mpsc::Sender<InboundEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut stream = source.stream;

    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = stream.next() => message,
            };

            let text = match message {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    info!("Transcription service closed the connection: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    warn!("WebSocket read error: {}", e);
                    break;
                }
                None => break,
            };

            match InboundEvent::parse(&text) {
                Ok(event) => {
                    handle_inbound(&event, &session, confidence_threshold);
                    if forward.try_send(event).is_err() {
                        debug!("Inbound event dropped, no consumer capacity");
                    }
                }
                Err(e) => warn!("Malformed inbound message: {}", e),
            }
        }
        debug!("Inbound reader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audio_chunk_wire_format() {
        let event = OutboundEvent::AudioChunk {
            audio: "AAA=".to_string(),
            audio_level: 0.5,
            original_level: 0.25,
            gain_applied: 2.0,
            has_voice: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "audio_chunk",
                "audio": "AAA=",
                "audio_level": 0.5,
                "original_level": 0.25,
                "gain_applied": 2.0,
                "has_voice": true
            })
        );
    }

    #[test]
    fn test_control_messages() {
        let value = serde_json::to_value(OutboundEvent::StartVoiceRecognition {
            session_id: "s1".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"type": "start_voice_recognition", "session_id": "s1"}));
    }

    #[test]
    fn test_parse_transcription_result() {
        let event = InboundEvent::parse(
            r#"{"type":"transcription_result","transcript":"open file","confidence":0.92,"timestamp":"2024-01-01T00:00:00","success":true}"#,
        )
        .unwrap();
        match event {
            InboundEvent::TranscriptionResult { transcript, confidence, success, .. } => {
                assert_eq!(transcript, "open file");
                assert_eq!(confidence, 0.92);
                assert!(success);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_tolerates_unknown_and_partial_messages() {
        assert_eq!(
            InboundEvent::parse(r#"{"type":"macros_list","macros":[]}"#).unwrap(),
            InboundEvent::Unknown
        );
        let ack = InboundEvent::parse(
            r#"{"type":"audio_chunk_received","success":false,"reason":"too_short","audio_length":12}"#,
        )
        .unwrap();
        assert!(matches!(
            ack,
            InboundEvent::AudioChunkReceived {
                success: false,
                audio_level: None,
                ..
            }
        ));

        let executed =
            InboundEvent::parse(r#"{"type":"macro_executed","macro_name":"save"}"#).unwrap();
        match executed {
            InboundEvent::MacroExecuted { details } => assert_eq!(details["macro_name"], "save"),
            other => panic!("unexpected event {:?}", other),
        }

        assert!(InboundEvent::parse("not json").is_err());
    }

    #[test]
    fn test_handle_inbound_updates_confidence() {
        let session = SessionState::new();
        let result = |confidence: f64, success: bool| InboundEvent::TranscriptionResult {
            transcript: "hello".to_string(),
            confidence,
            timestamp: None,
            success,
        };

        handle_inbound(&result(0.9, true), &session, 0.7);
        handle_inbound(&result(0.5, true), &session, 0.7);
        handle_inbound(&result(0.1, false), &session, 0.7);
        handle_inbound(&InboundEvent::Unknown, &session, 0.7);

        assert!((session.average_confidence().unwrap() - 0.7).abs() < 1e-9);
    }
}
