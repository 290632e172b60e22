//! # Capture Session State
//!
//! Tracks one recognition session from the first `start_voice_recognition`
//! until the transport is torn down. The counters are written by the transmit
//! worker (frames sent) and by the inbound reader (transcription confidence);
//! the capture thread never touches this type.
//!
//! ## Session Lifecycle:
//! 1. **Created**: constructed, nothing sent yet
//! 2. **Active**: the transmit worker announced the session to the service
//! 3. **Closed**: frozen; `close` returns the final snapshot and every later
//!    update is ignored

use crate::error::{AppResult, CaptureError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use uuid::Uuid;

/// Current status of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Active,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Active => "active",
            SessionStatus::Closed => "closed",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ConfidenceStats {
    sum: f64,
    count: u64,
}

/// Per-session counters.
///
/// ## Thread Safety:
/// Counters are atomics. The status lock is held for reading while a counter
/// changes and for writing while the session closes, so nothing lands after
/// the final snapshot is taken.
#[derive(Debug)]
pub struct SessionState {
    session_id: String,
    start_time: DateTime<Utc>,
    status: RwLock<SessionStatus>,
    last_activity: RwLock<DateTime<Utc>>,
    frame_count: AtomicU64,
    successful_send_count: AtomicU64,
    confidence: RwLock<ConfidenceStats>,
    final_snapshot: RwLock<Option<SessionSnapshot>>,
}

/// Read-only copy of the session, safe to hand to reporting code.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub frame_count: u64,
    pub successful_send_count: u64,
    pub average_confidence: Option<f64>,
    pub confidence_samples: u64,
    pub duration_seconds: f64,
}

impl SessionState {
    /// Create a session with a fresh UUID.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(session_id: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            start_time: now,
            status: RwLock::new(SessionStatus::Created),
            last_activity: RwLock::new(now),
            frame_count: AtomicU64::new(0),
            successful_send_count: AtomicU64::new(0),
            confidence: RwLock::new(ConfidenceStats::default()),
            final_snapshot: RwLock::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Created → Active.
    ///
    /// Activating an already active session is a no-op; a closed session
    /// cannot be reopened.
    pub fn activate(&self) -> AppResult<()> {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        match *status {
            SessionStatus::Created => {
                *status = SessionStatus::Active;
                drop(status);
                self.touch();
                Ok(())
            }
            SessionStatus::Active => Ok(()),
            SessionStatus::Closed => Err(CaptureError::Lifecycle(format!(
                "session {} is closed",
                self.session_id
            ))),
        }
    }

    /// Count one frame handed to the transport.
    ///
    /// ## Returns:
    /// `false` if the session is closed and the update was ignored.
    pub fn record_frame_sent(&self, success: bool) -> bool {
        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        if *status == SessionStatus::Closed {
            return false;
        }

        self.frame_count.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_send_count.fetch_add(1, Ordering::Relaxed);
        }
        self.touch();
        true
    }

    /// Fold one transcription confidence into the running average.
    ///
    /// Values are clamped to `[0, 1]`; non-finite values are ignored.
    pub fn record_confidence(&self, confidence: f64) -> bool {
        if !confidence.is_finite() {
            return false;
        }

        let status = self.status.read().unwrap_or_else(PoisonError::into_inner);
        if *status == SessionStatus::Closed {
            return false;
        }

        {
            let mut stats = self.confidence.write().unwrap_or_else(PoisonError::into_inner);
            stats.sum += confidence.clamp(0.0, 1.0);
            stats.count += 1;
        }
        self.touch();
        true
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn successful_send_count(&self) -> u64 {
        self.successful_send_count.load(Ordering::Relaxed)
    }

    /// Mean of all recorded confidences, `None` before the first result.
    pub fn average_confidence(&self) -> Option<f64> {
        let stats = *self.confidence.read().unwrap_or_else(PoisonError::into_inner);
        if stats.count > 0 {
            Some(stats.sum / stats.count as f64)
        } else {
            None
        }
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current view of the session. After `close` this is the frozen snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        if let Some(frozen) = self
            .final_snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            return frozen.clone();
        }
        self.build_snapshot(self.status(), Utc::now())
    }

    /// Freeze the session and return its final snapshot. Idempotent.
    pub fn close(&self) -> SessionSnapshot {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        let mut frozen = self
            .final_snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = frozen.as_ref() {
            return existing.clone();
        }

        *status = SessionStatus::Closed;
        let snapshot = self.build_snapshot(SessionStatus::Closed, Utc::now());
        *frozen = Some(snapshot.clone());
        snapshot
    }

    fn build_snapshot(&self, status: SessionStatus, now: DateTime<Utc>) -> SessionSnapshot {
        let stats = *self.confidence.read().unwrap_or_else(PoisonError::into_inner);
        SessionSnapshot {
            session_id: self.session_id.clone(),
            status,
            start_time: self.start_time,
            last_activity: self.last_activity(),
            frame_count: self.frame_count(),
            successful_send_count: self.successful_send_count(),
            average_confidence: self.average_confidence(),
            confidence_samples: stats.count,
            duration_seconds: now.signed_duration_since(self.start_time).num_milliseconds() as f64
                / 1000.0,
        }
    }

    fn touch(&self) {
        *self.last_activity.write().unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}
