//! Lock-free view of the most recent frame for diagnostics.
//!
//! The capture thread stores, readers load. Values are f32 bit patterns in
//! atomics, so a reader may see fields from two adjacent frames but never a
//! torn value.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct MeterCells {
    original_level: AtomicU32,
    processed_level: AtomicU32,
    gain: AtomicU32,
    speech: AtomicBool,
    frames: AtomicU64,
}

#[derive(Clone, Debug)]
pub struct LevelMeter {
    cells: Arc<MeterCells>,
}

/// Point-in-time copy of the meter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MeterSnapshot {
    pub original_level: f32,
    pub processed_level: f32,
    pub gain: f32,
    pub is_speech: bool,
    pub frames: u64,
}

impl LevelMeter {
    pub fn new(initial_gain: f32) -> Self {
        Self {
            cells: Arc::new(MeterCells {
                original_level: AtomicU32::new(0.0f32.to_bits()),
                processed_level: AtomicU32::new(0.0f32.to_bits()),
                gain: AtomicU32::new(initial_gain.to_bits()),
                speech: AtomicBool::new(false),
                frames: AtomicU64::new(0),
            }),
        }
    }

    /// Record one processed frame.
    pub fn record(&self, original_level: f32, processed_level: f32, gain: f32, is_speech: bool) {
        let cells = &self.cells;
        cells.original_level.store(original_level.to_bits(), Ordering::Relaxed);
        cells.processed_level.store(processed_level.to_bits(), Ordering::Relaxed);
        cells.gain.store(gain.to_bits(), Ordering::Relaxed);
        cells.speech.store(is_speech, Ordering::Relaxed);
        cells.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed_level(&self) -> f32 {
        f32::from_bits(self.cells.processed_level.load(Ordering::Relaxed))
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.cells.gain.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let cells = &self.cells;
        MeterSnapshot {
            original_level: f32::from_bits(cells.original_level.load(Ordering::Relaxed)),
            processed_level: self.processed_level(),
            gain: self.gain(),
            is_speech: cells.speech.load(Ordering::Relaxed),
            frames: cells.frames.load(Ordering::Relaxed),
        }
    }
}

impl Default for LevelMeter {
    fn default() -> Self {
        Self::new(1.0)
    }
}
