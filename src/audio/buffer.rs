//! # Audio Buffers
//!
//! Two storage types used by the capture pipeline:
//!
//! - **AudioBuffer**: one fixed-interval frame of 16-bit mono PCM, convertible to
//!   and from the little-endian byte form the transport carries.
//! - **LevelHistory**: a fixed-capacity ring of recent level measurements. The
//!   capacity is a const generic, so the bound is part of the type and the
//!   controller never has to evict entries by hand.

use crate::error::{AppResult, CaptureError};
use byteorder::{ByteOrder, LittleEndian};

/// One frame of 16-bit signed mono samples.
///
/// Frames are produced by the capture thread, processed, and dropped before the
/// next frame arrives; nothing in the pipeline keeps a reference past the call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AudioBuffer {
    samples: Vec<i16>,
}

impl AudioBuffer {
    /// Wrap already-decoded samples.
    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// A buffer of `len` zero samples (digital silence).
    pub fn silence(len: usize) -> Self {
        Self { samples: vec![0; len] }
    }

    /// Decode little-endian PCM bytes.
    ///
    /// ## Validation:
    /// The byte length must be even; a trailing half-sample means the data is
    /// corrupted or was cut mid-sample.
    pub fn from_le_bytes(data: &[u8]) -> AppResult<Self> {
        if data.len() % 2 != 0 {
            return Err(CaptureError::Validation(format!(
                "Audio data length must be even for 16-bit samples, got {} bytes",
                data.len()
            )));
        }

        let mut samples = vec![0i16; data.len() / 2];
        LittleEndian::read_i16_into(data, &mut samples);
        Ok(Self { samples })
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        pcm_to_le_bytes(&self.samples)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Byte length of the packed form. Always even.
    pub fn byte_len(&self) -> usize {
        self.samples.len() * 2
    }

    /// Duration of the frame in milliseconds at `sample_rate`.
    pub fn duration_ms(&self, sample_rate: u32) -> f64 {
        if sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 * 1000.0 / sample_rate as f64
    }
}

/// Pack samples into little-endian PCM bytes.
pub fn pcm_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = vec![0u8; samples.len() * 2];
    LittleEndian::write_i16_into(samples, &mut out);
    out
}

/// Number of mono samples in one delivery interval.
///
/// ## Example:
/// 24000 Hz * 100 ms / 1000 = 2400 samples (4800 bytes).
pub fn samples_per_interval(sample_rate: u32, interval_ms: u32) -> usize {
    (sample_rate as usize * interval_ms as usize) / 1000
}

/// Fixed-capacity FIFO of level measurements.
///
/// Pushing into a full history overwrites the oldest entry. Storage is an
/// inline array, so pushes never allocate on the capture thread.
#[derive(Debug, Clone)]
pub struct LevelHistory<const CAP: usize> {
    values: [f32; CAP],
    /// Index of the oldest entry
    head: usize,
    len: usize,
}

impl<const CAP: usize> LevelHistory<CAP> {
    pub const CAPACITY: usize = CAP;

    pub fn new() -> Self {
        Self {
            values: [0.0; CAP],
            head: 0,
            len: 0,
        }
    }

    /// Append a value, returning the evicted oldest value when full.
    pub fn push(&mut self, value: f32) -> Option<f32> {
        if CAP == 0 {
            return Some(value);
        }

        if self.len < CAP {
            let idx = (self.head + self.len) % CAP;
            self.values[idx] = value;
            self.len += 1;
            None
        } else {
            let evicted = self.values[self.head];
            self.values[self.head] = value;
            self.head = (self.head + 1) % CAP;
            Some(evicted)
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == CAP
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    /// Arithmetic mean of the stored values, or `None` when empty.
    pub fn mean(&self) -> Option<f32> {
        if self.len == 0 {
            return None;
        }
        let sum: f64 = self.iter().map(f64::from).sum();
        Some((sum / self.len as f64) as f32)
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f32> + '_ {
        (0..self.len).map(move |i| self.values[(self.head + i) % CAP])
    }
}

impl<const CAP: usize> Default for LevelHistory<CAP> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_byte_decoding() {
        let bytes = [0x01, 0x00, 0xff, 0xff, 0x00, 0x80, 0xff, 0x7f];
        let buffer = AudioBuffer::from_le_bytes(&bytes).unwrap();
        assert_eq!(buffer.samples(), &[1, -1, i16::MIN, i16::MAX]);
        assert_eq!(buffer.to_le_bytes(), bytes.to_vec());
        assert_eq!(buffer.byte_len(), 8);
    }

    #[test]
    fn test_odd_length_rejected() {
        let err = AudioBuffer::from_le_bytes(&[0u8; 15]).unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }

    #[test]
    fn test_interval_sizing() {
        assert_eq!(samples_per_interval(24_000, 100), 2400);
        let frame = AudioBuffer::silence(2400);
        assert_eq!(frame.duration_ms(24_000), 100.0);
        assert_eq!(frame.byte_len(), 4800);
    }

    #[test]
    fn test_history_evicts_oldest() {
        let mut history: LevelHistory<3> = LevelHistory::new();
        assert_eq!(history.push(0.1), None);
        assert_eq!(history.push(0.2), None);
        assert_eq!(history.push(0.3), None);
        assert!(history.is_full());

        assert_eq!(history.push(0.4), Some(0.1));
        assert_eq!(history.len(), 3);
        let values: Vec<f32> = history.iter().collect();
        assert_eq!(values, vec![0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_history_mean_and_clear() {
        let mut history: LevelHistory<50> = LevelHistory::new();
        assert_eq!(history.mean(), None);
        for _ in 0..120 {
            history.push(0.25);
        }
        assert_eq!(history.len(), 50);
        assert!((history.mean().unwrap() - 0.25).abs() < 1e-6);

        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.mean(), None);
    }
}
