//! Output sink abstraction
//!
//! The receiver writes 16-bit little-endian PCM into a sink and reads its
//! queued duration back every buffer to steer the resampler.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AudioError;

/// Destination for processed audio
pub trait AudioSink: Send + Sync {
    /// Called when the stream format changes, before the first write in
    /// that format
    fn prepare(&self, _sample_rate: u32, _channels: u8) -> Result<(), AudioError> {
        Ok(())
    }

    /// Queue 16-bit little-endian interleaved samples
    fn write(&self, pcm: &[u8]);

    /// Audio queued but not yet played, in milliseconds. Must not block.
    fn queued_duration_ms(&self) -> u64;

    /// Drop everything queued
    fn flush(&self);
}

/// Sink that keeps every write in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    writes: Mutex<Vec<Vec<u8>>>,
    format: Mutex<Option<(u32, u8)>>,
    queued_ms: AtomicU64,
    flushes: AtomicU64,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the value reported by [`AudioSink::queued_duration_ms`]
    pub fn set_queued_duration_ms(&self, ms: u64) {
        self.queued_ms.store(ms, Ordering::Relaxed);
    }

    /// Copy of every buffer written so far
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.lock().len()
    }

    /// Format from the last `prepare` call
    pub fn format(&self) -> Option<(u32, u8)> {
        *self.format.lock()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }
}

impl AudioSink for MemorySink {
    fn prepare(&self, sample_rate: u32, channels: u8) -> Result<(), AudioError> {
        *self.format.lock() = Some((sample_rate, channels));
        Ok(())
    }

    fn write(&self, pcm: &[u8]) {
        self.writes.lock().push(pcm.to_vec());
    }

    fn queued_duration_ms(&self) -> u64 {
        self.queued_ms.load(Ordering::Relaxed)
    }

    fn flush(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}
