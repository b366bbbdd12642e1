//! Comb-filter echo subtraction
//!
//! Subtracts a scaled copy of the signal from one delay period ago.
//! The delay is a fixed sample count, so its duration scales with the
//! stream's sample rate (10 ms at 48 kHz, 20 ms at 24 kHz).

use super::AudioEffect;
use crate::codec::pcm::clamp_i16;
use crate::constants::DEREVERB_DELAY_SAMPLES;

/// Per-channel delay-line subtraction, mono and stereo only
#[derive(Debug, Clone)]
pub struct Dereverb {
    enabled: bool,
    level: f32,
    delay: usize,
    /// One ring buffer per channel, allocated on first use
    lines: [Vec<i32>; 2],
    index: usize,
    last_channels: Option<usize>,
}

impl Dereverb {
    pub fn new() -> Self {
        Self::with_delay(DEREVERB_DELAY_SAMPLES)
    }

    pub fn with_delay(delay: usize) -> Self {
        Self {
            enabled: false,
            level: 0.5,
            delay: delay.max(1),
            lines: [Vec::new(), Vec::new()],
            index: 0,
            last_channels: None,
        }
    }

    pub fn configure(&mut self, enabled: bool, level: f32) {
        self.enabled = enabled;
        self.level = level;
    }

    pub fn delay(&self) -> usize {
        self.delay
    }
}

impl Default for Dereverb {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEffect for Dereverb {
    fn process(&mut self, samples: &mut [i16], channels: usize) {
        if !self.enabled || self.level <= 0.0 || channels == 0 || channels > 2 {
            return;
        }

        if self.last_channels != Some(channels) {
            self.last_channels = Some(channels);
            self.reset();
        }

        for line in self.lines.iter_mut().take(channels) {
            if line.len() != self.delay {
                line.resize(self.delay, 0);
            }
        }

        for frame in samples.chunks_exact_mut(channels) {
            for (c, sample) in frame.iter_mut().enumerate() {
                let line = &mut self.lines[c];
                let delayed = line[self.index];
                let current = *sample as i32;
                line[self.index] = current;
                *sample = clamp_i16(current - (delayed as f32 * self.level) as i32);
            }
            self.index += 1;
            if self.index >= self.delay {
                self.index = 0;
            }
        }
    }

    fn reset(&mut self) {
        for line in &mut self.lines {
            line.iter_mut().for_each(|v| *v = 0);
        }
        self.index = 0;
    }
}
