//! Automatic gain control
//!
//! Tracks a smoothed gain envelope towards `target / rms`. Gain drops
//! quickly on loud input and rises slowly on quiet input; during silence
//! the envelope drifts back to unity so it cannot run away.

use super::AudioEffect;
use crate::codec::pcm::{clamp_i16, rms};

/// Below this normalized RMS a buffer counts as silence
const SILENCE_RMS: f64 = 0.001;

const ATTACK_SMOOTHING: f32 = 0.005;
const RELEASE_SMOOTHING: f32 = 0.01;
const SILENCE_DECAY: f32 = 0.999;

const MIN_DESIRED_GAIN: f32 = 0.5;
const MAX_DESIRED_GAIN: f32 = 5.0;
const MIN_APPLIED_GAIN: f32 = 0.8;
const MAX_APPLIED_GAIN: f32 = 5.0;

#[derive(Debug, Clone)]
pub struct Agc {
    enabled: bool,
    /// Target RMS on the 16-bit scale
    target_level: i32,
    /// Zero until the first non-silent buffer
    envelope: f32,
}

impl Agc {
    pub fn new() -> Self {
        Self {
            enabled: false,
            target_level: 32000,
            envelope: 0.0,
        }
    }

    pub fn configure(&mut self, enabled: bool, target_level: i32) {
        self.enabled = enabled;
        self.target_level = target_level;
    }

    /// Current smoothed gain (before the final clamp)
    pub fn envelope(&self) -> f32 {
        self.envelope
    }

    fn update_envelope(&mut self, rms: f64) {
        if rms > SILENCE_RMS {
            let target_rms = (self.target_level as f64 / 32768.0).clamp(0.01, 0.9);
            let desired = ((target_rms / (rms + 1e-6)) as f32).clamp(MIN_DESIRED_GAIN, MAX_DESIRED_GAIN);

            if self.envelope == 0.0 {
                self.envelope = 1.0;
            }

            let smoothing = if desired < self.envelope {
                ATTACK_SMOOTHING
            } else {
                RELEASE_SMOOTHING
            };
            self.envelope = self.envelope * (1.0 - smoothing) + desired * smoothing;
        } else {
            self.envelope = self.envelope * SILENCE_DECAY + (1.0 - SILENCE_DECAY);
        }
    }
}

impl Default for Agc {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEffect for Agc {
    fn process(&mut self, samples: &mut [i16], _channels: usize) {
        if !self.enabled || self.target_level <= 0 {
            return;
        }

        self.update_envelope(rms(samples));

        let gain = self.envelope.clamp(MIN_APPLIED_GAIN, MAX_APPLIED_GAIN);
        for sample in samples.iter_mut() {
            *sample = clamp_i16((*sample as f32 * gain) as i32);
        }
    }

    fn reset(&mut self) {
        self.envelope = 0.0;
    }
}
