//! Linear gain

use super::AudioEffect;
use crate::codec::pcm::clamp_i16;

/// Multiply-and-clamp; no state
#[derive(Debug, Clone)]
pub struct Amplifier {
    gain: f32,
}

impl Amplifier {
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for Amplifier {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl AudioEffect for Amplifier {
    fn process(&mut self, samples: &mut [i16], _channels: usize) {
        if self.gain == 1.0 {
            return;
        }
        for sample in samples.iter_mut() {
            *sample = clamp_i16((*sample as f32 * self.gain) as i32);
        }
    }

    fn reset(&mut self) {}
}
