//! Voice activity gate
//!
//! Zeroes whole buffers that do not look like speech. Uses the speech
//! probability from the noise suppressor when one is available and falls
//! back to an RMS heuristic otherwise.

use super::AudioEffect;
use crate::codec::pcm::rms;

/// RMS that counts as speech at full required confidence
const RMS_SPEECH_SCALE: f32 = 0.12;

#[derive(Debug, Clone)]
pub struct VadGate {
    enabled: bool,
    /// Sensitivity 0-100; higher lets more through
    threshold: i32,
    speech_probability: Option<f32>,
    gated_buffers: u64,
}

impl VadGate {
    pub fn new() -> Self {
        Self {
            enabled: false,
            threshold: 10,
            speech_probability: None,
            gated_buffers: 0,
        }
    }

    pub fn configure(&mut self, enabled: bool, threshold: i32) {
        self.enabled = enabled;
        self.threshold = threshold;
    }

    /// Probability for the next buffer, `None` to use the RMS heuristic
    pub fn set_speech_probability(&mut self, probability: Option<f32>) {
        self.speech_probability = probability;
    }

    /// Confidence a buffer must reach to pass
    pub fn required_confidence(&self) -> f32 {
        1.0 - self.threshold.clamp(0, 100) as f32 / 100.0
    }

    /// Buffers muted so far
    pub fn gated_buffers(&self) -> u64 {
        self.gated_buffers
    }

    fn is_speech(&self, samples: &[i16]) -> bool {
        let required = self.required_confidence();
        match self.speech_probability {
            Some(probability) => probability >= required,
            None => rms(samples) as f32 >= required * RMS_SPEECH_SCALE,
        }
    }
}

impl Default for VadGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEffect for VadGate {
    fn process(&mut self, samples: &mut [i16], _channels: usize) {
        if !self.enabled {
            return;
        }

        if !self.is_speech(samples) {
            samples.fill(0);
            self.gated_buffers += 1;
        }
    }

    fn reset(&mut self) {
        self.speech_probability = None;
    }
}
