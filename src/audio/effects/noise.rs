//! Noise suppression hook
//!
//! Model-based denoisers (RNNoise, Ulunas) live outside this crate and
//! plug in through [`DenoiseBackend`]. Algorithms without a registered
//! backend run the built-in [`NoiseFloorExpander`], a lightweight
//! downward expander keyed on the estimated noise floor.

use std::collections::HashMap;

use super::AudioEffect;
use crate::codec::pcm::rms;
use crate::config::NoiseReductionType;

/// A denoiser that can run on interleaved 16-bit buffers
pub trait DenoiseBackend: Send {
    /// Denoise in place; returns the speech probability of the buffer if
    /// the backend estimates one
    fn process(&mut self, samples: &mut [i16], channels: usize) -> Option<f32>;

    fn reset(&mut self);
}

/// Noise floor follows drops quickly and rises slowly (per buffer, dB)
const FLOOR_FALL_COEFF: f32 = 0.5;
const FLOOR_RISE_COEFF: f32 = 0.01;

/// SNR range mapped onto 0..1 speech probability
const SNR_SPEECH_LOW_DB: f32 = 3.0;
const SNR_SPEECH_HIGH_DB: f32 = 15.0;

/// Attenuation applied to buffers with zero speech probability
const MAX_ATTENUATION_DB: f32 = 20.0;

const GAIN_OPEN_COEFF: f32 = 0.6;
const GAIN_CLOSE_COEFF: f32 = 0.2;

const DB_FLOOR: f32 = -120.0;

fn lin_to_db(value: f64) -> f32 {
    if value <= 0.0 {
        DB_FLOOR
    } else {
        (20.0 * value.log10() as f32).max(DB_FLOOR)
    }
}

fn db_to_lin(db: f32) -> f32 {
    10f32.powf(db / 20.0)
}

/// Built-in denoiser: tracks the noise floor, derives a speech
/// probability from the buffer SNR and attenuates low-SNR buffers
#[derive(Debug, Clone)]
pub struct NoiseFloorExpander {
    noise_floor_db: Option<f32>,
    gain: f32,
}

impl NoiseFloorExpander {
    pub fn new() -> Self {
        Self {
            noise_floor_db: None,
            gain: 1.0,
        }
    }

    pub fn noise_floor_db(&self) -> Option<f32> {
        self.noise_floor_db
    }

    fn speech_probability(snr_db: f32) -> f32 {
        ((snr_db - SNR_SPEECH_LOW_DB) / (SNR_SPEECH_HIGH_DB - SNR_SPEECH_LOW_DB)).clamp(0.0, 1.0)
    }
}

impl Default for NoiseFloorExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl DenoiseBackend for NoiseFloorExpander {
    fn process(&mut self, samples: &mut [i16], channels: usize) -> Option<f32> {
        if samples.is_empty() {
            return None;
        }

        let level_db = lin_to_db(rms(samples));
        let floor = match self.noise_floor_db {
            None => level_db,
            Some(floor) if level_db < floor => floor + (level_db - floor) * FLOOR_FALL_COEFF,
            Some(floor) => floor + (level_db - floor) * FLOOR_RISE_COEFF,
        };
        self.noise_floor_db = Some(floor);

        let probability = if level_db <= DB_FLOOR {
            0.0
        } else {
            Self::speech_probability(level_db - floor)
        };

        let target = db_to_lin(-MAX_ATTENUATION_DB * (1.0 - probability));
        let coeff = if target > self.gain {
            GAIN_OPEN_COEFF
        } else {
            GAIN_CLOSE_COEFF
        };
        let start = self.gain;
        let end = start + (target - start) * coeff;

        // ramp per frame to avoid zipper noise
        let channels = channels.max(1);
        let frames = (samples.len() / channels).max(1);
        for (i, frame) in samples.chunks_mut(channels).enumerate() {
            let gain = start + (end - start) * (i + 1) as f32 / frames as f32;
            for sample in frame.iter_mut() {
                *sample = (*sample as f32 * gain) as i16;
            }
        }
        self.gain = end;

        Some(probability)
    }

    fn reset(&mut self) {
        self.noise_floor_db = None;
        self.gain = 1.0;
    }
}

/// Noise suppression stage with a selectable algorithm
pub struct NoiseSuppressor {
    enabled: bool,
    ns_type: NoiseReductionType,
    backends: HashMap<NoiseReductionType, Box<dyn DenoiseBackend>>,
    builtin: NoiseFloorExpander,
    speech_probability: Option<f32>,
}

impl NoiseSuppressor {
    pub fn new() -> Self {
        Self {
            enabled: false,
            ns_type: NoiseReductionType::default(),
            backends: HashMap::new(),
            builtin: NoiseFloorExpander::new(),
            speech_probability: None,
        }
    }

    pub fn configure(&mut self, enabled: bool, ns_type: NoiseReductionType) {
        if ns_type != self.ns_type {
            self.reset();
        }
        self.enabled = enabled;
        self.ns_type = ns_type;
    }

    /// Register an external implementation for an algorithm
    pub fn register_backend(&mut self, ns_type: NoiseReductionType, backend: Box<dyn DenoiseBackend>) {
        self.backends.insert(ns_type, backend);
    }

    /// True when the selected algorithm runs on a registered backend
    pub fn has_backend(&self, ns_type: NoiseReductionType) -> bool {
        self.backends.contains_key(&ns_type)
    }

    /// Speech probability of the last processed buffer, `None` when
    /// disabled or unknown
    pub fn speech_probability(&self) -> Option<f32> {
        self.speech_probability
    }
}

impl Default for NoiseSuppressor {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioEffect for NoiseSuppressor {
    fn process(&mut self, samples: &mut [i16], channels: usize) {
        if !self.enabled {
            self.speech_probability = None;
            return;
        }

        self.speech_probability = match self.backends.get_mut(&self.ns_type) {
            Some(backend) => backend.process(samples, channels),
            None => self.builtin.process(samples, channels),
        };
    }

    fn reset(&mut self) {
        self.speech_probability = None;
        self.builtin.reset();
        for backend in self.backends.values_mut() {
            backend.reset();
        }
    }
}
