//! Per-session audio processing chain
//!
//! Converts a packet's bytes to 16-bit samples, runs the effects in a
//! fixed order and converts back to 16-bit little-endian bytes:
//!
//! ```text
//! decode → NoiseSuppressor → Dereverb → AGC → Amplifier → VAD gate → Resampler → encode
//! ```
//!
//! The VAD gate consumes the speech probability the noise suppressor
//! produced for the same buffer. All buffers are owned by the pipeline
//! and reused from packet to packet.

use tracing::debug;

use crate::audio::effects::{
    Agc, Amplifier, AudioEffect, DenoiseBackend, Dereverb, NoiseSuppressor, VadGate,
};
use crate::audio::resampler::Resampler;
use crate::codec::pcm::{decode_to_i16, encode_i16_le};
use crate::config::{EffectsConfig, NoiseReductionType};
use crate::protocol::AudioFormat;

/// Processing counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub buffers_processed: u64,
    pub buffers_dropped: u64,
    pub buffers_gated: u64,
}

pub struct AudioPipeline {
    config: EffectsConfig,
    noise: NoiseSuppressor,
    dereverb: Dereverb,
    agc: Agc,
    amplifier: Amplifier,
    vad: VadGate,
    resampler: Resampler,
    /// Decoded samples (reused to avoid allocations)
    samples: Vec<i16>,
    /// Encoded output (reused to avoid allocations)
    output: Vec<u8>,
    buffers_processed: u64,
    buffers_dropped: u64,
}

impl AudioPipeline {
    pub fn new(config: EffectsConfig) -> Self {
        let mut pipeline = Self {
            config: EffectsConfig::default(),
            noise: NoiseSuppressor::new(),
            dereverb: Dereverb::new(),
            agc: Agc::new(),
            amplifier: Amplifier::default(),
            vad: VadGate::new(),
            resampler: Resampler::new(),
            samples: Vec::new(),
            output: Vec::new(),
            buffers_processed: 0,
            buffers_dropped: 0,
        };
        pipeline.update_config(config);
        pipeline
    }

    /// Replace every effect parameter at once
    pub fn update_config(&mut self, config: EffectsConfig) {
        self.noise.configure(config.enable_ns, config.ns_type);
        self.dereverb.configure(config.enable_dereverb, config.dereverb_level);
        self.agc.configure(config.enable_agc, config.agc_target_level);
        self.amplifier.set_gain(config.amplification);
        self.vad.configure(config.enable_vad, config.vad_threshold);
        self.config = config;
    }

    pub fn config(&self) -> &EffectsConfig {
        &self.config
    }

    /// Plug an external denoiser in for one algorithm
    pub fn register_denoiser(&mut self, ns_type: NoiseReductionType, backend: Box<dyn DenoiseBackend>) {
        self.noise.register_backend(ns_type, backend);
    }

    /// Process one packet.
    ///
    /// Returns 16-bit little-endian output borrowed from the pipeline, or
    /// `None` when the packet decodes to no samples and is dropped.
    pub fn process(
        &mut self,
        input: &[u8],
        format: AudioFormat,
        channels: usize,
        queued_ms: u64,
    ) -> Option<&[u8]> {
        if channels == 0 || decode_to_i16(input, format, &mut self.samples) == 0 {
            self.buffers_dropped += 1;
            debug!("Dropping empty {:?} buffer ({} bytes)", format, input.len());
            return None;
        }

        self.noise.process(&mut self.samples, channels);
        self.dereverb.process(&mut self.samples, channels);
        self.agc.process(&mut self.samples, channels);
        self.amplifier.process(&mut self.samples, channels);

        self.vad.set_speech_probability(self.noise.speech_probability());
        self.vad.process(&mut self.samples, channels);

        self.resampler.update_playback_ratio(queued_ms);
        let resampled = self.resampler.process(&self.samples, channels);
        encode_i16_le(resampled, &mut self.output);

        self.buffers_processed += 1;
        Some(&self.output)
    }

    /// Clear all per-connection state, keeping allocations
    pub fn reset(&mut self) {
        self.noise.reset();
        self.dereverb.reset();
        self.agc.reset();
        self.amplifier.reset();
        self.vad.reset();
        self.resampler.reset();
        self.samples.clear();
        self.output.clear();
    }

    /// Current AGC gain envelope
    pub fn agc_envelope(&self) -> f32 {
        self.agc.envelope()
    }

    /// Current resampler ratio
    pub fn playback_ratio(&self) -> f64 {
        self.resampler.playback_ratio()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            buffers_processed: self.buffers_processed,
            buffers_dropped: self.buffers_dropped,
            buffers_gated: self.vad.gated_buffers(),
        }
    }
}

impl Default for AudioPipeline {
    fn default() -> Self {
        Self::new(EffectsConfig::default())
    }
}
