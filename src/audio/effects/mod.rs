//! Per-buffer voice effects
//!
//! Each effect works in place on interleaved 16-bit samples and owns the
//! state it carries between buffers. The pipeline runs them in a fixed
//! order; see [`crate::audio::pipeline`].

pub mod agc;
pub mod amplifier;
pub mod dereverb;
pub mod noise;
pub mod vad;

pub use agc::Agc;
pub use amplifier::Amplifier;
pub use dereverb::Dereverb;
pub use noise::{DenoiseBackend, NoiseSuppressor};
pub use vad::VadGate;

/// A stateful in-place transform on interleaved samples
pub trait AudioEffect: Send {
    /// Process one buffer in place
    fn process(&mut self, samples: &mut [i16], channels: usize);

    /// Forget everything learned from previous buffers
    fn reset(&mut self);
}
