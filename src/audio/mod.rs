//! Audio subsystem: effects, drift compensation, sinks and capture

pub mod buffer;
pub mod capture;
pub mod effects;
pub mod pipeline;
pub mod playback;
pub mod resampler;
pub mod sink;

pub use buffer::{create_shared_queue, PacketQueue, SharedPacketQueue};
pub use capture::AudioCapture;
pub use pipeline::{AudioPipeline, PipelineStats};
pub use playback::CpalSink;
pub use resampler::Resampler;
pub use sink::{AudioSink, MemorySink};
