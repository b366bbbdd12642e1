//! # Mic Relay
//!
//! Relays a live microphone stream from a phone to a desktop over TCP or
//! Bluetooth RFCOMM, cleans it up in real time and keeps playback locked
//! to the capture clock.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────── PHONE (sender) ─────────────────────────────┐
//! │  ┌─────────────┐   ┌──────────────┐   ┌──────────────────────────────┐  │
//! │  │ Microphone  │──▶│ AudioCapture │──▶│ StreamClient                 │  │
//! │  └─────────────┘   └──────────────┘   │ handshake + framed packets   │  │
//! │                                       └──────────────┬───────────────┘  │
//! └──────────────────────────────────────────────────────┼──────────────────┘
//!                      [u32 BE length | bincode Message] │ TCP / RFCOMM
//! ┌──────────────────────────── DESKTOP (receiver) ──────┼──────────────────┐
//! │  ┌───────────────────────────────────────────────────▼───────────────┐  │
//! │  │ AudioServer (network::server) - one session at a time            │  │
//! │  │   Idle → Connecting → Streaming → Connecting ... → Error         │  │
//! │  └───────────────────────────────┬───────────────────────────────────┘  │
//! │                                  ▼                                      │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │ ConnectionHandler (network::handler)                              │  │
//! │  │   reader loop ──▶ AudioPipeline     writer task ◀── mute queue    │  │
//! │  └───────────────────────────────┬───────────────────────────────────┘  │
//! │                                  ▼                                      │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │ AudioPipeline (audio::pipeline)                                   │  │
//! │  │   NS → Dereverb → AGC → Amplify → VAD gate → Resampler            │  │
//! │  └───────────────────────────────┬──────────────────▲────────────────┘  │
//! │                                  ▼                  │ queued ms         │
//! │  ┌───────────────────────────────────────────────────────────────────┐  │
//! │  │ AudioSink (audio::sink / audio::playback)                         │  │
//! │  └───────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod network;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Token written by the audio-producing peer right after connecting
    pub const CLIENT_HANDSHAKE: &[u8; 11] = b"AndroidMic1";

    /// Token the receiving peer answers with
    pub const SERVER_HANDSHAKE: &[u8; 11] = b"AndroidMic2";

    /// Default TCP port for audio streaming
    pub const DEFAULT_PORT: u16 = 6000;

    /// Default HTTP port for the control API
    pub const DEFAULT_CONTROL_PORT: u16 = 8080;

    /// Largest accepted frame body (4 MiB)
    pub const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

    /// Dereverb comb delay in samples (10 ms at 48 kHz)
    pub const DEREVERB_DELAY_SAMPLES: usize = 480;

    /// Output queue depth the resampler steers towards
    pub const TARGET_QUEUED_MS: f64 = 60.0;

    /// Time a new peer gets to complete the handshake
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;

    /// Pause after a failed TCP accept before trying again
    pub const ACCEPT_RETRY_DELAY_MS: u64 = 100;

    /// Pause between Bluetooth service registration attempts
    pub const BLUETOOTH_RETRY_DELAY_MS: u64 = 5000;

    /// Serial Port Profile UUID advertised for RFCOMM
    pub const BLUETOOTH_SERVICE_UUID: &str = "00001101-0000-1000-8000-00805F9B34FB";

    /// Advertised Bluetooth service name
    pub const BLUETOOTH_SERVICE_NAME: &str = "MicRelayServer";

    /// Default sample rate for playback and capture
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Capacity of the outbound control queue per session
    pub const CONTROL_QUEUE_CAPACITY: usize = 32;

    /// Capacity of the capture packet ring buffer (in packets)
    pub const RING_BUFFER_CAPACITY: usize = 256;
}
