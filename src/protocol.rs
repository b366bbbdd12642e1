//! Wire-level message types shared by the sender and the receiver
//!
//! Every frame on the socket carries one [`Message`]: either an audio
//! buffer or a mute-state change. Both travel inside the same envelope so
//! readers can handle them interleaved in any order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::ConnectionMode;
use crate::error::ProtocolError;

/// PCM sample encoding of an [`AudioPacket`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioFormat {
    /// 8-bit unsigned, centered at 128
    Pcm8,
    /// 16-bit signed little-endian
    Pcm16,
    /// 32-bit float little-endian
    PcmFloat32,
}

impl AudioFormat {
    /// Size of one sample in bytes
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::Pcm8 => 1,
            AudioFormat::Pcm16 => 2,
            AudioFormat::PcmFloat32 => 4,
        }
    }

    /// Bit-depth code used by capture devices (8, 16 or 32)
    pub fn code(self) -> u8 {
        match self {
            AudioFormat::Pcm8 => 8,
            AudioFormat::Pcm16 => 16,
            AudioFormat::PcmFloat32 => 32,
        }
    }

    /// Parse a bit-depth code
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            8 => Some(AudioFormat::Pcm8),
            16 => Some(AudioFormat::Pcm16),
            32 => Some(AudioFormat::PcmFloat32),
            _ => None,
        }
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        AudioFormat::Pcm16
    }
}

/// One native capture buffer plus the format needed to interpret it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPacket {
    pub buffer: Vec<u8>,
    pub sample_rate: u32,
    pub channel_count: u8,
    pub format: AudioFormat,
}

impl AudioPacket {
    pub fn new(buffer: Vec<u8>, sample_rate: u32, channel_count: u8, format: AudioFormat) -> Self {
        Self {
            buffer,
            sample_rate,
            channel_count,
            format,
        }
    }

    /// Reject packets that cannot be played back
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if !(1..=2).contains(&self.channel_count) {
            return Err(ProtocolError::InvalidChannelCount(self.channel_count));
        }
        Ok(())
    }

    /// Number of frames (samples per channel) carried by the packet
    pub fn frames(&self) -> usize {
        let per_frame = self.format.bytes_per_sample() * self.channel_count.max(1) as usize;
        self.buffer.len() / per_frame
    }

    /// Duration of the packet in milliseconds
    pub fn duration_ms(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 * 1000.0 / self.sample_rate as f64
    }
}

/// Sideband mute notification, last write wins on the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteState {
    pub muted: bool,
}

/// Envelope for everything that travels after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Audio(AudioPacket),
    Mute(MuteState),
}

/// Listener lifecycle as observed by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Error,
}

impl Default for StreamState {
    fn default() -> Self {
        StreamState::Idle
    }
}

/// Point-in-time view of the server for the control API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub state: StreamState,
    pub last_error: Option<String>,
    pub mode: Option<ConnectionMode>,
    pub port: Option<u16>,
    pub session_id: Option<Uuid>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub packets_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_codes() {
        for format in [AudioFormat::Pcm8, AudioFormat::Pcm16, AudioFormat::PcmFloat32] {
            assert_eq!(AudioFormat::from_code(format.code()), Some(format));
        }
        assert_eq!(AudioFormat::from_code(24), None);
    }

    #[test]
    fn test_packet_validation() {
        let packet = AudioPacket::new(vec![0; 8], 48000, 2, AudioFormat::Pcm16);
        assert!(packet.validate().is_ok());

        let packet = AudioPacket::new(vec![0; 8], 48000, 3, AudioFormat::Pcm16);
        assert!(matches!(
            packet.validate(),
            Err(ProtocolError::InvalidChannelCount(3))
        ));
    }

    #[test]
    fn test_packet_duration() {
        // 480 stereo 16-bit frames at 48 kHz = 10 ms
        let packet = AudioPacket::new(vec![0; 480 * 2 * 2], 48000, 2, AudioFormat::Pcm16);
        assert_eq!(packet.frames(), 480);
        assert!((packet.duration_ms() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_state_serializes_lowercase() {
        let json = serde_json::to_string(&StreamState::Streaming).unwrap();
        assert_eq!(json, "\"streaming\"");
    }
}
