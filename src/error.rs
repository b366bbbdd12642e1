//! Error types for the microphone relay

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the peer hung up (EOF or a short read) rather than
    /// violating the protocol.
    pub fn is_stream_closed(&self) -> bool {
        match self {
            Error::Network(NetworkError::StreamClosed) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Handshake token mismatch")]
    HandshakeMismatch,

    #[error("Handshake truncated after {received} bytes")]
    HandshakeTruncated { received: usize },

    #[error("Frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Invalid channel count: {0}")]
    InvalidChannelCount(u8),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Stream closed by peer")]
    StreamClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_closed_classification() {
        assert!(Error::from(NetworkError::StreamClosed).is_stream_closed());

        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(Error::from(eof).is_stream_closed());

        assert!(!Error::from(ProtocolError::HandshakeMismatch).is_stream_closed());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::from(ProtocolError::FrameTooLarge { len: 10, max: 4 });
        assert_eq!(
            err.to_string(),
            "Protocol error: Frame of 10 bytes exceeds the 4 byte limit"
        );
    }
}
