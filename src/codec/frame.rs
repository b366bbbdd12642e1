//! Length-prefixed message framing
//!
//! Layout of one frame:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────────┐
//! │ length (u32, BE)     │ bincode-encoded Message       │
//! └──────────────────────┴──────────────────────────────┘
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::DEFAULT_MAX_FRAME_LEN;
use crate::error::{Error, NetworkError, ProtocolError, Result};
use crate::protocol::Message;

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Serialize a message into a complete frame
pub fn encode_message(message: &Message) -> Result<Bytes> {
    let body = bincode::serialize(message)
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
    frame.put_u32(len);
    frame.put_slice(&body);
    Ok(frame.freeze())
}

/// Deserialize a frame body (without the length prefix).
///
/// Packet contents are not validated here; a bad packet is the
/// receiver's to drop without ending the stream.
pub fn decode_message(body: &[u8]) -> std::result::Result<Message, ProtocolError> {
    bincode::deserialize(body).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Map a short read to a closed stream instead of an I/O failure
fn map_read_error(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetworkError::StreamClosed.into()
    } else {
        e.into()
    }
}

/// Reads frames from a byte stream
pub struct FrameReader<R> {
    inner: R,
    max_frame_len: usize,
    /// Body buffer (reused to avoid allocations)
    body: Vec<u8>,
    frames_read: u64,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_frame_len(inner, DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(inner: R, max_frame_len: usize) -> Self {
        Self {
            inner,
            max_frame_len,
            body: Vec::new(),
            frames_read: 0,
        }
    }

    /// Read the next message.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame
    /// boundary. A stream that ends inside a frame yields
    /// [`NetworkError::StreamClosed`].
    pub async fn read_message(&mut self) -> Result<Option<Message>> {
        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let mut filled = 0;
        while filled < LENGTH_PREFIX_LEN {
            let n = self.inner.read(&mut prefix[filled..]).await.map_err(map_read_error)?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(NetworkError::StreamClosed.into());
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_frame_len {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            }
            .into());
        }

        self.body.resize(len, 0);
        self.inner
            .read_exact(&mut self.body)
            .await
            .map_err(map_read_error)?;

        let message = decode_message(&self.body)?;
        self.frames_read += 1;
        Ok(Some(message))
    }

    /// Frames successfully decoded so far
    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }
}

/// Writes frames to a byte stream
pub struct FrameWriter<W> {
    inner: W,
    frames_written: u64,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            frames_written: 0,
        }
    }

    /// Write one message and flush it
    pub async fn write_message(&mut self, message: &Message) -> Result<()> {
        let frame = encode_message(message)?;
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        self.frames_written += 1;
        Ok(())
    }

    /// Frames written so far
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}
