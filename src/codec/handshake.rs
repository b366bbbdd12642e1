//! Connection handshake
//!
//! The audio-producing peer writes [`CLIENT_HANDSHAKE`]; the receiver
//! checks it and answers with [`SERVER_HANDSHAKE`], which the producer
//! checks in turn. Any mismatch or short read aborts the connection.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::{CLIENT_HANDSHAKE, SERVER_HANDSHAKE};
use crate::error::{ProtocolError, Result};

/// Read exactly `expected.len()` bytes and compare them.
///
/// Stops reading as soon as the stream ends; nothing past the token is
/// consumed.
async fn expect_token<R: AsyncRead + Unpin>(reader: &mut R, expected: &[u8]) -> Result<()> {
    let mut received = vec![0u8; expected.len()];
    let mut filled = 0;
    while filled < received.len() {
        let n = reader.read(&mut received[filled..]).await?;
        if n == 0 {
            return Err(ProtocolError::HandshakeTruncated { received: filled }.into());
        }
        filled += n;
    }

    if received != expected {
        return Err(ProtocolError::HandshakeMismatch.into());
    }
    Ok(())
}

/// Receiver side: verify the producer's token, then answer
pub async fn accept_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    expect_token(stream, CLIENT_HANDSHAKE).await?;
    stream.write_all(SERVER_HANDSHAKE).await?;
    stream.flush().await?;
    Ok(())
}

/// Producer side: send our token and verify the answer
pub async fn initiate_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(CLIENT_HANDSHAKE).await?;
    stream.flush().await?;
    expect_token(stream, SERVER_HANDSHAKE).await
}
