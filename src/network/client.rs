//! Audio-producing side of the protocol

use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info};

use crate::codec::frame::{FrameReader, FrameWriter};
use crate::codec::handshake::initiate_handshake;
use crate::constants::HANDSHAKE_TIMEOUT_MS;
use crate::error::{NetworkError, Result};
use crate::protocol::{AudioPacket, Message, MuteState};

use super::transport::BoxedStream;

pub type ClientReader = FrameReader<ReadHalf<BoxedStream>>;
pub type ClientWriter = FrameWriter<WriteHalf<BoxedStream>>;

/// A connected, handshaken stream to a receiver
pub struct StreamClient {
    reader: ClientReader,
    writer: ClientWriter,
    peer: String,
}

impl StreamClient {
    /// Connect over TCP and perform the handshake
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed(e.to_string()))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        Self::from_stream(Box::new(stream), peer).await
    }

    /// Handshake over an already-open stream
    pub async fn from_stream(mut stream: BoxedStream, peer: impl Into<String>) -> Result<Self> {
        let peer = peer.into();
        let timeout = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
        tokio::time::timeout(timeout, initiate_handshake(&mut stream))
            .await
            .map_err(|_| NetworkError::ConnectionFailed("handshake timed out".into()))??;
        info!("Connected to {}", peer);

        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            peer,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one audio buffer
    pub async fn send_packet(&mut self, packet: &AudioPacket) -> Result<()> {
        packet.validate()?;
        self.writer.write_message(&Message::Audio(packet.clone())).await
    }

    /// Tell the receiver our microphone was muted or unmuted
    pub async fn send_mute_state(&mut self, muted: bool) -> Result<()> {
        self.writer
            .write_message(&Message::Mute(MuteState { muted }))
            .await
    }

    /// Wait for the next control frame from the receiver. Returns `None`
    /// when the receiver closes the stream.
    pub async fn next_control(&mut self) -> Result<Option<MuteState>> {
        next_control(&mut self.reader).await
    }

    /// Close our write direction; the receiver sees a clean end of stream
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await
    }

    /// Separate the directions so they can run in different tasks
    pub fn into_split(self) -> (ClientReader, ClientWriter) {
        (self.reader, self.writer)
    }
}

/// Read until a control frame arrives, skipping anything else
pub async fn next_control(reader: &mut ClientReader) -> Result<Option<MuteState>> {
    while let Some(message) = reader.read_message().await? {
        match message {
            Message::Mute(state) => return Ok(Some(state)),
            Message::Audio(_) => debug!("Ignoring audio frame from receiver"),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::handshake::accept_handshake;
    use crate::error::{Error, ProtocolError};
    use crate::protocol::AudioFormat;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_client_exchange() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            accept_handshake(&mut server_side).await.unwrap();
            let (read_half, write_half) = tokio::io::split(server_side);
            let mut reader = FrameReader::new(read_half);
            let mut writer = FrameWriter::new(write_half);

            let first = reader.read_message().await.unwrap().unwrap();
            writer
                .write_message(&Message::Mute(MuteState { muted: true }))
                .await
                .unwrap();
            first
        });

        let mut client = StreamClient::from_stream(Box::new(client_side), "duplex")
            .await
            .unwrap();
        let packet = AudioPacket::new(vec![1, 0, 2, 0], 16000, 1, AudioFormat::Pcm16);
        client.send_packet(&packet).await.unwrap();

        assert_eq!(server.await.unwrap(), Message::Audio(packet));
        assert_eq!(
            client.next_control().await.unwrap(),
            Some(MuteState { muted: true })
        );
        assert_eq!(client.next_control().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_packet_not_sent() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            accept_handshake(&mut server_side).await.unwrap();
            let mut rest = Vec::new();
            server_side.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let mut client = StreamClient::from_stream(Box::new(client_side), "duplex")
            .await
            .unwrap();
        let packet = AudioPacket::new(vec![0; 4], 48000, 0, AudioFormat::Pcm16);
        assert!(matches!(
            client.send_packet(&packet).await,
            Err(Error::Protocol(ProtocolError::InvalidChannelCount(0)))
        ));
        client.shutdown().await.unwrap();
        drop(client);

        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_server_token() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut token = [0u8; 11];
            server_side.read_exact(&mut token).await.unwrap();
            server_side.write_all(b"SomethingEl").await.unwrap();
            // keep the stream open until the client gives up
            let _ = server_side.read(&mut token).await;
        });

        let result = StreamClient::from_stream(Box::new(client_side), "duplex").await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::HandshakeMismatch))
        ));
    }
}
