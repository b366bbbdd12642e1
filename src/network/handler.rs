//! One streaming session, from handshake to disconnect
//!
//! After the handshake the stream is split. The read half stays with the
//! handler, which decodes frames and runs audio through the session's
//! pipeline into the sink. The write half moves to a separate task fed by
//! an outbound queue, so control frames go out without waiting on reads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::audio::pipeline::AudioPipeline;
use crate::audio::sink::AudioSink;
use crate::codec::frame::{FrameReader, FrameWriter};
use crate::codec::handshake::accept_handshake;
use crate::config::EffectsConfig;
use crate::constants::{DEFAULT_MAX_FRAME_LEN, HANDSHAKE_TIMEOUT_MS};
use crate::error::{NetworkError, Result};
use crate::protocol::{AudioPacket, Message};

use super::transport::DuplexStream;

/// Invoked with the new state whenever the peer reports a mute change
pub type MuteCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Counters for a finished session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionStats {
    pub audio_frames: u64,
    pub mute_frames: u64,
    /// Audio frames discarded for an invalid layout
    pub dropped_frames: u64,
}

/// Aborts the outbound writer when the session ends, however it ends
struct WriterGuard(JoinHandle<()>);

impl Drop for WriterGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn write_outbound<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = writer.write_message(&message).await {
            warn!("Failed to send control frame: {}", e);
            return;
        }
        debug!("Sent {:?}", message);
    }
}

pub struct ConnectionHandler {
    session_id: Uuid,
    peer: String,
    sink: Arc<dyn AudioSink>,
    config_rx: watch::Receiver<EffectsConfig>,
    on_mute: Option<MuteCallback>,
    max_frame_len: usize,
    packets_received: Arc<AtomicU64>,
    /// Format the sink was last prepared for
    format: Option<(u32, u8)>,
    stats: SessionStats,
}

impl ConnectionHandler {
    pub fn new(
        peer: impl Into<String>,
        sink: Arc<dyn AudioSink>,
        config_rx: watch::Receiver<EffectsConfig>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            peer: peer.into(),
            sink,
            config_rx,
            on_mute: None,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            packets_received: Arc::new(AtomicU64::new(0)),
            format: None,
            stats: SessionStats::default(),
        }
    }

    pub fn with_mute_callback(mut self, callback: Option<MuteCallback>) -> Self {
        self.on_mute = callback;
        self
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = session_id;
        self
    }

    /// Count audio frames into a counter shared with the caller
    pub fn with_packet_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.packets_received = counter;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Verify the peer's token and answer it
    pub async fn handshake<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let timeout = Duration::from_millis(HANDSHAKE_TIMEOUT_MS);
        tokio::time::timeout(timeout, accept_handshake(stream))
            .await
            .map_err(|_| NetworkError::ConnectionFailed("handshake timed out".into()))??;

        debug!("Handshake completed with {}", self.peer);
        Ok(())
    }

    /// Serve an established stream until the peer disconnects or a frame
    /// fails to decode. `outbound` carries control frames to the peer.
    pub async fn run<S>(
        mut self,
        stream: S,
        pipeline: &mut AudioPipeline,
        outbound: mpsc::Receiver<Message>,
    ) -> Result<SessionStats>
    where
        S: DuplexStream + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let _writer = WriterGuard(tokio::spawn(
            write_outbound(FrameWriter::new(write_half), outbound)
                .instrument(tracing::Span::current()),
        ));
        let mut reader = FrameReader::with_max_frame_len(read_half, self.max_frame_len);

        pipeline.update_config(self.config_rx.borrow_and_update().clone());

        while let Some(message) = reader.read_message().await? {
            match message {
                Message::Audio(packet) => self.handle_audio(packet, pipeline)?,
                Message::Mute(state) => {
                    self.stats.mute_frames += 1;
                    info!("Peer {}", if state.muted { "muted" } else { "unmuted" });
                    if let Some(callback) = &self.on_mute {
                        callback(state.muted);
                    }
                }
            }
        }

        info!(
            "Peer closed the stream after {} audio frames",
            self.stats.audio_frames
        );
        Ok(self.stats)
    }

    fn handle_audio(&mut self, packet: AudioPacket, pipeline: &mut AudioPipeline) -> Result<()> {
        if self.config_rx.has_changed().unwrap_or(false) {
            let config = self.config_rx.borrow_and_update().clone();
            debug!("Applying updated effects config");
            pipeline.update_config(config);
        }

        if let Err(e) = packet.validate() {
            self.stats.dropped_frames += 1;
            warn!("Dropping audio frame: {}", e);
            return Ok(());
        }

        let format = (packet.sample_rate, packet.channel_count);
        if self.format != Some(format) {
            self.sink.prepare(packet.sample_rate, packet.channel_count)?;
            info!(
                "Stream format: {}Hz, {} channel(s), {:?}",
                packet.sample_rate, packet.channel_count, packet.format
            );
            self.format = Some(format);
        }

        let queued_ms = self.sink.queued_duration_ms();
        if let Some(output) = pipeline.process(
            &packet.buffer,
            packet.format,
            packet.channel_count as usize,
            queued_ms,
        ) {
            self.sink.write(output);
        }

        self.stats.audio_frames += 1;
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;
    use crate::codec::handshake::initiate_handshake;
    use crate::constants::TARGET_QUEUED_MS;
    use crate::error::{Error, ProtocolError};
    use crate::protocol::{AudioFormat, MuteState};
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncWriteExt;

    fn silence(frames: usize) -> AudioPacket {
        AudioPacket::new(vec![0; frames * 2], 48000, 1, AudioFormat::Pcm16)
    }

    fn memory_sink() -> Arc<MemorySink> {
        let sink = Arc::new(MemorySink::new());
        sink.set_queued_duration_ms(TARGET_QUEUED_MS as u64);
        sink
    }

    #[tokio::test]
    async fn test_session_plays_audio_and_reports_mute() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let sink = memory_sink();
        let (_config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let mutes = Arc::new(AtomicUsize::new(0));
        let mutes_seen = mutes.clone();

        let handler = ConnectionHandler::new("test", sink.clone(), config_rx).with_mute_callback(
            Some(Arc::new(move |muted: bool| {
                assert!(muted);
                mutes_seen.fetch_add(1, Ordering::SeqCst);
            })),
        );

        let client_task = tokio::spawn(async move {
            initiate_handshake(&mut client).await.unwrap();
            let mut writer = FrameWriter::new(client);
            for _ in 0..3 {
                writer.write_message(&Message::Audio(silence(480))).await.unwrap();
            }
            writer
                .write_message(&Message::Mute(MuteState { muted: true }))
                .await
                .unwrap();
            writer.shutdown().await.unwrap();
        });

        handler.handshake(&mut server).await.unwrap();
        let (_tx, rx) = mpsc::channel(4);
        let mut pipeline = AudioPipeline::default();
        let stats = handler.run(server, &mut pipeline, rx).await.unwrap();
        client_task.await.unwrap();

        assert_eq!(stats.audio_frames, 3);
        assert_eq!(stats.mute_frames, 1);
        assert_eq!(mutes.load(Ordering::SeqCst), 1);
        assert_eq!(sink.write_count(), 3);
        assert_eq!(sink.writes()[0], vec![0u8; 960]);
        assert_eq!(sink.format(), Some((48000, 1)));
    }

    #[tokio::test]
    async fn test_outbound_mute_reaches_peer() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (_config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let handler = ConnectionHandler::new("test", memory_sink(), config_rx);
        let (tx, rx) = mpsc::channel(4);

        let session = tokio::spawn(async move {
            let mut pipeline = AudioPipeline::default();
            handler.run(server, &mut pipeline, rx).await
        });

        tx.send(Message::Mute(MuteState { muted: false })).await.unwrap();

        let (read_half, mut write_half) = tokio::io::split(&mut client);
        let mut reader = FrameReader::new(read_half);
        let message = reader.read_message().await.unwrap();
        assert_eq!(message, Some(Message::Mute(MuteState { muted: false })));

        write_half.shutdown().await.unwrap();
        drop(reader);
        let stats = session.await.unwrap().unwrap();
        assert_eq!(stats.audio_frames, 0);
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let (_config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let handler = ConnectionHandler::new("test", memory_sink(), config_rx);

        client.write_all(b"NotAMic0001").await.unwrap();
        let result = handler.handshake(&mut server).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::HandshakeMismatch))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_handshake_times_out() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let (_config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let handler = ConnectionHandler::new("test", memory_sink(), config_rx);

        // part of the token, then nothing
        client.write_all(b"Andr").await.unwrap();
        let started = tokio::time::Instant::now();
        let err = handler.handshake(&mut server).await.unwrap_err();

        assert!(matches!(
            err,
            Error::Network(NetworkError::ConnectionFailed(ref reason)) if reason.contains("timed out")
        ));
        assert!(started.elapsed() >= Duration::from_millis(HANDSHAKE_TIMEOUT_MS));
    }

    #[tokio::test]
    async fn test_latest_config_applied_at_start() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let sink = memory_sink();
        let (config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let handler = ConnectionHandler::new("test", sink.clone(), config_rx);
        config_tx.send_replace(EffectsConfig {
            amplification: 2.0,
            ..EffectsConfig::default()
        });

        let mut writer = FrameWriter::new(&mut client);
        let packet = AudioPacket::new(vec![100, 0, 100, 0], 48000, 1, AudioFormat::Pcm16);
        writer.write_message(&Message::Audio(packet)).await.unwrap();
        writer.shutdown().await.unwrap();

        let (_tx, rx) = mpsc::channel(4);
        let mut pipeline = AudioPipeline::default();
        handler.run(server, &mut pipeline, rx).await.unwrap();

        assert_eq!(sink.writes(), vec![vec![200, 0, 200, 0]]);
    }

    #[tokio::test]
    async fn test_invalid_packet_dropped_and_session_continues() {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let sink = memory_sink();
        let (_config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let handler = ConnectionHandler::new("test", sink.clone(), config_rx);

        let mut writer = FrameWriter::new(&mut client);
        let four_channels = AudioPacket::new(vec![1; 16], 48000, 4, AudioFormat::Pcm16);
        writer.write_message(&Message::Audio(silence(4))).await.unwrap();
        writer.write_message(&Message::Audio(four_channels)).await.unwrap();
        writer.write_message(&Message::Audio(silence(4))).await.unwrap();
        writer.shutdown().await.unwrap();

        let (_tx, rx) = mpsc::channel(4);
        let mut pipeline = AudioPipeline::default();
        let stats = handler.run(server, &mut pipeline, rx).await.unwrap();

        assert_eq!(stats.audio_frames, 2);
        assert_eq!(stats.dropped_frames, 1);
        assert_eq!(sink.writes(), vec![vec![0u8; 8], vec![0u8; 8]]);
        assert_eq!(sink.format(), Some((48000, 1)));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_stream_closed() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (_config_tx, config_rx) = watch::channel(EffectsConfig::default());
        let handler = ConnectionHandler::new("test", memory_sink(), config_rx);

        // length prefix promises 100 bytes, peer hangs up after 3
        client.write_all(&[0, 0, 0, 100, 1, 2, 3]).await.unwrap();
        client.shutdown().await.unwrap();

        let (_tx, rx) = mpsc::channel(4);
        let mut pipeline = AudioPipeline::default();
        let err = handler.run(server, &mut pipeline, rx).await.unwrap_err();
        assert!(err.is_stream_closed());
    }
}
