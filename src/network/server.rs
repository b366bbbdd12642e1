//! Listener supervisor
//!
//! Owns the listening transport and serves one session at a time. The
//! lifecycle is published on a watch channel:
//!
//! ```text
//! Idle ──start──▶ Connecting ──accept──▶ Streaming
//!   ▲                 ▲                      │
//!   │                 └────session ends──────┘
//!   └────stop──── (any)          bind failure ──▶ Error
//! ```
//!
//! Bluetooth registration failures also publish `Error` with the message
//! in `last_error`, then go back to `Connecting` for the next attempt.
//!
//! The session pipeline is owned by the listener task and reset between
//! sessions, so no effect state leaks from one peer to the next.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audio::pipeline::AudioPipeline;
use crate::audio::sink::AudioSink;
use crate::config::{ConnectionMode, EffectsConfig, NetworkConfig};
use crate::constants::{
    ACCEPT_RETRY_DELAY_MS, BLUETOOTH_SERVICE_NAME, BLUETOOTH_SERVICE_UUID, CONTROL_QUEUE_CAPACITY,
};
use crate::error::{Error, NetworkError, Result};
use crate::protocol::{Message, MuteState, ServerStatus, StreamState};

use super::handler::{ConnectionHandler, MuteCallback};
use super::transport::{Acceptor, BluetoothRegistrar, BoxedStream, TcpAcceptor};

/// Builds the pipeline the listener uses for every session
pub type PipelineFactory = Arc<dyn Fn(EffectsConfig) -> AudioPipeline + Send + Sync>;

/// State shared between the server handle and its listener task
struct Shared {
    state_tx: watch::Sender<StreamState>,
    config_tx: watch::Sender<EffectsConfig>,
    last_error: Mutex<Option<String>>,
    /// Outbound control queue of the active session
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    session: Mutex<Option<(Uuid, DateTime<Utc>)>>,
    listening: Mutex<Option<(ConnectionMode, u16)>>,
    packets_received: Arc<AtomicU64>,
}

impl Shared {
    fn set_state(&self, state: StreamState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Listener state: {:?} -> {:?}", previous, state);
        }
    }

    fn set_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }
}

/// Everything the listener task needs, moved into it at start
struct Listener {
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    on_mute: Option<MuteCallback>,
    pipeline: AudioPipeline,
    max_frame_len: usize,
    shutdown: watch::Receiver<bool>,
}

/// How a session or accept loop ended
enum LoopEnd {
    Cancelled,
    Failed(Error),
}

impl Listener {
    /// Resolves once stop is requested (or the server handle is gone)
    async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
        while !*shutdown.borrow_and_update() {
            if shutdown.changed().await.is_err() {
                return;
            }
        }
    }

    async fn run_tcp(mut self, mut acceptor: TcpAcceptor) {
        loop {
            match self.accept_loop(&mut acceptor).await {
                LoopEnd::Cancelled => break,
                LoopEnd::Failed(e) => {
                    warn!("Accept failed: {}", e);
                    let delay = tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS));
                    tokio::select! {
                        _ = Self::cancelled(&mut self.shutdown) => break,
                        _ = delay => {}
                    }
                }
            }
        }
        self.finish();
    }

    async fn run_bluetooth(mut self, registrar: Arc<dyn BluetoothRegistrar>, retry: Duration) {
        loop {
            self.shared.set_state(StreamState::Connecting);
            let registered = tokio::select! {
                _ = Self::cancelled(&mut self.shutdown) => break,
                r = registrar.register(BLUETOOTH_SERVICE_NAME, BLUETOOTH_SERVICE_UUID) => r,
            };

            match registered {
                Ok(mut acceptor) => {
                    info!("Bluetooth service registered at {}", acceptor.local_label());
                    match self.accept_loop(acceptor.as_mut()).await {
                        LoopEnd::Cancelled => break,
                        LoopEnd::Failed(e) => {
                            warn!("Bluetooth listener failed: {}", e);
                            self.shared.set_error(e.to_string());
                            self.shared.set_state(StreamState::Error);
                        }
                    }
                }
                Err(e) => {
                    warn!("Bluetooth registration failed: {}", e);
                    self.shared.set_error(e.to_string());
                    self.shared.set_state(StreamState::Error);
                }
            }

            info!("Retrying Bluetooth registration in {}ms", retry.as_millis());
            tokio::select! {
                _ = Self::cancelled(&mut self.shutdown) => break,
                _ = tokio::time::sleep(retry) => {}
            }
        }
        self.finish();
    }

    /// Accept and serve peers one after another until cancelled or the
    /// acceptor fails
    async fn accept_loop(&mut self, acceptor: &mut dyn Acceptor) -> LoopEnd {
        loop {
            self.shared.set_state(StreamState::Connecting);

            let accepted = tokio::select! {
                _ = Self::cancelled(&mut self.shutdown) => return LoopEnd::Cancelled,
                r = acceptor.accept() => r,
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => return LoopEnd::Failed(e),
            };

            let session_id = Uuid::new_v4();
            let span = info_span!("session", id = %session_id, peer = %peer);
            let ended = self.serve(stream, peer, session_id).instrument(span).await;
            self.end_session();

            match ended {
                Ok(()) => {}
                Err(LoopEnd::Cancelled) => return LoopEnd::Cancelled,
                Err(LoopEnd::Failed(e)) => {
                    warn!("Session ended with error: {}", e);
                    self.shared.set_error(e.to_string());
                }
            }
        }
    }

    async fn serve(
        &mut self,
        mut stream: BoxedStream,
        peer: String,
        session_id: Uuid,
    ) -> std::result::Result<(), LoopEnd> {
        info!("Accepted connection from {}", peer);

        let handler = ConnectionHandler::new(
            peer,
            self.sink.clone(),
            self.shared.config_tx.subscribe(),
        )
        .with_session_id(session_id)
        .with_mute_callback(self.on_mute.clone())
        .with_max_frame_len(self.max_frame_len)
        .with_packet_counter(self.shared.packets_received.clone());

        let shared = self.shared.clone();
        let pipeline = &mut self.pipeline;
        let session = async move {
            handler.handshake(&mut stream).await?;

            let (tx, rx) = mpsc::channel(CONTROL_QUEUE_CAPACITY);
            *shared.outbound.lock() = Some(tx);
            *shared.session.lock() = Some((session_id, Utc::now()));
            *shared.last_error.lock() = None;
            shared.set_state(StreamState::Streaming);

            handler.run(stream, pipeline, rx).await
        };

        tokio::select! {
            _ = Self::cancelled(&mut self.shutdown) => Err(LoopEnd::Cancelled),
            result = session => match result {
                Ok(stats) => {
                    info!(
                        "Session finished: {} audio frames, {} mute frames, {} dropped",
                        stats.audio_frames, stats.mute_frames, stats.dropped_frames
                    );
                    Ok(())
                }
                Err(e) => Err(LoopEnd::Failed(e)),
            },
        }
    }

    /// Tear down per-session state so the next peer starts clean
    fn end_session(&mut self) {
        *self.shared.outbound.lock() = None;
        *self.shared.session.lock() = None;
        self.pipeline.reset();
        self.sink.flush();
    }

    fn finish(self) {
        *self.shared.listening.lock() = None;
        self.shared.set_state(StreamState::Idle);
        info!("Listener stopped");
    }
}

/// Handle to a running (or stopped) listener
struct ListenerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct AudioServer {
    shared: Arc<Shared>,
    sink: Arc<dyn AudioSink>,
    network: NetworkConfig,
    on_mute: Option<MuteCallback>,
    registrar: Option<Arc<dyn BluetoothRegistrar>>,
    pipeline_factory: PipelineFactory,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
}

impl AudioServer {
    pub fn new(sink: Arc<dyn AudioSink>, network: NetworkConfig, effects: EffectsConfig) -> Self {
        let (state_tx, _) = watch::channel(StreamState::Idle);
        let (config_tx, _) = watch::channel(effects);

        Self {
            shared: Arc::new(Shared {
                state_tx,
                config_tx,
                last_error: Mutex::new(None),
                outbound: Mutex::new(None),
                session: Mutex::new(None),
                listening: Mutex::new(None),
                packets_received: Arc::new(AtomicU64::new(0)),
            }),
            sink,
            network,
            on_mute: None,
            registrar: None,
            pipeline_factory: Arc::new(AudioPipeline::new),
            listener: tokio::sync::Mutex::new(None),
        }
    }

    /// Called whenever the peer reports a mute change
    pub fn on_mute_changed<F>(mut self, callback: F) -> Self
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.on_mute = Some(Arc::new(callback));
        self
    }

    /// Platform Bluetooth stack used in [`ConnectionMode::Bluetooth`]
    pub fn with_bluetooth_registrar(mut self, registrar: Arc<dyn BluetoothRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    /// Customize pipeline construction, e.g. to register denoisers
    pub fn with_pipeline_factory(mut self, factory: PipelineFactory) -> Self {
        self.pipeline_factory = factory;
        self
    }

    /// Start listening. A running listener is stopped first.
    ///
    /// A TCP bind failure is fatal: the state moves to `Error`, the
    /// message is kept in [`last_error`](Self::last_error) and nothing is
    /// retried.
    pub async fn start(&self, port: u16, mode: ConnectionMode) -> Result<()> {
        let mut slot = self.listener.lock().await;
        Self::shutdown_listener(&self.shared, slot.take()).await;
        *self.shared.last_error.lock() = None;
        self.shared.packets_received.store(0, Ordering::Relaxed);

        let (shutdown_tx, shutdown) = watch::channel(false);
        let listener = Listener {
            shared: self.shared.clone(),
            sink: self.sink.clone(),
            on_mute: self.on_mute.clone(),
            pipeline: (self.pipeline_factory)(self.shared.config_tx.borrow().clone()),
            max_frame_len: self.network.max_frame_len,
            shutdown,
        };

        let task = match mode {
            ConnectionMode::Tcp => {
                let acceptor = match self.bind_tcp(port) {
                    Ok(acceptor) => acceptor,
                    Err(e) => return Err(self.fail(e)),
                };
                let bound = acceptor.local_addr().port();
                *self.shared.listening.lock() = Some((mode, bound));
                info!("Listening on {}", acceptor.local_label());
                self.shared.set_state(StreamState::Connecting);
                tokio::spawn(listener.run_tcp(acceptor))
            }
            ConnectionMode::Bluetooth => {
                let registrar = match &self.registrar {
                    Some(registrar) => registrar.clone(),
                    None => {
                        return Err(self.fail(
                            NetworkError::TransportUnavailable(
                                "no Bluetooth stack available".into(),
                            )
                            .into(),
                        ))
                    }
                };
                *self.shared.listening.lock() = Some((mode, port));
                self.shared.set_state(StreamState::Connecting);
                let retry = Duration::from_millis(self.network.bluetooth_retry_ms);
                tokio::spawn(listener.run_bluetooth(registrar, retry))
            }
        };

        *slot = Some(ListenerHandle { shutdown_tx, task });
        Ok(())
    }

    fn bind_tcp(&self, port: u16) -> Result<TcpAcceptor> {
        let ip = self
            .network
            .bind_address
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind address {}", self.network.bind_address)))?;
        TcpAcceptor::bind(SocketAddr::new(ip, port))
    }

    fn fail(&self, e: Error) -> Error {
        error!("Listener failed to start: {}", e);
        self.shared.set_error(e.to_string());
        self.shared.set_state(StreamState::Error);
        e
    }

    /// Cancel the listener and any active session and wait for teardown
    pub async fn stop(&self) {
        let handle = self.listener.lock().await.take();
        Self::shutdown_listener(&self.shared, handle).await;
    }

    async fn shutdown_listener(shared: &Shared, handle: Option<ListenerHandle>) {
        if let Some(handle) = handle {
            let _ = handle.shutdown_tx.send(true);
            if let Err(e) = handle.task.await {
                error!("Listener task failed: {}", e);
            }
            shared.set_state(StreamState::Idle);
        }
    }

    /// Queue a mute notification to the connected peer. Returns false when
    /// no session is active or its queue is full.
    pub fn send_mute_state(&self, muted: bool) -> bool {
        let outbound = self.shared.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return false;
        };
        match tx.try_send(Message::Mute(MuteState { muted })) {
            Ok(()) => true,
            Err(e) => {
                warn!("Dropping mute notification: {}", e);
                false
            }
        }
    }

    /// Replace the effect parameters; the active session picks them up on
    /// its next buffer
    pub fn update_config(&self, config: EffectsConfig) {
        self.shared.config_tx.send_replace(config);
    }

    pub fn effects_config(&self) -> EffectsConfig {
        self.shared.config_tx.borrow().clone()
    }

    pub fn state(&self) -> StreamState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StreamState> {
        self.shared.state_tx.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.last_error.lock().clone()
    }

    /// Bound port, when listening over TCP
    pub fn local_port(&self) -> Option<u16> {
        self.shared.listening.lock().map(|(_, port)| port)
    }

    pub fn status(&self) -> ServerStatus {
        let listening = *self.shared.listening.lock();
        let session = *self.shared.session.lock();
        ServerStatus {
            state: self.state(),
            last_error: self.last_error(),
            mode: listening.map(|(mode, _)| mode),
            port: listening.map(|(_, port)| port),
            session_id: session.map(|(id, _)| id),
            session_started_at: session.map(|(_, started)| started),
            packets_received: self.shared.packets_received.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            let _ = handle.shutdown_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn loopback() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".to_string(),
            bluetooth_retry_ms: 20,
            ..NetworkConfig::default()
        }
    }

    fn server() -> AudioServer {
        AudioServer::new(Arc::new(MemorySink::new()), loopback(), EffectsConfig::default())
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let server = server();
        assert_eq!(server.state(), StreamState::Idle);

        server.start(0, ConnectionMode::Tcp).await.unwrap();
        assert_eq!(server.state(), StreamState::Connecting);
        assert!(server.local_port().unwrap() > 0);
        assert_eq!(server.status().mode, Some(ConnectionMode::Tcp));

        server.stop().await;
        assert_eq!(server.state(), StreamState::Idle);
        assert!(server.last_error().is_none());
        assert!(server.local_port().is_none());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let server = server();
        let result = server.start(port, ConnectionMode::Tcp).await;

        assert!(result.is_err());
        assert_eq!(server.state(), StreamState::Error);
        assert!(server.last_error().unwrap().contains(&port.to_string()));
    }

    #[tokio::test]
    async fn test_mute_without_session_not_sent() {
        let server = server();
        assert!(!server.send_mute_state(true));
    }

    #[tokio::test]
    async fn test_bluetooth_without_stack_fails() {
        let server = server();
        let result = server.start(0, ConnectionMode::Bluetooth).await;
        assert!(matches!(
            result,
            Err(Error::Network(NetworkError::TransportUnavailable(_)))
        ));
        assert_eq!(server.state(), StreamState::Error);
    }

    struct FlakyRegistrar {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl BluetoothRegistrar for FlakyRegistrar {
        async fn register(&self, name: &str, uuid: &str) -> Result<Box<dyn Acceptor>> {
            assert_eq!(name, BLUETOOTH_SERVICE_NAME);
            assert_eq!(uuid, BLUETOOTH_SERVICE_UUID);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(NetworkError::Bluetooth("adapter busy".into()).into())
        }
    }

    #[tokio::test]
    async fn test_bluetooth_registration_retried() {
        let registrar = Arc::new(FlakyRegistrar {
            attempts: AtomicUsize::new(0),
        });
        let server = server().with_bluetooth_registrar(registrar.clone());

        server.start(0, ConnectionMode::Bluetooth).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(registrar.attempts.load(Ordering::SeqCst) >= 2);
        assert!(server.last_error().unwrap().contains("adapter busy"));

        server.stop().await;
        assert_eq!(server.state(), StreamState::Idle);
    }

    #[tokio::test]
    async fn test_bluetooth_failure_reported_while_waiting_to_retry() {
        let registrar = Arc::new(FlakyRegistrar {
            attempts: AtomicUsize::new(0),
        });
        let config = NetworkConfig {
            bluetooth_retry_ms: 60_000,
            ..loopback()
        };
        let server = AudioServer::new(Arc::new(MemorySink::new()), config, EffectsConfig::default())
            .with_bluetooth_registrar(registrar.clone());
        let mut states = server.subscribe_state();

        server.start(0, ConnectionMode::Bluetooth).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == StreamState::Error))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(registrar.attempts.load(Ordering::SeqCst), 1);
        let status = server.status();
        assert_eq!(status.state, StreamState::Error);
        assert!(status.last_error.unwrap().contains("adapter busy"));

        // the retry wait is cancellable
        server.stop().await;
        assert_eq!(server.state(), StreamState::Idle);
    }
}
