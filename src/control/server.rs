//! Control API server

use axum::{
    routing::get,
    Router,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{AppConfig, ControlConfig, EffectsConfig};
use crate::control::{handlers, websocket};
use crate::error::{Error, NetworkError, Result};
use crate::network::AudioServer;

/// Shared state behind every route
pub struct AppState {
    pub server: Arc<AudioServer>,
    config: Mutex<AppConfig>,
    /// Where effect changes are saved; `None` keeps them in memory
    config_path: Option<PathBuf>,
}

impl AppState {
    pub fn new(server: Arc<AudioServer>, config: AppConfig, config_path: Option<PathBuf>) -> Self {
        Self {
            server,
            config: Mutex::new(config),
            config_path,
        }
    }

    /// Write new effect parameters to disk, keeping them only once saved
    pub fn persist_effects(&self, effects: &EffectsConfig) -> Result<()> {
        let mut config = self.config.lock();
        let mut updated = config.clone();
        updated.effects = effects.clone();
        if let Some(path) = &self.config_path {
            updated.save_to(path)?;
        }
        *config = updated;
        Ok(())
    }
}

pub struct ControlServer {
    config: ControlConfig,
    state: Arc<AppState>,
}

impl ControlServer {
    pub fn new(config: ControlConfig, state: Arc<AppState>) -> Self {
        Self { config, state }
    }

    /// Build the router
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/api/status", get(handlers::get_status))
            .route("/api/mute", axum::routing::post(handlers::set_mute))
            .route(
                "/api/config",
                get(handlers::get_config).put(handlers::update_config),
            )
            .route("/api/ws", get(websocket::ws_handler))
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.http_port)
            .parse()
            .map_err(|_| Error::Config(format!("invalid control address {}", self.config.bind_address)))?;

        let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
            NetworkError::BindFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            }
        })?;

        tracing::info!("Control API listening on http://{}", addr);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    /// Serve on a background task
    pub fn start_background<F>(self, shutdown: F) -> tokio::task::JoinHandle<Result<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run(shutdown))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::sink::MemorySink;
    use crate::config::{ConnectionMode, NetworkConfig};
    use crate::control::handlers::ApiResponse;
    use crate::protocol::{ServerStatus, StreamState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use futures_util::StreamExt;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite;
    use tower::ServiceExt;

    type StatusFeed =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    fn control(config_path: Option<PathBuf>) -> ControlServer {
        let server = Arc::new(AudioServer::new(
            Arc::new(MemorySink::new()),
            NetworkConfig::default(),
            EffectsConfig::default(),
        ));
        let state = Arc::new(AppState::new(server, AppConfig::default(), config_path));
        ControlServer::new(ControlConfig::default(), state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn put_config(update: &EffectsConfig) -> Request<Body> {
        Request::put("/api/config")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(update).unwrap()))
            .unwrap()
    }

    async fn next_status(feed: &mut StatusFeed) -> ServerStatus {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), feed.next())
                .await
                .expect("no status pushed")
                .unwrap()
                .unwrap();
            if let tungstenite::Message::Text(text) = message {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_status_route() {
        let response = control(None)
            .router()
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: ApiResponse<ServerStatus> = body_json(response).await;
        assert!(body.success);
        assert_eq!(body.data.unwrap().state, StreamState::Idle);
    }

    #[tokio::test]
    async fn test_mute_without_session() {
        let response = control(None)
            .router()
            .oneshot(
                Request::post("/api/mute")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"muted":true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_config_update_applied_and_saved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let control = control(Some(path.clone()));
        let state = control.state.clone();

        let update = EffectsConfig {
            enable_agc: true,
            amplification: 1.5,
            ..EffectsConfig::default()
        };
        let response = control
            .router()
            .oneshot(
                Request::put("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&update).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.server.effects_config(), update);
        assert_eq!(AppConfig::load_from(&path).unwrap().effects, update);
    }

    #[tokio::test]
    async fn test_config_out_of_range_rejected() {
        let control = control(None);
        let state = control.state.clone();
        let update = EffectsConfig {
            vad_threshold: 150,
            ..EffectsConfig::default()
        };

        let response = control
            .router()
            .oneshot(
                Request::put("/api/config")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&update).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.server.effects_config(), EffectsConfig::default());
    }

    #[tokio::test]
    async fn test_dereverb_level_out_of_range_rejected() {
        let control = control(None);
        let state = control.state.clone();
        let update = EffectsConfig {
            enable_dereverb: true,
            dereverb_level: 1.5,
            ..EffectsConfig::default()
        };

        let response = control.router().oneshot(put_config(&update)).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiResponse<EffectsConfig> = body_json(response).await;
        assert!(!body.success);
        assert!(body.error.unwrap().contains("dereverb_level"));
        assert_eq!(state.server.effects_config(), EffectsConfig::default());
    }

    #[tokio::test]
    async fn test_failed_save_leaves_config_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let control = control(Some(blocker.join("config.toml")));
        let state = control.state.clone();

        let update = EffectsConfig {
            amplification: 3.0,
            ..EffectsConfig::default()
        };
        let response = control.router().oneshot(put_config(&update)).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.server.effects_config(), EffectsConfig::default());
        assert_eq!(state.config.lock().effects, EffectsConfig::default());
    }

    #[tokio::test]
    async fn test_status_websocket_follows_state_changes() {
        let control = control(None);
        let state = control.state.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = control.router();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let (mut feed, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/ws", addr))
            .await
            .unwrap();

        let initial = next_status(&mut feed).await;
        assert_eq!(initial.state, StreamState::Idle);
        assert_eq!(initial.mode, None);

        state.server.start(0, ConnectionMode::Tcp).await.unwrap();
        let listening = next_status(&mut feed).await;
        assert_eq!(listening.state, StreamState::Connecting);
        assert_eq!(listening.mode, Some(ConnectionMode::Tcp));

        state.server.stop().await;
        let mut stopped = next_status(&mut feed).await;
        while stopped.state != StreamState::Idle {
            stopped = next_status(&mut feed).await;
        }
        assert_eq!(stopped.port, None);
    }
}
