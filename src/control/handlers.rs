//! HTTP API handlers

use axum::{extract::State, http::StatusCode, Json};
use std::sync::Arc;

use crate::config::EffectsConfig;
use crate::control::server::AppState;
use crate::protocol::ServerStatus;

/// API response wrapper
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Listener status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ServerStatus>> {
    Json(ApiResponse::ok(state.server.status()))
}

#[derive(Debug, serde::Deserialize)]
pub struct MuteRequest {
    pub muted: bool,
}

/// Forward a mute state to the connected phone
pub async fn set_mute(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MuteRequest>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    if state.server.send_mute_state(req.muted) {
        (StatusCode::OK, Json(ApiResponse::ok(())))
    } else {
        (
            StatusCode::CONFLICT,
            Json(ApiResponse::error("No active session")),
        )
    }
}

/// Current effect parameters
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ApiResponse<EffectsConfig>> {
    Json(ApiResponse::ok(state.server.effects_config()))
}

/// Persist new effect parameters, then apply them to the running listener
pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(effects): Json<EffectsConfig>,
) -> (StatusCode, Json<ApiResponse<EffectsConfig>>) {
    if !(0..=100).contains(&effects.vad_threshold) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("vad_threshold must be within 0-100")),
        );
    }
    if !(0.0..=1.0).contains(&effects.dereverb_level) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("dereverb_level must be within 0.0-1.0")),
        );
    }

    if let Err(e) = state.persist_effects(&effects) {
        tracing::warn!("Failed to save config: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        );
    }

    state.server.update_config(effects.clone());
    (StatusCode::OK, Json(ApiResponse::ok(effects)))
}
