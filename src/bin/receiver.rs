//! Microphone Relay Receiver
//!
//! Accepts a phone's microphone stream, cleans it up and plays it on an
//! output device.
//!
//! Usage: `receiver [port] [tcp|usb|wifi|bluetooth]`

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    audio::CpalSink,
    config::{AppConfig, ConnectionMode},
    control::{AppState, ControlServer},
    network::AudioServer,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Mic Relay Receiver");

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            AppConfig::default()
        }
    };

    let mut args = std::env::args().skip(1);
    let port = match args.next() {
        Some(port) => port.parse().context("port must be a number")?,
        None => config.network.port,
    };
    let mode = match args.next() {
        Some(mode) => mode.parse::<ConnectionMode>()?,
        None => config.network.mode,
    };

    let sink = Arc::new(CpalSink::new(
        config.output.device_id.clone(),
        config.output.monitoring,
    ));
    if !config.output.monitoring {
        tracing::info!("Monitoring is off, only a virtual cable output will carry audio");
    }

    let server = Arc::new(
        AudioServer::new(sink.clone(), config.network.clone(), config.effects.clone())
            .on_mute_changed(|muted| {
                tracing::info!("Phone microphone {}", if muted { "muted" } else { "unmuted" });
            }),
    );

    let mut states = server.subscribe_state();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!("State: {:?}", state);
        }
    });

    server
        .start(port, mode)
        .await
        .with_context(|| format!("failed to start {} listener on port {}", mode, port))?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let control_handle = if config.control.enabled {
        let state = Arc::new(AppState::new(
            server.clone(),
            config.clone(),
            AppConfig::default_path(),
        ));
        let control = ControlServer::new(config.control.clone(), state);
        Some(control.start_background(async move {
            let _ = shutdown_rx.changed().await;
        }))
    } else {
        None
    };

    let mut error_check = tokio::time::interval(std::time::Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = error_check.tick() => {
                if let Some(e) = sink.check_errors() {
                    tracing::warn!("Playback error: {}", e);
                }
            }
        }
    }

    tracing::info!("Shutting down");
    server.stop().await;
    let _ = shutdown_tx.send(true);
    if let Some(handle) = control_handle {
        if let Ok(Err(e)) = handle.await {
            tracing::warn!("Control API stopped with error: {}", e);
        }
    }

    let status = server.status();
    tracing::info!("Received {} audio frames", status.packets_received);
    Ok(())
}
