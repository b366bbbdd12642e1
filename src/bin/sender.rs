//! Microphone Relay Sender
//!
//! Captures the default input device and streams it to a receiver.
//! Type `m` and Enter to toggle the mute state.
//!
//! Usage: `sender <host:port>`

use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mic_relay::{
    audio::{create_shared_queue, AudioCapture},
    constants::*,
    network::{client, StreamClient},
    protocol::{Message, MuteState},
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

    tracing::info!("Starting Mic Relay Sender");

    let target = std::env::args()
        .nth(1)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_PORT));

    let queue = create_shared_queue(RING_BUFFER_CAPACITY);
    let mut capture = AudioCapture::new(None, Some(DEFAULT_SAMPLE_RATE), Some(1), queue.clone())
        .context("failed to open the input device")?;

    let client = StreamClient::connect(target.as_str())
        .await
        .with_context(|| format!("failed to connect to {}", target))?;
    let (mut reader, mut writer) = client.into_split();

    tokio::spawn(async move {
        loop {
            match client::next_control(&mut reader).await {
                Ok(Some(state)) => tracing::info!(
                    "Receiver requested {}",
                    if state.muted { "mute" } else { "unmute" }
                ),
                Ok(None) => {
                    tracing::info!("Receiver closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::warn!("Control stream failed: {}", e);
                    break;
                }
            }
        }
    });

    capture.start()?;
    tracing::info!(
        "Streaming {}Hz, {} channel(s) to {}",
        capture.sample_rate(),
        capture.channels(),
        target
    );

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut muted = false;
    let mut tick = tokio::time::interval(Duration::from_millis(5));
    let mut last_stats = std::time::Instant::now();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if line.trim() == "m" => {
                        muted = !muted;
                        writer.write_message(&Message::Mute(MuteState { muted })).await?;
                        tracing::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
            _ = tick.tick() => {
                for packet in queue.drain() {
                    writer.write_message(&Message::Audio(packet)).await?;
                }

                if let Some(e) = capture.check_errors() {
                    tracing::warn!("Capture error: {}", e);
                }

                if last_stats.elapsed() >= Duration::from_secs(5) {
                    last_stats = std::time::Instant::now();
                    tracing::info!(
                        "Sent {} frames, {} dropped by the capture queue",
                        writer.frames_written(),
                        queue.overflow_count()
                    );
                }
            }
        }
    }

    tracing::info!("Shutting down");
    capture.stop();
    writer.shutdown().await?;
    Ok(())
}
