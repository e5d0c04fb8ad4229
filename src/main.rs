//! # voice-channel - Command Line Client
//!
//! Places one voice call against the configured server using the default microphone
//! and speaker, and logs what happens until Ctrl+C.
//!
//! ## Startup Sequence:
//! 1. Load `.env` and initialize tracing
//! 2. Load and validate [`ClientConfig`]
//! 3. Build the WebSocket connector, cpal input and rodio output
//! 4. Start the call and log state, recognition, reply and error notifications
//! 5. End the call on Ctrl+C

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use voice_channel::call::{CallCoordinator, CallState, ReplyUpdate};
use voice_channel::capture::CpalInput;
use voice_channel::config::ClientConfig;
use voice_channel::error::ChannelError;
use voice_channel::playback::RodioRenderer;
use voice_channel::transport::WsConnector;

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = ClientConfig::load()?;
    config.validate()?;

    info!("Starting voice-channel v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Server: {} (conversation {})",
        config.server.base_url, config.server.ai_session_id
    );

    let renderer = Arc::new(RodioRenderer::new()?);
    let call = CallCoordinator::from_config(
        &config,
        Arc::new(WsConnector::new()),
        Arc::new(CpalInput::new()),
        renderer,
    );

    let _state = call.on_state_change(|state: &CallState| info!("Call is {}", state));
    let _recognition = call.on_recognition(|text: &String| info!("You: {}", text));
    let _reply = call.on_reply(|update: &ReplyUpdate| {
        if update.is_final {
            info!("Assistant: {}", update.text);
        }
    });
    let _errors = call.on_error(|error: &ChannelError| warn!("Call error: {}", error));

    if let Err(e) = call.start_call().await {
        error!("Could not start the call: {}", e);
        call.destroy();
        return Err(e.into());
    }

    info!("Call in progress, press Ctrl+C to hang up");
    tokio::signal::ctrl_c().await?;

    info!("Hanging up");
    call.destroy();
    Ok(())
}

/// Console logging, filtered by `RUST_LOG` (default `voice_channel=debug`).
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voice_channel=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}
