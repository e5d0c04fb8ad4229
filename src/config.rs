//! # Configuration Management
//!
//! Loads the client configuration from multiple sources:
//! - Default values (the `Default` impl below)
//! - An optional `voice-channel.toml` in the working directory
//! - Environment variables prefixed with `VOICE_` (nested keys joined with `__`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`VOICE_SERVER__BASE_URL`, `VOICE_TRANSPORT__RECONNECT_DELAY_MS`, ...)
//! 2. Configuration file (`voice-channel.toml`)
//! 3. Default values
//!
//! Components never read configuration themselves. The application root loads a
//! [`ClientConfig`] once and hands each component the slice it needs.

use crate::capture::CaptureFormat;
use crate::transport::{ChatMode, SessionConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

/// Where to connect and who we are.
///
/// ## Fields:
/// - `base_url`: WebSocket base address, `ws://` or `wss://`, without the mode path
/// - `openid`: user identifier supplied by the (external) login flow
/// - `ai_session_id`: conversation identifier
/// - `mode`: `text` connects to `/ws/chat`, `voice` to `/ws/voice`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub base_url: String,
    pub openid: String,
    pub ai_session_id: String,
    pub mode: ChatMode,
}

/// Heartbeat and reconnection tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub heartbeat_interval_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

/// Microphone format. The server expects 16 kHz mono s16le.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per delivered frame
    pub frame_samples: usize,
}

/// Fragment aggregation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Silence after the last fragment before the buffered fragments are flushed
    pub quiet_window_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                base_url: "ws://localhost:8088".to_string(),
                openid: String::new(),
                ai_session_id: generate_session_id(),
                mode: ChatMode::Voice,
            },
            transport: TransportConfig {
                heartbeat_interval_ms: 30_000,
                reconnect_delay_ms: 3_000,
                max_reconnect_attempts: 5,
            },
            capture: CaptureConfig {
                sample_rate: 16_000,
                channels: 1,
                frame_samples: 4096,
            },
            playback: PlaybackConfig {
                quiet_window_ms: 320,
            },
        }
    }
}

impl ClientConfig {
    /// Load configuration from defaults, `voice-channel.toml` and `VOICE_*` variables.
    pub fn load() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&ClientConfig::default())?)
            .add_source(config::File::with_name("voice-channel").required(false))
            .add_source(
                config::Environment::with_prefix("VOICE")
                    .prefix_separator("_")
                    .separator("__"),
            );

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let base = self.server.base_url.trim();
        if base.is_empty() {
            return Err(anyhow::anyhow!("Server base_url cannot be empty"));
        }
        if !(base.starts_with("ws://") || base.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Server base_url must use ws:// or wss://, got {}",
                base
            ));
        }

        if self.transport.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval must be greater than 0"));
        }
        if self.transport.reconnect_delay_ms == 0 {
            return Err(anyhow::anyhow!("Reconnect delay must be greater than 0"));
        }

        if self.capture.sample_rate == 0 {
            return Err(anyhow::anyhow!("Capture sample rate must be greater than 0"));
        }
        if self.capture.channels == 0 {
            return Err(anyhow::anyhow!("Capture channel count must be greater than 0"));
        }
        if self.capture.frame_samples == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.playback.quiet_window_ms == 0 {
            return Err(anyhow::anyhow!("Playback quiet window must be greater than 0"));
        }

        Ok(())
    }

    /// Transport session settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            base_url: self.server.base_url.clone(),
            openid: self.server.openid.clone(),
            ai_session_id: self.server.ai_session_id.clone(),
            mode: self.server.mode,
            heartbeat_interval: Duration::from_millis(self.transport.heartbeat_interval_ms),
            reconnect_delay: Duration::from_millis(self.transport.reconnect_delay_ms),
            max_reconnect_attempts: self.transport.max_reconnect_attempts,
        }
    }

    /// Requested microphone format.
    pub fn capture_format(&self) -> CaptureFormat {
        CaptureFormat {
            sample_rate: self.capture.sample_rate,
            channels: self.capture.channels,
            frame_samples: self.capture.frame_samples,
        }
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.playback.quiet_window_ms)
    }
}

/// New conversation id of the form `session_<millis>_<random>`.
pub fn generate_session_id() -> String {
    let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(9).collect();
    format!("session_{}_{}", chrono::Utc::now().timestamp_millis(), suffix)
}
