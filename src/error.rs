//! # Error Handling
//!
//! Error taxonomy for the voice channel. Every failure the core can report falls into one
//! of a handful of categories, and the category decides what the call does about it.
//!
//! ## Error Categories:
//! - **Connectivity**: socket open/send failures, retried by the session up to its ceiling
//! - **Capability**: the microphone or speaker could not be acquired, never retried
//! - **Protocol**: a malformed inbound frame, logged and discarded
//! - **Playback**: one playable unit failed to render, the queue keeps draining
//! - **Application**: the server reported an error message
//!
//! ## Propagation:
//! Leaf components report expected failures through callbacks or `bool`/`Result` returns.
//! Only the terminal categories move a call into its `error` state, see
//! [`ChannelError::is_terminal`].

use thiserror::Error;

/// Errors produced by the transport, capture, playback and call layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The socket could not be opened or a frame could not be written.
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The session gave up after the configured number of reconnect attempts.
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// No audio device could be granted (or it disappeared mid-stream).
    #[error("Audio device unavailable: {0}")]
    Capability(String),

    /// The device was granted but its stream could not be built or started.
    #[error("Audio stream error: {0}")]
    AudioStream(String),

    /// An inbound frame could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A playable unit could not be decoded or rendered.
    #[error("Playback error: {0}")]
    Playback(String),

    /// The server sent an ERROR message.
    #[error("Server error [{code}]: {message}")]
    Application { code: String, message: String },

    /// Configuration values are missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ChannelError {
    /// Whether this error ends the call (moves the coordinator to `error`).
    ///
    /// Protocol and playback failures only affect one frame or one unit, so they are
    /// reported without touching call state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChannelError::Protocol(_) | ChannelError::Playback(_))
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Protocol(format!("JSON parsing error: {}", err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChannelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        ChannelError::Connectivity(err.to_string())
    }
}

impl From<url::ParseError> for ChannelError {
    fn from(err: url::ParseError) -> Self {
        ChannelError::Config(format!("Invalid endpoint URL: {}", err))
    }
}

impl From<config::ConfigError> for ChannelError {
    fn from(err: config::ConfigError) -> Self {
        ChannelError::Config(err.to_string())
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for ChannelError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        ChannelError::Capability(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for ChannelError {
    fn from(err: cpal::BuildStreamError) -> Self {
        ChannelError::AudioStream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for ChannelError {
    fn from(err: cpal::PlayStreamError) -> Self {
        ChannelError::AudioStream(err.to_string())
    }
}

/// Shorthand for results carrying a [`ChannelError`].
pub type ChannelResult<T> = Result<T, ChannelError>;
