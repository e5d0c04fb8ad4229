//! # voice-channel
//!
//! Client side of a real-time voice and text conversation channel.
//!
//! ## Architecture:
//! - **transport**: one WebSocket session carrying text, control and audio frames, with
//!   heartbeat and reconnection
//! - **capture**: microphone input converted to 16 kHz mono s16le frames
//! - **playback**: streamed MP3 fragments coalesced into units and played in order
//! - **call**: the call state machine wiring the three together
//! - **config** / **error** / **observer**: configuration, error taxonomy and the
//!   subscriber registry shared by every component

pub mod call;
pub mod capture;
pub mod config;
pub mod error;
pub mod observer;
pub mod playback;
pub mod transport;

pub use call::{CallCoordinator, CallState, ReplyUpdate};
pub use config::ClientConfig;
pub use error::{ChannelError, ChannelResult};
pub use observer::{Observers, Subscription};
pub use transport::{ConnectionEvent, ControlCommand, Message, Payload, Session};
