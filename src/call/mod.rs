//! # Voice Call
//!
//! ## Components:
//! - [`state`]: the call state machine's states
//! - [`reply`]: the `ai:` / `ai_reply_complete` streaming reply protocol
//! - [`coordinator`]: lifecycle commands and notification channels

pub mod coordinator;
pub mod reply;
pub mod state;

pub use coordinator::CallCoordinator;
pub use reply::{ReplyAssembler, ReplySignal, ReplyUpdate};
pub use state::CallState;
