//! # Transport Session
//!
//! One full-duplex connection to the conversation server, multiplexing text, control,
//! image and audio traffic.
//!
//! ## Components:
//! - [`message`]: message model, wire envelope and inbound classification
//! - [`connector`]: the socket seam and its WebSocket implementation
//! - [`session`]: connect/disconnect, sends, heartbeat, reconnection and observers
//!
//! ## Endpoint:
//! `<base_url><mode path>?openid=<id>&aiSessionId=<id>`, where the mode path is `/ws/chat`
//! for text conversations and `/ws/voice` for calls.

pub mod connector;
pub mod message;
pub mod session;

pub use connector::{Connection, Connector, WsConnector};
pub use message::{
    classify, ControlCommand, Envelope, Frame, Inbound, Message, MessageKind, Origin, Payload,
};
pub use session::{ConnectionEvent, ConnectionState, Session};

use crate::error::ChannelResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Conversation mode, selects the endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Text,
    Voice,
}

impl ChatMode {
    pub fn path(&self) -> &'static str {
        match self {
            ChatMode::Text => "/ws/chat",
            ChatMode::Voice => "/ws/voice",
        }
    }
}

/// Everything a [`Session`] needs to reach the server.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub base_url: String,
    pub openid: String,
    pub ai_session_id: String,
    pub mode: ChatMode,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl SessionConfig {
    /// Full endpoint URL. Empty ids are left out of the query string and a base URL that
    /// already ends with the mode path is used as is.
    pub fn endpoint_url(&self) -> ChannelResult<String> {
        let base = self.base_url.trim().trim_end_matches('/');
        let path = self.mode.path();
        let endpoint = if base.ends_with(path) {
            base.to_string()
        } else {
            format!("{}{}", base, path)
        };

        let mut url = Url::parse(&endpoint)?;
        let params: Vec<(&str, &str)> = [
            ("openid", self.openid.as_str()),
            ("aiSessionId", self.ai_session_id.as_str()),
        ]
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .collect();

        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        Ok(url.to_string())
    }
}
