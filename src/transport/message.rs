//! # Wire Messages
//!
//! Message model shared by the session and its subscribers, plus the JSON envelope used on
//! the wire and the classifier that turns raw socket frames into messages.
//!
//! ## Wire Format:
//! ```json
//! { "type": "TEXT" | "AUDIO" | "CONTROL" | "ERROR" | "IMAGES" | "PING" | "PONG",
//!   "content": "...", "sender": "user" | "system" | "assistant",
//!   "timestamp": 1700000000000, "id": "..." }
//! ```
//!
//! ## Classification Rules:
//! 1. **Binary frames** are always assistant audio, no envelope
//! 2. **Text frames** that are not JSON objects become plain text messages
//! 3. **PING / PONG** envelopes are heartbeat traffic and never reach subscribers
//! 4. **Other envelopes** are normalized into the matching [`Payload`] variant
//! 5. Objects whose `type` or `content` fail to normalize are protocol errors, the frame
//!    is discarded. Unusable `sender`, `timestamp` or `id` values fall back to defaults

use crate::error::{ChannelError, ChannelResult};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One socket frame, as produced or consumed by a [`Connector`](super::Connector).
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Envelope `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Text,
    Audio,
    Control,
    Error,
    Images,
    Ping,
    Pong,
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    User,
    System,
    #[serde(alias = "ai")]
    Assistant,
}

/// Session-level command tokens carried in CONTROL envelopes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    OpenWebsocket,
    CloseWebsocket,
    StartRecording,
    StopRecording,
    StartRecognition,
    Interrupt,
    VoiceCallRequest,
    VoiceCallAccept,
    VoiceCallReject,
    VoiceCallEnd,
    /// Any token outside the known vocabulary, kept verbatim
    Other(String),
}

impl ControlCommand {
    pub fn as_str(&self) -> &str {
        match self {
            ControlCommand::OpenWebsocket => "open_websocket",
            ControlCommand::CloseWebsocket => "close_websocket",
            ControlCommand::StartRecording => "start_recording",
            ControlCommand::StopRecording => "stop_recording",
            ControlCommand::StartRecognition => "start_recognition",
            ControlCommand::Interrupt => "interrupt",
            ControlCommand::VoiceCallRequest => "voice_call_request",
            ControlCommand::VoiceCallAccept => "voice_call_accept",
            ControlCommand::VoiceCallReject => "voice_call_reject",
            ControlCommand::VoiceCallEnd => "voice_call_end",
            ControlCommand::Other(token) => token,
        }
    }
}

impl From<&str> for ControlCommand {
    fn from(token: &str) -> Self {
        match token {
            "open_websocket" => ControlCommand::OpenWebsocket,
            "close_websocket" => ControlCommand::CloseWebsocket,
            "start_recording" => ControlCommand::StartRecording,
            "stop_recording" => ControlCommand::StopRecording,
            "start_recognition" => ControlCommand::StartRecognition,
            "interrupt" => ControlCommand::Interrupt,
            "voice_call_request" => ControlCommand::VoiceCallRequest,
            "voice_call_accept" => ControlCommand::VoiceCallAccept,
            "voice_call_reject" => ControlCommand::VoiceCallReject,
            "voice_call_end" => ControlCommand::VoiceCallEnd,
            other => ControlCommand::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message body. The shape is fixed per tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Audio(Vec<u8>),
    Control(ControlCommand),
    Error { code: String, message: String },
    Images(Vec<String>),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Text(_) => MessageKind::Text,
            Payload::Audio(_) => MessageKind::Audio,
            Payload::Control(_) => MessageKind::Control,
            Payload::Error { .. } => MessageKind::Error,
            Payload::Images(_) => MessageKind::Images,
        }
    }
}

/// A classified message with its origin, timestamp (unix millis) and correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub payload: Payload,
    pub sender: Origin,
    pub timestamp: i64,
    pub id: String,
    /// `true` on the session's local echo of a message we sent
    pub local: bool,
}

impl Message {
    /// Stamp a payload with the current time and a fresh id.
    pub fn new(payload: Payload, sender: Origin) -> Self {
        Self {
            payload,
            sender,
            timestamp: now_millis(),
            id: new_message_id(),
            local: false,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Text, image and audio messages are shown in a conversation view; control and
    /// error traffic is not.
    pub fn is_displayable(&self) -> bool {
        matches!(
            self.payload,
            Payload::Text(_) | Payload::Images(_) | Payload::Audio(_)
        )
    }

    pub fn text_content(&self) -> Option<&str> {
        match &self.payload {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// JSON envelope as it travels over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Origin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Heartbeat probe, `{"type":"PING"}`.
    pub fn ping() -> Self {
        Self {
            kind: MessageKind::Ping,
            content: Value::Null,
            sender: None,
            timestamp: None,
            id: None,
        }
    }

    /// CONTROL envelope carrying the bare token. The server expects no timestamp or id.
    pub fn control(command: &ControlCommand) -> Self {
        Self {
            kind: MessageKind::Control,
            content: Value::String(command.as_str().to_string()),
            sender: Some(Origin::User),
            timestamp: None,
            id: None,
        }
    }

    /// Full envelope for a locally produced message. Audio has no JSON form, it always
    /// travels as a binary frame.
    pub fn from_message(message: &Message) -> Option<Self> {
        let content = match &message.payload {
            Payload::Text(text) => Value::String(text.clone()),
            Payload::Control(command) => Value::String(command.as_str().to_string()),
            Payload::Error { code, message } => {
                serde_json::json!({ "code": code, "message": message })
            }
            Payload::Images(urls) => {
                Value::Array(urls.iter().cloned().map(Value::String).collect())
            }
            Payload::Audio(_) => return None,
        };

        Some(Self {
            kind: message.kind(),
            content,
            sender: Some(message.sender),
            timestamp: Some(message.timestamp),
            id: Some(message.id.clone()),
        })
    }

    pub fn to_json(&self) -> ChannelResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of classifying one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    /// Heartbeat acknowledgement from the server
    Pong,
    /// Heartbeat probe from the server
    Ping,
}

/// Classify one inbound frame.
pub fn classify(frame: Frame) -> ChannelResult<Inbound> {
    match frame {
        Frame::Binary(bytes) => Ok(Inbound::Message(Message::new(
            Payload::Audio(bytes),
            Origin::Assistant,
        ))),
        Frame::Text(text) => classify_text(text),
    }
}

fn classify_text(text: String) -> ChannelResult<Inbound> {
    let mut fields = match serde_json::from_str::<Value>(&text) {
        Ok(Value::Object(fields)) => fields,
        // Anything that is not a JSON object is plain server text
        _ => {
            return Ok(Inbound::Message(Message::new(
                Payload::Text(text),
                Origin::Assistant,
            )))
        }
    };

    let kind: MessageKind = match fields.remove("type") {
        Some(kind) => serde_json::from_value(kind)?,
        None => return Err(ChannelError::Protocol("Envelope without type".to_string())),
    };
    let content = fields.remove("content").unwrap_or(Value::Null);

    let payload = match kind {
        MessageKind::Pong => return Ok(Inbound::Pong),
        MessageKind::Ping => return Ok(Inbound::Ping),
        MessageKind::Text => Payload::Text(text_content(content)?),
        MessageKind::Audio => Payload::Audio(audio_content(content)?),
        MessageKind::Control => Payload::Control(control_content(content)?),
        MessageKind::Error => error_content(content),
        MessageKind::Images => Payload::Images(image_content(content)?),
    };

    // Metadata never invalidates an otherwise valid envelope
    Ok(Inbound::Message(Message {
        payload,
        sender: fields
            .remove("sender")
            .and_then(|sender| serde_json::from_value(sender).ok())
            .unwrap_or(Origin::Assistant),
        timestamp: fields
            .get("timestamp")
            .and_then(|ts| ts.as_i64().or_else(|| ts.as_f64().map(|ts| ts.round() as i64)))
            .unwrap_or_else(now_millis),
        id: match fields.remove("id") {
            Some(Value::String(id)) if !id.is_empty() => id,
            Some(Value::Number(id)) => id.to_string(),
            _ => new_message_id(),
        },
        local: false,
    }))
}

fn text_content(content: Value) -> ChannelResult<String> {
    match content {
        Value::String(text) => Ok(text),
        Value::Null => Err(ChannelError::Protocol("TEXT envelope without content".to_string())),
        other => Ok(other.to_string()),
    }
}

/// Byte array, or a base64 string.
fn audio_content(content: Value) -> ChannelResult<Vec<u8>> {
    if let Value::String(encoded) = &content {
        return BASE64.decode(encoded.as_bytes()).map_err(|e| {
            ChannelError::Protocol(format!("AUDIO envelope content is not valid base64: {}", e))
        });
    }

    serde_json::from_value::<Vec<u8>>(content).map_err(|_| {
        ChannelError::Protocol("AUDIO envelope content must be a byte array or base64".to_string())
    })
}

fn control_content(content: Value) -> ChannelResult<ControlCommand> {
    let token = match &content {
        Value::String(token) => Some(token.as_str()),
        Value::Object(map) => map.get("command").and_then(Value::as_str),
        _ => None,
    };

    token
        .map(ControlCommand::from)
        .ok_or_else(|| ChannelError::Protocol(format!("CONTROL envelope without command: {}", content)))
}

fn error_content(content: Value) -> Payload {
    match content {
        Value::String(message) => Payload::Error {
            code: "server_error".to_string(),
            message,
        },
        Value::Object(map) => Payload::Error {
            code: map
                .get("code")
                .map(|code| match code {
                    Value::String(code) => code.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "server_error".to_string()),
            message: map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Unknown error")
                .to_string(),
        },
        _ => Payload::Error {
            code: "server_error".to_string(),
            message: "Unknown error".to_string(),
        },
    }
}

fn image_content(content: Value) -> ChannelResult<Vec<String>> {
    let list = match content {
        Value::Array(_) => content,
        Value::Object(mut map) => map
            .remove("urls")
            .or_else(|| map.remove("images"))
            .unwrap_or(Value::Null),
        _ => Value::Null,
    };

    serde_json::from_value::<Vec<String>>(list).map_err(|_| {
        ChannelError::Protocol("IMAGES envelope content must be a list of URLs".to_string())
    })
}

pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
