//! # Streaming Reply Protocol
//!
//! In a call the server streams the assistant's answer as plain text frames:
//! - `ai:<fragment>`: the next piece of the reply
//! - `ai_reply_complete`: the reply is finished
//! - anything else: recognized user speech
//!
//! [`ReplyAssembler`] accumulates fragments and produces the running text for
//! subscribers.

/// Prefix marking one streamed reply fragment.
pub const REPLY_PREFIX: &str = "ai:";

/// Marker ending the current reply.
pub const REPLY_COMPLETE: &str = "ai_reply_complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySignal<'a> {
    Fragment(&'a str),
    Complete,
    Other(&'a str),
}

impl<'a> ReplySignal<'a> {
    pub fn parse(text: &'a str) -> Self {
        if text == REPLY_COMPLETE {
            ReplySignal::Complete
        } else if let Some(fragment) = text.strip_prefix(REPLY_PREFIX) {
            ReplySignal::Fragment(fragment)
        } else {
            ReplySignal::Other(text)
        }
    }
}

/// Accumulated reply text delivered to reply subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyUpdate {
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Default)]
pub struct ReplyAssembler {
    buffer: String,
}

impl ReplyAssembler {
    /// Append a fragment and return the text so far.
    pub fn push(&mut self, fragment: &str) -> ReplyUpdate {
        self.buffer.push_str(fragment);
        ReplyUpdate {
            text: self.buffer.clone(),
            is_final: false,
        }
    }

    /// Take the finished reply, leaving the buffer empty.
    pub fn complete(&mut self) -> ReplyUpdate {
        ReplyUpdate {
            text: std::mem::take(&mut self.buffer),
            is_final: true,
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }
}
