use std::fmt;

/// Call lifecycle: `idle → connecting → connected → talking ⇄ listening`, with `error`
/// reachable from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Connecting,
    Connected,
    /// Microphone frames are flowing to the server
    Talking,
    /// Capture is paused while the assistant speaks
    Listening,
    Error,
}

impl CallState {
    /// Any state between a successful `start_call()` and `end_call()`/failure.
    pub fn is_in_call(&self) -> bool {
        !matches!(self, CallState::Idle | CallState::Error)
    }

    /// States in which the microphone can be paused or resumed.
    pub fn has_capture(&self) -> bool {
        matches!(
            self,
            CallState::Connected | CallState::Talking | CallState::Listening
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "idle",
            CallState::Connecting => "connecting",
            CallState::Connected => "connected",
            CallState::Talking => "talking",
            CallState::Listening => "listening",
            CallState::Error => "error",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
