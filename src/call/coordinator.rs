//! # Call Coordinator
//!
//! Top-level state machine tying the session, the capture pipeline and the playback
//! aggregator together for one voice call.
//!
//! ## Wiring:
//! - Capture frames go to `Session::send_audio` while the session is connected
//! - Inbound audio goes to the aggregator and pauses capture (half-duplex turn-taking)
//! - Inbound text feeds the streaming reply protocol or the recognition channel
//! - `start_recording` / `stop_recording` control tokens resume / pause capture
//!
//! ## Failure Handling:
//! A terminal error (server ERROR message, lost device, reconnect exhaustion, failed
//! start) releases capture, playback and the session, then moves the call to `error`.
//! Protocol and playback errors are only reported.

use super::reply::{ReplyAssembler, ReplySignal, ReplyUpdate};
use super::state::CallState;
use crate::capture::{CapturePipeline, FrameSink, InputDevice};
use crate::config::ClientConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::observer::{Observers, Subscription};
use crate::playback::{Aggregator, AudioRenderer, PlaybackEvent};
use crate::transport::{
    ChatMode, ConnectionEvent, Connector, ControlCommand, Message, Payload, Session,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info, warn};

/// Handle to one call. Clones share the same call.
#[derive(Clone)]
pub struct CallCoordinator {
    inner: Arc<CallInner>,
}

struct CallInner {
    session: Session,
    capture: CapturePipeline,
    playback: Aggregator,
    core: Mutex<CallCore>,
    states: Observers<CallState>,
    recognition: Observers<String>,
    replies: Observers<ReplyUpdate>,
    errors: Observers<ChannelError>,
    playback_events: Observers<PlaybackEvent>,
    /// Hooks into the session and aggregator, removed when the call is dropped
    wiring: Mutex<Vec<Subscription>>,
}

struct CallCore {
    state: CallState,
    reply: ReplyAssembler,
    /// Bumped by every start and end so an outdated `start_call` can tell it lost
    generation: u64,
}

impl CallCoordinator {
    /// Wire up a call from already-built components. Must be called inside a tokio
    /// runtime.
    pub fn new(session: Session, capture: CapturePipeline, playback: Aggregator) -> Self {
        let inner = Arc::new(CallInner {
            session,
            capture,
            playback,
            core: Mutex::new(CallCore {
                state: CallState::Idle,
                reply: ReplyAssembler::default(),
                generation: 0,
            }),
            states: Observers::new("call.states"),
            recognition: Observers::new("call.recognition"),
            replies: Observers::new("call.replies"),
            errors: Observers::new("call.errors"),
            playback_events: Observers::new("call.playback"),
            wiring: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let wiring = vec![
            inner.session.on_message({
                let call = Weak::clone(&weak);
                move |message: &Message| {
                    if let Some(call) = call.upgrade() {
                        call.handle_message(message);
                    }
                }
            }),
            inner.session.on_connection({
                let call = Weak::clone(&weak);
                move |event: &ConnectionEvent| {
                    if let Some(call) = call.upgrade() {
                        call.handle_connection(*event);
                    }
                }
            }),
            inner.session.on_error({
                let call = Weak::clone(&weak);
                move |error: &ChannelError| {
                    if let Some(call) = call.upgrade() {
                        call.handle_error(error.clone());
                    }
                }
            }),
            inner.playback.on_event({
                let call = Weak::clone(&weak);
                move |event: &PlaybackEvent| {
                    if let Some(call) = call.upgrade() {
                        call.playback_events.notify(event);
                        if let PlaybackEvent::UnitFailed { error, .. } = event {
                            call.handle_error(error.clone());
                        }
                    }
                }
            }),
        ];
        *inner.wiring() = wiring;

        Self { inner }
    }

    /// Build a voice call and its components from configuration and platform seams.
    pub fn from_config(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        input: Arc<dyn InputDevice>,
        renderer: Arc<dyn AudioRenderer>,
    ) -> Self {
        let mut session_config = config.session_config();
        if session_config.mode != ChatMode::Voice {
            warn!("Calls always use the voice endpoint, ignoring mode {:?}", session_config.mode);
            session_config.mode = ChatMode::Voice;
        }

        Self::new(
            Session::new(session_config, connector),
            CapturePipeline::new(input, config.capture_format()),
            Aggregator::new(renderer, config.quiet_window()),
        )
    }

    /// Connect and start talking.
    ///
    /// Accepted from `idle` and `error`; from any other state it is a no-op. Any failure
    /// moves the call to `error`, is reported to error subscribers and is returned.
    pub async fn start_call(&self) -> ChannelResult<()> {
        let inner = &self.inner;

        let (generation, previous) = {
            let mut core = inner.core();
            if core.state.is_in_call() {
                warn!("Call already {}, ignoring start", core.state);
                return Ok(());
            }
            core.generation += 1;
            core.reply.clear();
            let previous = std::mem::replace(&mut core.state, CallState::Connecting);
            (core.generation, previous)
        };
        inner.announce(previous, CallState::Connecting);

        // Leftovers from a failed call
        inner.capture.stop();
        inner.playback.stop();

        if let Err(e) = inner.session.connect().await {
            inner.fail_generation(generation, e.clone());
            return Err(e);
        }

        if !inner.is_generation(generation) {
            debug!("Call ended while connecting");
            return Ok(());
        }

        let sink: Arc<dyn FrameSink> = Arc::new(CallSink {
            call: Arc::downgrade(inner),
        });
        if let Err(e) = inner.capture.start(sink).await {
            inner.session.disconnect();
            inner.fail_generation(generation, e.clone());
            return Err(e);
        }

        if !inner.is_generation(generation) {
            inner.capture.stop();
            debug!("Call ended while starting capture");
            return Ok(());
        }

        inner.set_state(CallState::Talking);
        info!("Voice call started");
        Ok(())
    }

    /// Hang up. Safe from any state.
    pub fn end_call(&self) {
        self.inner.end_call();
    }

    /// Cut the assistant off: drop its audio and partial reply, tell the server, and
    /// hand the turn back to the microphone.
    pub fn interrupt(&self) {
        let inner = &self.inner;
        inner.playback.stop();
        inner.core().reply.clear();

        if inner.session.is_connected() {
            inner.session.send_control(ControlCommand::Interrupt);
        }
        inner.resume_recording();
    }

    pub fn pause_recording(&self) {
        self.inner.pause_recording();
    }

    pub fn resume_recording(&self) {
        self.inner.resume_recording();
    }

    pub fn state(&self) -> CallState {
        self.inner.core().state
    }

    pub fn is_in_call(&self) -> bool {
        self.state().is_in_call()
    }

    /// Output volume in `[0.0, 1.0]`.
    pub fn set_volume(&self, volume: f32) {
        self.inner.playback.set_volume(volume);
    }

    pub fn get_volume(&self) -> f32 {
        self.inner.playback.volume()
    }

    /// The underlying session, for text and image messages during a call.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn on_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&CallState) + Send + Sync + 'static,
    {
        self.inner.states.subscribe(callback)
    }

    /// Recognized user speech.
    pub fn on_recognition<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.inner.recognition.subscribe(callback)
    }

    /// Streaming assistant reply: running text, then the final text once complete.
    pub fn on_reply<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ReplyUpdate) + Send + Sync + 'static,
    {
        self.inner.replies.subscribe(callback)
    }

    pub fn on_error<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ChannelError) + Send + Sync + 'static,
    {
        self.inner.errors.subscribe(callback)
    }

    pub fn on_playback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PlaybackEvent) + Send + Sync + 'static,
    {
        self.inner.playback_events.subscribe(callback)
    }

    /// End the call and detach every subscriber. The coordinator itself stays usable.
    pub fn destroy(&self) {
        self.inner.end_call();
        self.inner.states.clear();
        self.inner.recognition.clear();
        self.inner.replies.clear();
        self.inner.errors.clear();
        self.inner.playback_events.clear();
        debug!("Call coordinator destroyed");
    }
}

impl CallInner {
    fn core(&self) -> MutexGuard<'_, CallCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wiring(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.wiring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_generation(&self, generation: u64) -> bool {
        self.core().generation == generation
    }

    fn set_state(&self, state: CallState) {
        let previous = std::mem::replace(&mut self.core().state, state);
        self.announce(previous, state);
    }

    fn announce(&self, previous: CallState, state: CallState) {
        if previous != state {
            info!("Call state: {} -> {}", previous, state);
            self.states.notify(&state);
        }
    }

    fn end_call(&self) {
        {
            let mut core = self.core();
            core.generation += 1;
            core.reply.clear();
        }

        self.capture.stop();
        self.playback.stop();
        if self.session.is_connected() {
            self.session.send_control(ControlCommand::CloseWebsocket);
        }
        self.session.disconnect();

        self.set_state(CallState::Idle);
        info!("Voice call ended");
    }

    fn pause_recording(&self) {
        if !self.core().state.has_capture() {
            debug!("No active capture to pause");
            return;
        }
        self.capture.pause();
        self.set_state(CallState::Listening);
    }

    fn resume_recording(&self) {
        if !self.core().state.has_capture() {
            debug!("No active capture to resume");
            return;
        }
        self.capture.resume();
        self.set_state(CallState::Talking);
    }

    fn handle_message(&self, message: &Message) {
        // Echoes of our own sends
        if message.local {
            return;
        }

        match &message.payload {
            Payload::Audio(bytes) => self.handle_audio(bytes),
            Payload::Text(text) => self.handle_text(text),
            Payload::Control(command) => self.handle_control(command),
            Payload::Error { code, message } => self.handle_error(ChannelError::Application {
                code: code.clone(),
                message: message.clone(),
            }),
            Payload::Images(urls) => debug!("Ignoring {} image(s) during call", urls.len()),
        }
    }

    fn handle_audio(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            warn!("Empty audio frame, skipping");
            return;
        }

        let state = self.core().state;
        if !state.is_in_call() {
            debug!("Audio received outside a call, skipping");
            return;
        }

        self.playback.ingest(bytes.to_vec());
        if state == CallState::Talking {
            self.pause_recording();
        }
    }

    fn handle_text(&self, text: &str) {
        match ReplySignal::parse(text) {
            ReplySignal::Fragment(fragment) => {
                let update = self.core().reply.push(fragment);
                self.replies.notify(&update);
            }
            ReplySignal::Complete => {
                let update = self.core().reply.complete();
                debug!("Reply complete ({} chars)", update.text.len());
                self.replies.notify(&update);
            }
            ReplySignal::Other(text) => self.recognition.notify(&text.to_string()),
        }
    }

    fn handle_control(&self, command: &ControlCommand) {
        match command {
            ControlCommand::StartRecording => self.resume_recording(),
            ControlCommand::StopRecording => self.pause_recording(),
            ControlCommand::Other(token) if token == "connected" => {
                debug!("Server acknowledged the connection");
            }
            other => info!("Control received: {}", other),
        }
    }

    fn handle_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened => {
                if self.core().state != CallState::Connecting {
                    return;
                }
                self.set_state(CallState::Connected);
                self.session.send_control(ControlCommand::OpenWebsocket);

                // Back from a reconnect: capture kept running, restore the turn
                if self.capture.is_recording() {
                    let resumed = if self.capture.is_paused() {
                        CallState::Listening
                    } else {
                        CallState::Talking
                    };
                    self.set_state(resumed);
                }
            }
            ConnectionEvent::Closed { by_operator: true } => {}
            ConnectionEvent::Closed { by_operator: false } => {
                if self.core().state.has_capture() {
                    warn!("Connection lost mid-call, waiting for reconnect");
                    self.set_state(CallState::Connecting);
                }
            }
        }
    }

    fn handle_error(&self, error: ChannelError) {
        if error.is_terminal() {
            self.fail(error);
        } else {
            warn!("Call reported error: {}", error);
            self.errors.notify(&error);
        }
    }

    fn fail_generation(&self, generation: u64, error: ChannelError) {
        if self.is_generation(generation) {
            self.fail(error);
        } else {
            debug!("Ignoring failure of an ended call: {}", error);
        }
    }

    /// Release everything and enter `error`.
    fn fail(&self, error: ChannelError) {
        error!("Call failed: {}", error);
        {
            let mut core = self.core();
            core.generation += 1;
            core.reply.clear();
        }

        self.capture.stop();
        self.playback.stop();
        self.session.disconnect();

        self.set_state(CallState::Error);
        self.errors.notify(&error);
    }
}

impl Drop for CallInner {
    fn drop(&mut self) {
        let wiring = std::mem::take(self.wiring.get_mut().unwrap_or_else(PoisonError::into_inner));
        for subscription in wiring {
            subscription.unsubscribe();
        }
    }
}

/// Forwards capture output to the session.
struct CallSink {
    call: Weak<CallInner>,
}

impl FrameSink for CallSink {
    fn on_frame(&self, frame: Vec<u8>) {
        if let Some(call) = self.call.upgrade() {
            if call.session.is_connected() {
                call.session.send_audio(frame);
            }
        }
    }

    fn on_device_lost(&self, reason: &str) {
        if let Some(call) = self.call.upgrade() {
            if call.core().state.is_in_call() {
                call.fail(ChannelError::Capability(format!("Input device lost: {}", reason)));
            }
        }
    }
}
