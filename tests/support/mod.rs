//! In-memory doubles for the connector, input device and renderer seams.

#![allow(dead_code)]

use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use voice_channel::call::{CallCoordinator, CallState, ReplyUpdate};
use voice_channel::capture::{CaptureFormat, DeviceFormat, InputDevice, InputEvent, OpenedInput};
use voice_channel::config::ClientConfig;
use voice_channel::error::{ChannelError, ChannelResult};
use voice_channel::playback::AudioRenderer;
use voice_channel::transport::{Connection, Connector, Frame};

/// Server side of one in-memory connection.
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<Frame>,
    pub from_client: mpsc::UnboundedReceiver<Frame>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        self.to_client.send(Frame::Text(text.to_string())).unwrap();
    }

    pub fn send_audio(&self, bytes: Vec<u8>) {
        self.to_client.send(Frame::Binary(bytes)).unwrap();
    }

    /// Everything the client has sent so far.
    pub fn drain(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.from_client.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Control tokens among the frames sent so far.
    pub fn controls(&mut self) -> Vec<String> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(json) => {
                    let value: serde_json::Value = serde_json::from_str(&json).ok()?;
                    (value["type"] == "CONTROL").then(|| value["content"].as_str().unwrap().to_string())
                }
                Frame::Binary(_) => None,
            })
            .collect()
    }

    /// Number of binary (audio) frames sent so far.
    pub fn audio_frames(&mut self) -> Vec<Vec<u8>> {
        self.drain()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Binary(bytes) => Some(bytes),
                Frame::Text(_) => None,
            })
            .collect()
    }

    /// Whether the client side has released the connection.
    pub async fn is_closed(&mut self) -> bool {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), self.from_client.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }
}

/// Accepts the first `accept` opens, refuses the rest.
pub struct FakeConnector {
    accept: usize,
    opens: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl Connector for FakeConnector {
    fn open(&self, _url: &str) -> BoxFuture<'static, ChannelResult<Connection>> {
        let accept = self.opens.fetch_add(1, Ordering::SeqCst) < self.accept;
        let servers = self.servers.clone();
        Box::pin(async move {
            if !accept {
                return Err(ChannelError::Connectivity("connection refused".to_string()));
            }
            let (to_client, inbound) = mpsc::unbounded_channel();
            let (outbound, from_client) = mpsc::unbounded_channel();
            let _ = servers.send(ServerEnd { to_client, from_client });
            Ok(Connection { outbound, inbound })
        })
    }
}

struct ReleaseFlag(Arc<AtomicBool>);

impl Drop for ReleaseFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// 16 kHz mono microphone driven by the test.
pub struct FakeInput {
    available: bool,
    events: Mutex<Option<mpsc::UnboundedSender<InputEvent>>>,
    pub released: Arc<AtomicBool>,
}

impl FakeInput {
    pub fn push(&self, event: InputEvent) {
        if let Some(events) = self.events.lock().unwrap().as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn speak(&self, samples: usize) {
        self.push(InputEvent::Samples(vec![0.25; samples]));
    }
}

impl InputDevice for FakeInput {
    fn open(
        &self,
        _format: &CaptureFormat,
        events: mpsc::UnboundedSender<InputEvent>,
    ) -> BoxFuture<'static, ChannelResult<OpenedInput>> {
        let result = if self.available {
            *self.events.lock().unwrap() = Some(events);
            self.released.store(false, Ordering::SeqCst);
            Ok(OpenedInput {
                format: DeviceFormat {
                    sample_rate: 16_000,
                    channels: 1,
                },
                guard: Box::new(ReleaseFlag(Arc::clone(&self.released))),
            })
        } else {
            Err(ChannelError::Capability("microphone permission denied".to_string()))
        };
        Box::pin(async move { result })
    }
}

/// Plays every unit for a fixed time.
pub struct FakeRenderer {
    play_time: Duration,
    pub units: Mutex<Vec<Vec<u8>>>,
    pub halts: AtomicUsize,
    volume: Mutex<f32>,
}

impl AudioRenderer for FakeRenderer {
    fn render(&self, unit: Vec<u8>) -> BoxFuture<'static, ChannelResult<()>> {
        self.units.lock().unwrap().push(unit);
        let play_time = self.play_time;
        Box::pin(async move {
            tokio::time::sleep(play_time).await;
            Ok(())
        })
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
    }

    fn set_volume(&self, volume: f32) {
        *self.volume.lock().unwrap() = volume;
    }

    fn volume(&self) -> f32 {
        *self.volume.lock().unwrap()
    }
}

pub struct Harness {
    pub call: CallCoordinator,
    pub connector: Arc<FakeConnector>,
    pub servers: mpsc::UnboundedReceiver<ServerEnd>,
    pub input: Arc<FakeInput>,
    pub renderer: Arc<FakeRenderer>,
    pub states: Arc<Mutex<Vec<CallState>>>,
    pub errors: Arc<Mutex<Vec<ChannelError>>>,
    pub replies: Arc<Mutex<Vec<ReplyUpdate>>>,
    pub recognition: Arc<Mutex<Vec<String>>>,
}

impl Harness {
    pub async fn server(&mut self) -> ServerEnd {
        self.servers.recv().await.unwrap()
    }
}

/// A call wired to fakes. `accept` bounds how many connection attempts succeed.
pub fn harness(accept: usize, microphone: bool) -> Harness {
    let (servers_tx, servers) = mpsc::unbounded_channel();
    let connector = Arc::new(FakeConnector {
        accept,
        opens: AtomicUsize::new(0),
        servers: servers_tx,
    });
    let input = Arc::new(FakeInput {
        available: microphone,
        events: Mutex::new(None),
        released: Arc::new(AtomicBool::new(false)),
    });
    let renderer = Arc::new(FakeRenderer {
        play_time: Duration::from_millis(1_000),
        units: Mutex::new(Vec::new()),
        halts: AtomicUsize::new(0),
        volume: Mutex::new(1.0),
    });

    let mut config = ClientConfig::default();
    config.server.openid = "test-user".to_string();

    let call = CallCoordinator::from_config(&config, connector.clone(), input.clone(), renderer.clone());

    let states = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(Mutex::new(Vec::new()));
    let replies = Arc::new(Mutex::new(Vec::new()));
    let recognition = Arc::new(Mutex::new(Vec::new()));

    {
        let states = Arc::clone(&states);
        call.on_state_change(move |state: &CallState| states.lock().unwrap().push(*state));
    }
    {
        let errors = Arc::clone(&errors);
        call.on_error(move |error: &ChannelError| errors.lock().unwrap().push(error.clone()));
    }
    {
        let replies = Arc::clone(&replies);
        call.on_reply(move |update: &ReplyUpdate| replies.lock().unwrap().push(update.clone()));
    }
    {
        let recognition = Arc::clone(&recognition);
        call.on_recognition(move |text: &String| recognition.lock().unwrap().push(text.clone()));
    }

    Harness {
        call,
        connector,
        servers,
        input,
        renderer,
        states,
        errors,
        replies,
        recognition,
    }
}

/// Let spawned tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// A fragment that starts with an MP3 frame sync.
pub fn mp3(len: usize) -> Vec<u8> {
    let mut bytes = vec![0x55; len];
    bytes[0] = 0xFF;
    bytes[1] = 0xFB;
    bytes
}
