//! # Fragment Aggregator
//!
//! Coalesces streamed MP3 fragments into playable units and plays them in order.
//!
//! ## Flush Rules:
//! - Every ingest (re)arms a quiet-window deadline measured from the latest fragment
//! - When the deadline passes, the buffered fragments are concatenated in arrival order
//!   into exactly one unit, and the buffer and deadline are cleared
//! - `force_flush()` does the same immediately; with nothing buffered it does nothing
//!
//! ## Queue Rules:
//! - Units render one at a time, in flush order
//! - A failed render is logged and the next unit starts anyway
//! - `stop()` discards the buffer, the queue and the unit being rendered
//!
//! All of this state lives in a single actor task, fed through a command channel, so
//! buffer, deadline and queue are never touched concurrently.

use super::looks_like_mp3;
use super::renderer::AudioRenderer;
use crate::error::{ChannelError, ChannelResult};
use crate::observer::{Observers, Subscription};
use futures_util::future::{BoxFuture, OptionFuture};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};

/// Progress notifications from the playback queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// A flush produced a unit; `pending` counts queued units not yet started
    UnitQueued { bytes: usize, pending: usize },
    UnitStarted { bytes: usize },
    UnitFinished { bytes: usize },
    UnitFailed { bytes: usize, error: ChannelError },
    /// The queue ran empty after playing at least one unit
    Drained,
}

enum Command {
    Ingest(Vec<u8>),
    ForceFlush,
    Stop,
}

struct Shared {
    renderer: Arc<dyn AudioRenderer>,
    playing: AtomicBool,
    events: Observers<PlaybackEvent>,
}

/// Handle to the aggregator actor. Dropping it shuts the actor down.
pub struct Aggregator {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Aggregator {
    /// Spawn the actor on the current tokio runtime.
    pub fn new(renderer: Arc<dyn AudioRenderer>, quiet_window: Duration) -> Self {
        let shared = Arc::new(Shared {
            renderer,
            playing: AtomicBool::new(false),
            events: Observers::new("playback.events"),
        });

        let (commands, command_rx) = mpsc::unbounded_channel();
        tokio::spawn(run(command_rx, Arc::clone(&shared), quiet_window));

        Self { commands, shared }
    }

    /// Buffer one fragment and re-arm the quiet-window deadline.
    pub fn ingest(&self, fragment: Vec<u8>) {
        self.send(Command::Ingest(fragment));
    }

    /// Flush whatever is buffered right now.
    pub fn force_flush(&self) {
        self.send(Command::ForceFlush);
    }

    /// Discard buffered and queued audio and halt the current unit.
    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    /// Whether a unit is rendering or queued.
    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::SeqCst)
    }

    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&PlaybackEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(callback)
    }

    pub fn set_volume(&self, volume: f32) {
        self.shared.renderer.set_volume(volume.clamp(0.0, 1.0));
    }

    pub fn volume(&self) -> f32 {
        self.shared.renderer.volume()
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Playback actor is gone, command dropped");
        }
    }
}

/// Actor-owned playback state.
struct Playback {
    shared: Arc<Shared>,
    quiet_window: Duration,
    buffer: Vec<Vec<u8>>,
    deadline: Option<Instant>,
    queue: VecDeque<Vec<u8>>,
    current: Option<(usize, BoxFuture<'static, ChannelResult<()>>)>,
}

async fn run(mut commands: mpsc::UnboundedReceiver<Command>, shared: Arc<Shared>, quiet_window: Duration) {
    let mut playback = Playback {
        shared,
        quiet_window,
        buffer: Vec::new(),
        deadline: None,
        queue: VecDeque::new(),
        current: None,
    };

    loop {
        let flush_at = playback.deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Ingest(fragment)) => playback.ingest(fragment),
                Some(Command::ForceFlush) => playback.flush(),
                Some(Command::Stop) => playback.stop(),
                None => break,
            },
            _ = time::sleep_until(flush_at), if playback.deadline.is_some() => {
                playback.flush();
            }
            Some(result) = OptionFuture::from(playback.current.as_mut().map(|(_, render)| render)) => {
                playback.finish(result);
            }
        }
    }

    playback.stop();
    debug!("Playback actor finished");
}

impl Playback {
    fn ingest(&mut self, fragment: Vec<u8>) {
        if fragment.is_empty() {
            return;
        }
        if !looks_like_mp3(&fragment) {
            warn!("Fragment of {} bytes does not start with an MP3 frame sync", fragment.len());
        }
        debug!("Buffered fragment of {} bytes ({} pending)", fragment.len(), self.buffer.len() + 1);
        self.buffer.push(fragment);
        self.deadline = Some(Instant::now() + self.quiet_window);
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let count = self.buffer.len();
        let unit = self.buffer.concat();
        self.buffer.clear();
        self.deadline = None;

        let bytes = unit.len();
        self.queue.push_back(unit);
        debug!("Flushed {} fragments into a {} byte unit", count, bytes);
        self.shared.events.notify(&PlaybackEvent::UnitQueued {
            bytes,
            pending: self.queue.len(),
        });

        self.advance();
    }

    /// Start the next unit if nothing is rendering.
    fn advance(&mut self) {
        if self.current.is_some() {
            return;
        }

        match self.queue.pop_front() {
            Some(unit) => {
                let bytes = unit.len();
                self.shared.playing.store(true, Ordering::SeqCst);
                self.shared.events.notify(&PlaybackEvent::UnitStarted { bytes });
                self.current = Some((bytes, self.shared.renderer.render(unit)));
            }
            None => {
                if self.shared.playing.swap(false, Ordering::SeqCst) {
                    self.shared.events.notify(&PlaybackEvent::Drained);
                }
            }
        }
    }

    fn finish(&mut self, result: ChannelResult<()>) {
        let Some((bytes, _)) = self.current.take() else {
            return;
        };

        match result {
            Ok(()) => {
                debug!("Unit of {} bytes finished", bytes);
                self.shared.events.notify(&PlaybackEvent::UnitFinished { bytes });
            }
            Err(error) => {
                error!("Failed to render unit of {} bytes: {}", bytes, error);
                self.shared.events.notify(&PlaybackEvent::UnitFailed { bytes, error });
            }
        }

        self.advance();
    }

    fn stop(&mut self) {
        self.buffer.clear();
        self.deadline = None;
        self.queue.clear();
        if self.current.take().is_some() {
            self.shared.renderer.halt();
        }
        if self.shared.playing.swap(false, Ordering::SeqCst) {
            debug!("Playback stopped, queue cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Renderer that "plays" each unit for a fixed time. Units starting with 0xEE fail.
    struct FakeRenderer {
        play_time: Duration,
        started: Arc<Mutex<Vec<(Instant, Vec<u8>)>>>,
        finished: Arc<Mutex<Vec<Instant>>>,
        halts: AtomicUsize,
    }

    impl FakeRenderer {
        fn new(play_time: Duration) -> Arc<Self> {
            Arc::new(Self {
                play_time,
                started: Arc::new(Mutex::new(Vec::new())),
                finished: Arc::new(Mutex::new(Vec::new())),
                halts: AtomicUsize::new(0),
            })
        }

        fn units(&self) -> Vec<Vec<u8>> {
            self.started.lock().unwrap().iter().map(|(_, unit)| unit.clone()).collect()
        }
    }

    impl AudioRenderer for FakeRenderer {
        fn render(&self, unit: Vec<u8>) -> BoxFuture<'static, ChannelResult<()>> {
            let started = Arc::clone(&self.started);
            let finished = Arc::clone(&self.finished);
            let play_time = self.play_time;
            Box::pin(async move {
                let corrupt = unit.first() == Some(&0xEE);
                started.lock().unwrap().push((Instant::now(), unit));
                time::sleep(play_time).await;
                finished.lock().unwrap().push(Instant::now());
                if corrupt {
                    Err(ChannelError::Playback("corrupt unit".to_string()))
                } else {
                    Ok(())
                }
            })
        }

        fn halt(&self) {
            self.halts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fragment(tag: u8, len: usize) -> Vec<u8> {
        let mut bytes = vec![tag; len];
        if len >= 2 {
            bytes[0] = 0xFF;
            bytes[1] = 0xFB;
        }
        bytes
    }

    fn window() -> Duration {
        Duration::from_millis(320)
    }

    async fn advance(ms: u64) {
        time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragments_within_window_form_one_unit() {
        let renderer = FakeRenderer::new(Duration::from_millis(10));
        let aggregator = Aggregator::new(renderer.clone(), window());

        let (a, b, c) = (fragment(1, 100), fragment(2, 200), fragment(3, 50));
        aggregator.ingest(a.clone());
        advance(50).await;
        aggregator.ingest(b.clone());
        advance(50).await;
        aggregator.ingest(c.clone());

        advance(310).await;
        assert!(renderer.units().is_empty());

        advance(20).await;
        let units = renderer.units();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].len(), 350);
        assert_eq!(units[0], [a, b, c].concat());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_longer_than_window_splits_units() {
        let renderer = FakeRenderer::new(Duration::from_millis(10));
        let aggregator = Aggregator::new(renderer.clone(), window());

        aggregator.ingest(fragment(1, 10));
        aggregator.ingest(fragment(2, 10));
        advance(400).await;
        aggregator.ingest(fragment(3, 10));
        advance(400).await;

        let units = renderer.units();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], [fragment(1, 10), fragment(2, 10)].concat());
        assert_eq!(units[1], fragment(3, 10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_flush() {
        let renderer = FakeRenderer::new(Duration::from_millis(10));
        let aggregator = Aggregator::new(renderer.clone(), window());

        aggregator.force_flush();
        advance(1).await;
        assert!(renderer.units().is_empty());

        aggregator.ingest(fragment(1, 40));
        aggregator.force_flush();
        advance(1).await;
        assert_eq!(renderer.units().len(), 1);

        // The old deadline was cancelled along with the buffer
        advance(1_000).await;
        assert_eq!(renderer.units().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_units_never_overlap_and_failures_do_not_stall() {
        let renderer = FakeRenderer::new(Duration::from_millis(1_000));
        let aggregator = Aggregator::new(renderer.clone(), window());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let _sub = aggregator.on_event(move |event: &PlaybackEvent| sink.lock().unwrap().push(event.clone()));

        aggregator.ingest(vec![0xEE; 8]);
        aggregator.force_flush();
        aggregator.ingest(fragment(2, 8));
        aggregator.force_flush();
        aggregator.ingest(fragment(3, 8));
        aggregator.force_flush();
        advance(1).await;
        assert!(aggregator.is_playing());

        advance(5_000).await;
        assert!(!aggregator.is_playing());

        let started = renderer.started.lock().unwrap();
        let finished = renderer.finished.lock().unwrap();
        assert_eq!(started.len(), 3);
        for n in 1..started.len() {
            assert!(started[n].0 >= finished[n - 1]);
        }
        assert_eq!(started[1].1, fragment(2, 8));

        let events = events.lock().unwrap();
        assert!(events.contains(&PlaybackEvent::UnitFailed {
            bytes: 8,
            error: ChannelError::Playback("corrupt unit".to_string()),
        }));
        assert_eq!(events.last(), Some(&PlaybackEvent::Drained));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_buffer_and_queue() {
        let renderer = FakeRenderer::new(Duration::from_millis(1_000));
        let aggregator = Aggregator::new(renderer.clone(), window());

        // Buffered only
        aggregator.ingest(fragment(1, 10));
        aggregator.stop();
        advance(1_000).await;
        assert!(renderer.units().is_empty());

        // One rendering, one queued
        aggregator.ingest(fragment(2, 10));
        aggregator.force_flush();
        aggregator.ingest(fragment(3, 10));
        aggregator.force_flush();
        advance(100).await;
        aggregator.stop();
        advance(5_000).await;

        assert_eq!(renderer.units(), vec![fragment(2, 10)]);
        assert_eq!(renderer.halts.load(Ordering::SeqCst), 1);
        assert!(!aggregator.is_playing());

        // Still usable afterwards
        aggregator.ingest(fragment(4, 10));
        advance(400).await;
        assert_eq!(renderer.units().len(), 2);
    }
}
