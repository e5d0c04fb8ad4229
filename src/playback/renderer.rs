//! Audio output seam and the rodio renderer.
//!
//! rodio's `OutputStream` is not `Send`, so [`RodioRenderer`] keeps the stream and its
//! sink on a dedicated thread and talks to it over a command channel.

use crate::error::{ChannelError, ChannelResult};
use futures_util::future::BoxFuture;
use rodio::{Decoder, OutputStream, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info};

/// Plays one unit at a time.
pub trait AudioRenderer: Send + Sync + 'static {
    /// Play `unit`; resolves when playback finishes or is halted.
    fn render(&self, unit: Vec<u8>) -> BoxFuture<'static, ChannelResult<()>>;

    /// Cut the current unit short. A pending `render` resolves immediately.
    fn halt(&self);

    fn set_volume(&self, _volume: f32) {}

    fn volume(&self) -> f32 {
        1.0
    }
}

enum OutputCommand {
    Play {
        unit: Vec<u8>,
        done: oneshot::Sender<ChannelResult<()>>,
    },
    Halt,
    Volume(f32),
}

/// How often the output thread checks whether the current unit has finished.
const COMPLETION_POLL: Duration = Duration::from_millis(20);

/// Default output device through rodio.
pub struct RodioRenderer {
    commands: mpsc::Sender<OutputCommand>,
    volume: Mutex<f32>,
}

impl RodioRenderer {
    pub fn new() -> ChannelResult<Self> {
        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || run_output(command_rx, ready_tx))?;

        ready_rx.recv().map_err(|_| {
            ChannelError::Capability("Playback thread exited before the output opened".to_string())
        })??;

        info!("Audio output ready");
        Ok(Self {
            commands,
            volume: Mutex::new(1.0),
        })
    }
}

impl AudioRenderer for RodioRenderer {
    fn render(&self, unit: Vec<u8>) -> BoxFuture<'static, ChannelResult<()>> {
        let (done, finished) = oneshot::channel();
        let queued = self.commands.send(OutputCommand::Play { unit, done });

        Box::pin(async move {
            if queued.is_err() {
                return Err(ChannelError::Playback("Audio output has shut down".to_string()));
            }
            finished.await.unwrap_or_else(|_| {
                Err(ChannelError::Playback("Audio output dropped the unit".to_string()))
            })
        })
    }

    fn halt(&self) {
        let _ = self.commands.send(OutputCommand::Halt);
    }

    fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner) = volume;
        let _ = self.commands.send(OutputCommand::Volume(volume));
    }

    fn volume(&self) -> f32 {
        *self.volume.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_output(commands: mpsc::Receiver<OutputCommand>, ready: mpsc::Sender<ChannelResult<()>>) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(output) => output,
        Err(e) => {
            let _ = ready.send(Err(ChannelError::Capability(e.to_string())));
            return;
        }
    };
    let mut sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready.send(Err(ChannelError::Capability(e.to_string())));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut volume = 1.0;
    let mut playing: Option<oneshot::Sender<ChannelResult<()>>> = None;

    loop {
        let command = if playing.is_some() {
            match commands.recv_timeout(COMPLETION_POLL) {
                Ok(command) => Some(command),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => break,
            }
        };

        match command {
            Some(OutputCommand::Play { unit, done }) => {
                let bytes = unit.len();
                match Decoder::new(Cursor::new(unit)) {
                    Ok(source) => {
                        debug!("Rendering unit of {} bytes", bytes);
                        sink.append(source.convert_samples::<f32>());
                        if let Some(previous) = playing.replace(done) {
                            let _ = previous.send(Ok(()));
                        }
                    }
                    Err(e) => {
                        let _ = done.send(Err(ChannelError::Playback(format!("Decode failed: {}", e))));
                    }
                }
            }
            Some(OutputCommand::Halt) => {
                sink.stop();
                sink = match Sink::try_new(&handle) {
                    Ok(sink) => sink,
                    Err(e) => {
                        error!("Could not recreate audio sink: {}", e);
                        break;
                    }
                };
                sink.set_volume(volume);
                if let Some(done) = playing.take() {
                    let _ = done.send(Ok(()));
                }
            }
            Some(OutputCommand::Volume(level)) => {
                volume = level;
                sink.set_volume(level);
            }
            None => {}
        }

        if playing.is_some() && sink.empty() {
            if let Some(done) = playing.take() {
                let _ = done.send(Ok(()));
            }
        }
    }

    debug!("Audio output thread finished");
}
