//! # Capture Pipeline
//!
//! Owns the input device while recording and forwards encoded frames to a sink.
//!
//! ## Lifecycle:
//! 1. `start(sink)` acquires the device and spawns the frame task
//! 2. `pause()` / `resume()` toggle delivery; the device stays open
//! 3. `stop()` aborts the frame task, which releases the device
//!
//! Losing the device mid-stream ends the frame task and notifies the sink through
//! [`FrameSink::on_device_lost`].

use super::pcm::{encode_frame, Conditioner};
use super::{CaptureFormat, FrameSink, InputDevice, InputEvent, OpenedInput};
use crate::error::{ChannelError, ChannelResult};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub struct CapturePipeline {
    device: Arc<dyn InputDevice>,
    format: CaptureFormat,
    task: Mutex<Option<JoinHandle<()>>>,
    paused: Arc<AtomicBool>,
    generation: AtomicU64,
}

impl CapturePipeline {
    pub fn new(device: Arc<dyn InputDevice>, format: CaptureFormat) -> Self {
        Self {
            device,
            format,
            task: Mutex::new(None),
            paused: Arc::new(AtomicBool::new(false)),
            generation: AtomicU64::new(0),
        }
    }

    /// Acquire the input device and start delivering frames to `sink`.
    ///
    /// Any previous recording is stopped first. Fails with a capability error when no
    /// device can be opened.
    pub async fn start(&self, sink: Arc<dyn FrameSink>) -> ChannelResult<()> {
        self.stop();
        let generation = self.generation.load(Ordering::SeqCst);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let input = match self.device.open(&self.format, events_tx).await {
            Ok(input) => input,
            Err(e) => {
                error!("Failed to open input device: {}", e);
                return Err(e);
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            return Err(ChannelError::AudioStream("Capture start superseded by stop".to_string()));
        }

        let conditioner = Conditioner::new(input.format, &self.format);
        if !conditioner.is_passthrough() {
            info!(
                "Converting capture from {} Hz / {} ch to {} Hz / {} ch",
                input.format.sample_rate,
                input.format.channels,
                self.format.sample_rate,
                self.format.channels
            );
        }

        self.paused.store(false, Ordering::SeqCst);
        let task = tokio::spawn(run_capture(
            input,
            events_rx,
            conditioner,
            FrameAssembler::new(self.format.frame_samples),
            Arc::clone(&self.paused),
            sink,
        ));
        *self.task() = Some(task);

        info!(
            "Capture started ({} Hz, {} ch, {} samples per frame)",
            self.format.sample_rate, self.format.channels, self.format.frame_samples
        );
        Ok(())
    }

    /// Release the device. Safe when already stopped.
    pub fn stop(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.paused.store(false, Ordering::SeqCst);
        if let Some(task) = self.task().take() {
            task.abort();
            info!("Capture stopped");
        }
    }

    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            debug!("Capture paused");
        }
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            debug!("Capture resumed");
        }
    }

    /// Whether the device is held and frames can flow (paused or not).
    pub fn is_recording(&self) -> bool {
        self.task()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    pub fn is_paused(&self) -> bool {
        self.is_recording() && self.paused.load(Ordering::SeqCst)
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_capture(
    input: OpenedInput,
    mut events: mpsc::UnboundedReceiver<InputEvent>,
    mut conditioner: Conditioner,
    mut assembler: FrameAssembler,
    paused: Arc<AtomicBool>,
    sink: Arc<dyn FrameSink>,
) {
    // Held for the lifetime of the task; dropping it releases the device
    let _input = input;

    while let Some(event) = events.recv().await {
        match event {
            InputEvent::Samples(samples) => {
                if paused.load(Ordering::SeqCst) {
                    assembler.clear();
                    continue;
                }
                let samples = conditioner.process(&samples);
                for frame in assembler.push(&samples) {
                    sink.on_frame(encode_frame(&frame));
                }
            }
            InputEvent::Lost(reason) => {
                warn!("Input device lost: {}", reason);
                sink.on_device_lost(&reason);
                return;
            }
        }
    }

    warn!("Input stream ended unexpectedly");
    sink.on_device_lost("input stream ended");
}

/// Cuts a continuous sample stream into fixed-size frames.
struct FrameAssembler {
    frame_samples: usize,
    pending: Vec<f32>,
}

impl FrameAssembler {
    fn new(frame_samples: usize) -> Self {
        Self {
            frame_samples: frame_samples.max(1),
            pending: Vec::with_capacity(frame_samples),
        }
    }

    fn push(&mut self, samples: &[f32]) -> Vec<Vec<f32>> {
        self.pending.extend_from_slice(samples);

        let mut frames = Vec::new();
        while self.pending.len() >= self.frame_samples {
            let rest = self.pending.split_off(self.frame_samples);
            frames.push(std::mem::replace(&mut self.pending, rest));
        }
        frames
    }

    fn clear(&mut self) {
        self.pending.clear();
    }
}
