//! # Capture Pipeline
//!
//! Turns live microphone input into fixed-size 16-bit PCM frames.
//!
//! ## Components:
//! - [`pcm`]: float to s16le conversion, down-mixing and resampling
//! - [`device`]: the cpal-backed input device
//! - [`pipeline`]: start/stop/pause/resume and frame delivery to a [`FrameSink`]
//!
//! ## Audio Format:
//! Frames default to 4096 samples of 16 kHz mono s16le (8192 bytes, 256 ms).

pub mod device;
pub mod pcm;
pub mod pipeline;

pub use device::CpalInput;
pub use pipeline::CapturePipeline;

use crate::error::ChannelResult;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

/// Requested capture format and frame size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Samples per delivered frame
    pub frame_samples: usize,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            frame_samples: 4096,
        }
    }
}

/// The format an input device actually opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Events pushed by an open input device.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    /// Interleaved float samples in `[-1.0, 1.0]`
    Samples(Vec<f32>),
    /// The device went away mid-stream
    Lost(String),
}

/// An acquired input device. Dropping it releases the device.
pub struct OpenedInput {
    pub format: DeviceFormat,
    pub guard: Box<dyn Send>,
}

/// Source of live audio input.
pub trait InputDevice: Send + Sync + 'static {
    /// Acquire the device, preferring `format`. Samples flow into `events` until the
    /// returned [`OpenedInput`] is dropped.
    fn open(
        &self,
        format: &CaptureFormat,
        events: mpsc::UnboundedSender<InputEvent>,
    ) -> BoxFuture<'static, ChannelResult<OpenedInput>>;
}

/// Receiver of encoded capture frames.
pub trait FrameSink: Send + Sync + 'static {
    fn on_frame(&self, frame: Vec<u8>);

    /// The input device disappeared; no more frames will arrive.
    fn on_device_lost(&self, _reason: &str) {}
}
