//! cpal input device. The cpal stream is not `Send`, so it lives on its own thread for
//! as long as the returned guard is alive.

use super::{CaptureFormat, DeviceFormat, InputDevice, InputEvent, OpenedInput};
use crate::error::{ChannelError, ChannelResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, Stream, StreamConfig};
use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// The host's default input device.
#[derive(Debug, Default, Clone)]
pub struct CpalInput;

impl CpalInput {
    pub fn new() -> Self {
        Self
    }
}

impl InputDevice for CpalInput {
    fn open(
        &self,
        format: &CaptureFormat,
        events: mpsc::UnboundedSender<InputEvent>,
    ) -> BoxFuture<'static, ChannelResult<OpenedInput>> {
        let requested = format.clone();

        Box::pin(async move {
            let (ready_tx, ready_rx) = oneshot::channel();
            let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

            std::thread::Builder::new()
                .name("voice-capture".to_string())
                .spawn(move || match build_stream(&requested, events) {
                    Ok((stream, format)) => {
                        let _ = ready_tx.send(Ok(format));
                        // Blocks until the guard is dropped
                        let _ = stop_rx.recv();
                        drop(stream);
                        debug!("Input stream released");
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                })?;

            let format = ready_rx.await.map_err(|_| {
                ChannelError::Capability("Capture thread exited before the device opened".to_string())
            })??;

            Ok(OpenedInput {
                format,
                guard: Box::new(stop_tx),
            })
        })
    }
}

/// Open the default input device, first at the requested format and then at the
/// device's own default.
fn build_stream(
    requested: &CaptureFormat,
    events: mpsc::UnboundedSender<InputEvent>,
) -> ChannelResult<(Stream, DeviceFormat)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| ChannelError::Capability("No input device available".to_string()))?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let preferred = StreamConfig {
        channels: requested.channels,
        sample_rate: SampleRate(requested.sample_rate),
        buffer_size: BufferSize::Default,
    };

    match open_stream(&device, &preferred, events.clone()) {
        Ok(stream) => Ok((
            stream,
            DeviceFormat {
                sample_rate: requested.sample_rate,
                channels: requested.channels,
            },
        )),
        Err(e) => {
            warn!(
                "Input device rejected {} Hz / {} ch ({}), falling back to its default format",
                requested.sample_rate, requested.channels, e
            );
            let fallback: StreamConfig = device.default_input_config()?.into();
            let stream = open_stream(&device, &fallback, events)?;
            info!(
                "Capturing at {} Hz / {} ch, converting to {} Hz / {} ch",
                fallback.sample_rate.0, fallback.channels, requested.sample_rate, requested.channels
            );
            Ok((
                stream,
                DeviceFormat {
                    sample_rate: fallback.sample_rate.0,
                    channels: fallback.channels,
                },
            ))
        }
    }
}

fn open_stream(
    device: &Device,
    config: &StreamConfig,
    events: mpsc::UnboundedSender<InputEvent>,
) -> ChannelResult<Stream> {
    let samples = events.clone();
    let stream = device.build_input_stream(
        config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let _ = samples.send(InputEvent::Samples(data.to_vec()));
        },
        move |err| match err {
            cpal::StreamError::DeviceNotAvailable => {
                let _ = events.send(InputEvent::Lost(err.to_string()));
            }
            other => warn!("Input stream error: {}", other),
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}
