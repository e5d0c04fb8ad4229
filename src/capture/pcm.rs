//! # PCM Conversion
//!
//! Float samples from the input device become 16-bit little-endian PCM before they are
//! sent. When the device could not open the requested format, samples are down-mixed and
//! linearly resampled first, with the resampler's phase kept across device batches.

use super::{CaptureFormat, DeviceFormat};
use byteorder::{ByteOrder, LittleEndian};

/// Convert one float sample in `[-1.0, 1.0]` to i16.
///
/// Negative values scale by 32768 and non-negative values by 32767, so both ends of the
/// range map exactly onto `i16::MIN` / `i16::MAX`. Out-of-range input is clamped.
pub fn float_to_pcm16(sample: f32) -> i16 {
    let sample = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    let scaled = if sample < 0.0 {
        sample * 32768.0
    } else {
        sample * 32767.0
    };
    // `as` saturates at the i16 bounds
    scaled.round() as i16
}

/// Encode a block of float samples as s16le bytes.
pub fn encode_frame(samples: &[f32]) -> Vec<u8> {
    let pcm: Vec<i16> = samples.iter().map(|&sample| float_to_pcm16(sample)).collect();
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    bytes
}

/// Average interleaved channels down to mono.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler for a continuous stream delivered in batches.
///
/// The read position and the last input sample carry over between batches, so batch
/// boundaries neither drop samples nor restart the interpolation.
#[derive(Debug, Clone)]
pub struct Resampler {
    /// Input samples consumed per output sample
    step: f64,
    /// Read position, counted from `last` when there is one
    position: f64,
    last: Option<f32>,
}

impl Resampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            position: 0.0,
            last: None,
        }
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if input.is_empty() {
            return Vec::new();
        }

        let window: Vec<f32> = self.last.into_iter().chain(input.iter().copied()).collect();
        let end = (window.len() - 1) as f64;
        let mut output = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);

        while self.position < end {
            let floor = self.position.floor() as usize;
            let frac = (self.position - floor as f64) as f32;
            output.push(window[floor] * (1.0 - frac) + window[floor + 1] * frac);
            self.position += self.step;
        }

        // The final sample becomes index 0 of the next window
        self.position -= end;
        self.last = window.last().copied();
        output
    }
}

/// Brings device samples to the requested format. The server expects mono, so a
/// channel mismatch is always resolved by down-mixing.
#[derive(Debug, Clone)]
pub struct Conditioner {
    source: DeviceFormat,
    target_rate: u32,
    target_channels: u16,
    resampler: Resampler,
}

impl Conditioner {
    pub fn new(source: DeviceFormat, target: &CaptureFormat) -> Self {
        Self {
            source,
            target_rate: target.sample_rate,
            target_channels: target.channels,
            resampler: Resampler::new(source.sample_rate, target.sample_rate),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.source.sample_rate == self.target_rate && self.source.channels == self.target_channels
    }

    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return samples.to_vec();
        }

        let mixed = if self.source.channels == self.target_channels {
            samples.to_vec()
        } else {
            downmix(samples, self.source.channels as usize)
        };

        if self.source.sample_rate == self.target_rate {
            mixed
        } else {
            self.resampler.process(&mixed)
        }
    }
}
