// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Audio normalization.
//!
//! Arbitrary input audio is decoded, mixed down to mono, linearly resampled to
//! the device rate, fitted to exactly the maximum duration and quantized to
//! signed 16-bit little-endian PCM.

use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

pub mod capture;
pub mod decode;
pub mod error;

pub use error::AudioError;

/// The device's native sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// The longest sample a slot accepts.
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(1);

/// Audio ready to be written into a slot: mono, signed 16-bit little-endian PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedAudio {
    pcm_bytes: Vec<u8>,
    sample_rate: u32,
    duration_seconds: f64,
    source_name: String,
}

impl ProcessedAudio {
    /// Creates processed audio from already-quantized samples.
    pub fn from_samples(samples: &[i16], sample_rate: u32, source_name: &str) -> ProcessedAudio {
        let pcm_bytes = samples
            .iter()
            .flat_map(|sample| sample.to_le_bytes())
            .collect::<Vec<u8>>();

        ProcessedAudio {
            pcm_bytes,
            sample_rate,
            duration_seconds: samples.len() as f64 / sample_rate as f64,
            source_name: source_name.to_string(),
        }
    }

    /// The PCM bytes. Always an even number of bytes.
    pub fn pcm_bytes(&self) -> &[u8] {
        &self.pcm_bytes
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn duration_seconds(&self) -> f64 {
        self.duration_seconds
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// The number of 16-bit samples.
    pub fn sample_count(&self) -> usize {
        self.pcm_bytes.len() / 2
    }
}

/// Decoded audio at its native rate, interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// The number of sample frames.
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }
}

/// Turns arbitrary audio into [`ProcessedAudio`] for a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalizer {
    target_rate: u32,
    max_duration: Duration,
}

impl Normalizer {
    /// Creates a normalizer for the given device rate and slot length.
    pub fn new(target_rate: u32, max_duration: Duration) -> Normalizer {
        Normalizer {
            target_rate,
            max_duration,
        }
    }

    pub fn target_rate(&self) -> u32 {
        self.target_rate
    }

    pub fn max_duration(&self) -> Duration {
        self.max_duration
    }

    /// The exact number of samples every normalized clip has.
    pub fn target_samples(&self) -> usize {
        (self.target_rate as f64 * self.max_duration.as_secs_f64()).round() as usize
    }

    /// Decodes and normalizes an audio file.
    pub fn normalize_file(&self, path: &Path) -> Result<ProcessedAudio, AudioError> {
        let decoded = decode::decode_file(path)?;
        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        self.normalize(&decoded, &source_name)
    }

    /// Decodes and normalizes an in-memory audio blob.
    pub fn normalize_bytes(
        &self,
        data: Vec<u8>,
        source_name: &str,
    ) -> Result<ProcessedAudio, AudioError> {
        let decoded = decode::decode_bytes(data, source_name)?;
        self.normalize(&decoded, source_name)
    }

    /// Normalizes already-decoded audio, such as a microphone recording.
    pub fn normalize(
        &self,
        decoded: &DecodedAudio,
        source_name: &str,
    ) -> Result<ProcessedAudio, AudioError> {
        if decoded.channels == 0 || decoded.sample_rate == 0 {
            return Err(AudioError::NotAudio(source_name.to_string()));
        }

        let mono = downmix(&decoded.samples, decoded.channels);
        let resampled = resample_linear(&mono, decoded.sample_rate, self.target_rate);
        let source_samples = resampled.len();
        let fitted = fit_length(resampled, self.target_samples());
        let quantized = fitted.iter().map(|s| quantize(*s)).collect::<Vec<i16>>();

        if source_samples > quantized.len() {
            info!(
                source = source_name,
                dropped = source_samples - quantized.len(),
                "Trimmed audio to the maximum duration."
            );
        }
        debug!(
            source = source_name,
            source_rate = decoded.sample_rate,
            channels = decoded.channels,
            samples = quantized.len(),
            "Normalized audio."
        );

        Ok(ProcessedAudio::from_samples(
            &quantized,
            self.target_rate,
            source_name,
        ))
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Normalizer::new(DEFAULT_SAMPLE_RATE, DEFAULT_MAX_DURATION)
    }
}

/// Mixes interleaved audio down to mono by averaging every channel.
pub fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.to_vec(),
        _ => samples
            .chunks_exact(channels as usize)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect(),
    }
}

/// Resamples mono audio with linear interpolation between neighboring input
/// samples. The sample after the last one is taken to be the last one.
pub fn resample_linear(samples: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let step = input_rate as f64 / output_rate as f64;
    let output_len = (samples.len() as f64 / step).round() as usize;
    let last = samples.len() - 1;

    (0..output_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = (position.floor() as usize).min(last);
            let frac = (position - position.floor()) as f32;
            let s0 = samples[index];
            let s1 = samples[(index + 1).min(last)];
            s0 + (s1 - s0) * frac
        })
        .collect()
}

/// Trims or zero-pads to exactly `len` samples.
pub fn fit_length(mut samples: Vec<f32>, len: usize) -> Vec<f32> {
    samples.resize(len, 0.0);
    samples
}

/// Quantizes a sample to signed 16 bits. Out-of-range input is clamped, so
/// full scale in either direction lands exactly on the i16 limits.
pub fn quantize(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    let scaled = if clamped < 0.0 {
        clamped * 32768.0
    } else {
        clamped * 32767.0
    };
    scaled.round() as i16
}
