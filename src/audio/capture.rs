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
use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::Sample;
use parking_lot::Mutex;
use tracing::{error, info, span, Level};

use super::{error::AudioError, DecodedAudio};

/// Extra time allowed for the input stream to deliver the requested audio.
const CAPTURE_GRACE: Duration = Duration::from_secs(2);

fn capture_error<E: std::fmt::Display>(e: E) -> AudioError {
    AudioError::Capture(e.to_string())
}

/// Lists the names of the available audio input devices.
pub fn list_input_devices() -> Result<Vec<String>, AudioError> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    for device in host.input_devices().map_err(capture_error)? {
        names.push(device.name().map_err(capture_error)?);
    }
    names.sort();
    Ok(names)
}

/// Records `duration` of audio from the named input device, or the default
/// input device if no name is given. Blocks until the recording is complete.
pub fn record(device_name: Option<&str>, duration: Duration) -> Result<DecodedAudio, AudioError> {
    let span = span!(Level::INFO, "record (cpal)");
    let _enter = span.enter();

    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => find_input_device(&host, name)?,
        None => host
            .default_input_device()
            .ok_or_else(|| AudioError::Capture("no default input device".to_string()))?,
    };

    let supported = device.default_input_config().map_err(capture_error)?;
    let sample_format = supported.sample_format();
    let config: cpal::StreamConfig = supported.into();
    let channels = config.channels;
    let sample_rate = config.sample_rate;
    let wanted = (duration.as_secs_f64() * sample_rate as f64).round() as usize * channels as usize;

    let captured = Arc::new(Mutex::new(Vec::with_capacity(wanted)));
    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, captured.clone()),
        cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, captured.clone()),
        cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, captured.clone()),
        cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, captured.clone()),
        other => Err(AudioError::Capture(format!(
            "unsupported input sample format {:?}",
            other
        ))),
    }?;

    info!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels,
        duration = ?duration,
        "Recording."
    );
    stream.play().map_err(capture_error)?;

    let deadline = Instant::now() + duration + CAPTURE_GRACE;
    while captured.lock().len() < wanted {
        if Instant::now() > deadline {
            return Err(AudioError::Capture(
                "input device stopped delivering audio".to_string(),
            ));
        }
        thread::sleep(Duration::from_millis(10));
    }
    drop(stream);

    let mut samples = std::mem::take(&mut *captured.lock());
    samples.truncate(wanted);
    info!(frames = samples.len() / channels as usize, "Recording finished.");

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

fn find_input_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, AudioError> {
    for device in host.input_devices().map_err(capture_error)? {
        if device.name().map_err(capture_error)?.trim() == name {
            return Ok(device);
        }
    }
    Err(AudioError::Capture(format!(
        "no input device found with name {}",
        name
    )))
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    captured: Arc<Mutex<Vec<f32>>>,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                captured
                    .lock()
                    .extend(data.iter().map(|sample| sample.to_sample::<f32>()));
            },
            |err| error!("CPAL input stream error: {}", err),
            None,
        )
        .map_err(capture_error)
}
