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
use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};
use tracing::{debug, warn};

use super::error::AudioError;
use super::DecodedAudio;

/// Decodes an audio file (WAV, MP3, FLAC, and anything else symphonia supports).
pub fn decode_file(path: &Path) -> Result<DecodedAudio, AudioError> {
    let source_name = path.display().to_string();
    let file = File::open(path).map_err(|e| AudioError::decode_failed(&source_name, e))?;

    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|ext| ext.to_str()) {
        hint.with_extension(extension);
    }

    decode_stream(
        MediaSourceStream::new(Box::new(file), Default::default()),
        &hint,
        &source_name,
    )
}

/// Decodes an in-memory audio blob. The source name's extension, if any, is
/// used as a format hint.
pub fn decode_bytes(data: Vec<u8>, source_name: &str) -> Result<DecodedAudio, AudioError> {
    let mut hint = Hint::new();
    if let Some(extension) = Path::new(source_name)
        .extension()
        .and_then(|ext| ext.to_str())
    {
        hint.with_extension(extension);
    }

    decode_stream(
        MediaSourceStream::new(Box::new(Cursor::new(data)), Default::default()),
        &hint,
        source_name,
    )
}

fn decode_stream(
    mss: MediaSourceStream,
    hint: &Hint,
    source_name: &str,
) -> Result<DecodedAudio, AudioError> {
    let probed = get_probe()
        .format(
            hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| match e {
            SymphoniaError::Unsupported(_) => AudioError::NotAudio(source_name.to_string()),
            e => AudioError::decode_failed(source_name, e),
        })?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| AudioError::NotAudio(source_name.to_string()))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let mut channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);
    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::decode_failed(source_name, e))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format_reader.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => return Err(AudioError::decode_failed(source_name, e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        match decoder.decode(&packet) {
            Ok(decoded) => {
                let spec = *decoded.spec();
                sample_rate = spec.rate;
                channels = spec.channels.count() as u16;

                let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                buffer.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buffer.samples());
            }
            Err(SymphoniaError::DecodeError(e)) => {
                // A corrupt packet loses a few milliseconds; keep going.
                warn!(source = source_name, err = e, "Skipping undecodable packet.");
            }
            Err(e) => return Err(AudioError::decode_failed(source_name, e)),
        }
    }

    if channels == 0 || sample_rate == 0 {
        return Err(AudioError::NotAudio(source_name.to_string()));
    }

    debug!(
        source = source_name,
        sample_rate,
        channels,
        frames = samples.len() / channels as usize,
        "Decoded audio."
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}
