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
use std::error::Error;

/// Errors raised while turning input audio into device PCM.
#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("unable to decode {source_name}: {cause}")]
    DecodeFailed {
        source_name: String,
        #[source]
        cause: Box<dyn Error + Send + Sync>,
    },

    #[error("{0} does not contain decodable audio")]
    NotAudio(String),

    #[error("audio capture failed: {0}")]
    Capture(String),
}

impl AudioError {
    pub(crate) fn decode_failed<E>(source_name: &str, cause: E) -> AudioError
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        AudioError::DecodeFailed {
            source_name: source_name.to_string(),
            cause: cause.into(),
        }
    }

    /// Returns true if the input was rejected outright rather than failing mid-decode.
    pub fn is_validation(&self) -> bool {
        matches!(self, AudioError::NotAudio(_))
    }
}
