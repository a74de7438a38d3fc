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
    path::{Path, PathBuf},
    time::Duration,
};

use ::config::{Config, File};
use duration_string::DurationString;
use serde::Deserialize;

use crate::{
    audio::{Normalizer, DEFAULT_MAX_DURATION, DEFAULT_SAMPLE_RATE},
    queue::{SlotRange, TransferRequest},
};

mod error;

pub use error::ConfigError;

/// The writable slot range, inclusive.
#[derive(Deserialize, Clone, Copy, Debug)]
struct Slots {
    first: u16,
    last: u16,
}

/// One entry of the batch upload manifest.
#[derive(Deserialize, Clone, Debug, PartialEq)]
pub struct Upload {
    /// The slot to write to.
    pub slot: u16,

    /// The audio file. Relative paths are relative to the configuration file.
    pub file: PathBuf,
}

/// A YAML representation of the loader configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct Loader {
    /// The MIDI device.
    device: String,

    /// Target sample rate in Hz (default: 44100)
    sample_rate: Option<u32>,

    /// The longest sample a slot accepts (default: 1s)
    max_duration: Option<String>,

    /// The slots that may be written to.
    slots: Option<Slots>,

    /// Files to upload with the batch command.
    #[serde(default)]
    uploads: Vec<Upload>,

    #[serde(skip)]
    base_dir: PathBuf,
}

impl Loader {
    /// New will create a new configuration for the given device.
    pub fn new(device: &str) -> Loader {
        Loader {
            device: device.to_string(),
            sample_rate: None,
            max_duration: None,
            slots: None,
            uploads: Vec::new(),
            base_dir: PathBuf::new(),
        }
    }

    /// Loads the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Loader, ConfigError> {
        let mut loader: Loader = Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()?;
        loader.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        loader.validate()?;
        Ok(loader)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate() == 0 {
            return Err(ConfigError::SampleRate);
        }
        if let Some(slots) = self.slots {
            if slots.first > slots.last {
                return Err(ConfigError::SlotRange {
                    first: slots.first,
                    last: slots.last,
                });
            }
        }
        self.max_duration()?;
        Ok(())
    }

    /// Returns the device from the configuration.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Returns the target sample rate (default: 44100)
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE)
    }

    /// Returns the maximum sample duration (default: 1s)
    pub fn max_duration(&self) -> Result<Duration, ConfigError> {
        match &self.max_duration {
            Some(max_duration) => Ok(DurationString::from_string(max_duration.clone())
                .map_err(|e| ConfigError::Duration {
                    value: max_duration.clone(),
                    reason: e.to_string(),
                })?
                .into()),
            None => Ok(DEFAULT_MAX_DURATION),
        }
    }

    /// Returns the writable slot range.
    pub fn slots(&self) -> SlotRange {
        match self.slots {
            Some(slots) => SlotRange {
                first: slots.first,
                last: slots.last,
            },
            None => SlotRange::default(),
        }
    }

    /// Returns a normalizer for this device.
    pub fn normalizer(&self) -> Result<Normalizer, ConfigError> {
        Ok(Normalizer::new(self.sample_rate(), self.max_duration()?))
    }

    /// Returns the batch manifest as transfer requests, with file paths resolved.
    pub fn upload_requests(&self) -> Vec<TransferRequest> {
        self.uploads
            .iter()
            .map(|upload| TransferRequest::file(self.base_dir.join(&upload.file), upload.slot))
            .collect()
    }

    /// Returns the batch manifest as written.
    pub fn uploads(&self) -> &[Upload] {
        &self.uploads
    }
}

#[cfg(test)]
mod test {
    use std::error::Error;

    use ::config::FileFormat;

    use super::*;

    fn parse(yaml: &str) -> Result<Loader, ConfigError> {
        let loader: Loader = Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        loader.validate()?;
        Ok(loader)
    }

    #[test]
    fn test_defaults() -> Result<(), Box<dyn Error>> {
        let loader = parse(
            r#"
            device: mock-device
            "#,
        )?;

        assert_eq!(loader.device(), "mock-device");
        assert_eq!(loader.sample_rate(), 44100);
        assert_eq!(loader.max_duration()?, Duration::from_secs(1));
        assert_eq!(loader.slots(), SlotRange::default());
        assert!(loader.uploads().is_empty());
        Ok(())
    }

    #[test]
    fn test_full() -> Result<(), Box<dyn Error>> {
        let loader = parse(
            r#"
            device: sample-device
            sample_rate: 22050
            max_duration: 500ms
            slots:
              first: 1
              last: 16
            uploads:
              - slot: 3
                file: kick.wav
              - slot: 4
                file: /samples/snare.wav
            "#,
        )?;

        assert_eq!(loader.sample_rate(), 22050);
        assert_eq!(loader.max_duration()?, Duration::from_millis(500));
        assert_eq!(loader.slots(), SlotRange { first: 1, last: 16 });
        assert_eq!(
            loader.uploads(),
            &[
                Upload {
                    slot: 3,
                    file: PathBuf::from("kick.wav")
                },
                Upload {
                    slot: 4,
                    file: PathBuf::from("/samples/snare.wav")
                },
            ]
        );

        let normalizer = loader.normalizer()?;
        assert_eq!(normalizer.target_samples(), 11025);
        Ok(())
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            parse("device: d\nmax_duration: soon\n"),
            Err(ConfigError::Duration { .. })
        ));
        assert!(matches!(
            parse("device: d\nslots:\n  first: 9\n  last: 2\n"),
            Err(ConfigError::SlotRange { first: 9, last: 2 })
        ));
        assert!(matches!(
            parse("device: d\nsample_rate: 0\n"),
            Err(ConfigError::SampleRate)
        ));
        assert!(matches!(parse("sample_rate: 1\n"), Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_load_resolves_upload_paths() -> Result<(), Box<dyn Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sdsload.yaml");
        std::fs::write(&path, "device: mock-device\nuploads:\n  - slot: 2\n    file: hat.wav\n")?;

        let loader = Loader::load(&path)?;
        let requests = loader.upload_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].slot(), 2);
        assert_eq!(requests[0].path(), Some(dir.path().join("hat.wav").as_path()));
        Ok(())
    }
}
