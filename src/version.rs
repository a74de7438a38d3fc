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

//! Firmware version comparison.

use std::{fmt, str::FromStr};

use tracing::warn;

/// A firmware version of the form `major.minor.patch`, optionally followed by
/// a `-dev.N` suffix. A dev build sorts after the release it shares numbers
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FirmwareVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub dev: Option<u32>,
}

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("invalid firmware version: {0}")]
pub struct ParseVersionError(String);

impl FromStr for FirmwareVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());
        let s = s.trim();

        let (release, dev) = match s.split_once('-') {
            Some((release, suffix)) => {
                let number = suffix.strip_prefix("dev.").ok_or_else(invalid)?;
                (release, Some(number.parse::<u32>().map_err(|_| invalid())?))
            }
            None => (s, None),
        };

        let parts = release
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<u32>, _>>()
            .map_err(|_| invalid())?;
        match parts.as_slice() {
            [major, minor, patch] => Ok(FirmwareVersion {
                major: *major,
                minor: *minor,
                patch: *patch,
                dev,
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(dev) = self.dev {
            write!(f, "-dev.{}", dev)?;
        }
        Ok(())
    }
}

/// Returns true if `candidate` is newer than `current`. An unknown current
/// version is always considered outdated. If either version can't be parsed,
/// no update is signaled.
pub fn is_newer(current: Option<&str>, candidate: &str) -> bool {
    let Some(current) = current else {
        return true;
    };

    match (
        current.parse::<FirmwareVersion>(),
        candidate.parse::<FirmwareVersion>(),
    ) {
        (Ok(current), Ok(candidate)) => candidate > current,
        (Err(e), _) | (_, Err(e)) => {
            warn!(err = e.to_string(), "Unable to compare firmware versions.");
            false
        }
    }
}
