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

//! Device identity and maintenance commands.
//!
//! These ride on the same transport as sample dumps, but under the device's
//! own manufacturer prefix rather than the universal non-realtime one.

use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::{
    midi::{DeviceConnection, TransportError},
    sds::{HEADER_REPLY_TIMEOUT, SYSEX_END, SYSEX_START},
};

/// Manufacturer ID reserved for non-commercial use.
pub const MANUFACTURER_ID: u8 = 0x7D;
pub const DEVICE_ID: u8 = 0x21;

pub const VERSION_REQUEST_TAG: u8 = 0x01;
pub const VERSION_REPLY_TAG: u8 = 0x02;
pub const REBOOT_TO_BOOTLOADER_TAG: u8 = 0x0B;

/// How long to wait for the device to identify itself.
pub const IDENTITY_TIMEOUT: Duration = HEADER_REPLY_TIMEOUT;

/// How long to wait before asking a second time.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("no MIDI transport is bound")]
    TransportUnavailable,

    #[error("transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for ControlError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable => ControlError::TransportUnavailable,
            e => ControlError::Transport(e),
        }
    }
}

fn command(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(body.len() + 5);
    message.extend_from_slice(&[SYSEX_START, MANUFACTURER_ID, DEVICE_ID, tag]);
    message.extend(body.iter().map(|b| b & 0x7F));
    message.push(SYSEX_END);
    message
}

/// The identity request.
pub fn version_request() -> Vec<u8> {
    command(VERSION_REQUEST_TAG, &[])
}

/// The identity reply a device sends, carrying three or four version components.
pub fn version_reply(components: &[u8]) -> Vec<u8> {
    command(VERSION_REPLY_TAG, components)
}

/// The reboot-to-bootloader command.
pub fn reboot_request() -> Vec<u8> {
    command(REBOOT_TO_BOOTLOADER_TAG, &[])
}

/// Parses an identity reply into a version string. Four components denote a
/// development build.
pub fn parse_version_reply(message: &[u8]) -> Option<String> {
    match message {
        [SYSEX_START, MANUFACTURER_ID, DEVICE_ID, VERSION_REPLY_TAG, components @ .., SYSEX_END] => {
            match components {
                [major, minor, patch] => Some(format!("{}.{}.{}", major, minor, patch)),
                [major, minor, patch, dev] => {
                    Some(format!("{}.{}.{}-dev.{}", major, minor, patch, dev))
                }
                _ => None,
            }
        }
        _ => None,
    }
}

/// Sends control commands over a device connection.
pub struct DeviceControlChannel<'a> {
    connection: &'a mut DeviceConnection,
}

impl<'a> DeviceControlChannel<'a> {
    pub fn new(connection: &'a mut DeviceConnection) -> DeviceControlChannel<'a> {
        DeviceControlChannel { connection }
    }

    /// Asks the device for its firmware version. Returns `None` if the device
    /// didn't answer in time.
    pub async fn request_version(&mut self) -> Result<Option<String>, ControlError> {
        self.connection.discard_inbound();
        self.connection.send(&version_request())?;
        let version = self
            .connection
            .await_message("version reply", IDENTITY_TIMEOUT, parse_version_reply)
            .await?;

        match &version {
            Some(version) => info!(version = %version, "Device identified itself."),
            None => debug!("No identity reply."),
        }
        Ok(version)
    }

    /// Asks for the firmware version, asking once more after a short delay if
    /// the device stays quiet.
    pub async fn request_version_with_retry(&mut self) -> Result<Option<String>, ControlError> {
        let span = info_span!("identify", device = self.connection.device_name());
        async move {
            if let Some(version) = self.request_version().await? {
                return Ok(Some(version));
            }
            warn!(delay = ?RETRY_DELAY, "Device did not identify itself, retrying.");
            tokio::time::sleep(RETRY_DELAY).await;
            self.request_version().await
        }
        .instrument(span)
        .await
    }

    /// Reboots the device into its bootloader. No reply is expected.
    pub fn reboot_to_bootloader(&mut self) -> Result<(), ControlError> {
        info!(
            device = self.connection.device_name(),
            "Rebooting device to bootloader."
        );
        self.connection.send(&reboot_request())?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        error::Error,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::*;
    use crate::midi::mock;

    #[test]
    fn test_messages() {
        assert_eq!(version_request(), vec![0xF0, 0x7D, 0x21, 0x01, 0xF7]);
        assert_eq!(reboot_request(), vec![0xF0, 0x7D, 0x21, 0x0B, 0xF7]);
        assert_eq!(
            version_reply(&[1, 2, 3]),
            vec![0xF0, 0x7D, 0x21, 0x02, 0x01, 0x02, 0x03, 0xF7]
        );
    }

    #[test]
    fn test_parse_version_reply() {
        assert_eq!(
            parse_version_reply(&version_reply(&[1, 2, 3])),
            Some("1.2.3".to_string())
        );
        assert_eq!(
            parse_version_reply(&version_reply(&[2, 0, 1, 5])),
            Some("2.0.1-dev.5".to_string())
        );
        assert_eq!(parse_version_reply(&version_reply(&[1, 2])), None);
        assert_eq!(parse_version_reply(&version_request()), None);
        assert_eq!(parse_version_reply(&[0xF0, 0x7E, 0x00, 0x7F, 0x00, 0xF7]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_version() -> Result<(), Box<dyn Error>> {
        let transport = mock::Transport::get("mock-device");
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        let mut channel = DeviceControlChannel::new(&mut connection);

        assert_eq!(channel.request_version().await?, Some("1.0.0".to_string()));
        assert_eq!(transport.sent(), vec![version_request()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_version_retries_once() -> Result<(), Box<dyn Error>> {
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = asked.clone();
        let transport = mock::Transport::with_responder("mock-sleepy", move |message| {
            if message != version_request().as_slice() {
                return Vec::new();
            }
            // Only the second request is answered.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Vec::new()
            } else {
                vec![version_reply(&[3, 1, 4, 1])]
            }
        });
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        let mut channel = DeviceControlChannel::new(&mut connection);

        let start = tokio::time::Instant::now();
        let version = channel.request_version_with_retry().await?;
        assert_eq!(version, Some("3.1.4-dev.1".to_string()));
        assert_eq!(asked.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= IDENTITY_TIMEOUT + RETRY_DELAY);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_version_gives_up() -> Result<(), Box<dyn Error>> {
        let transport = mock::Transport::silent("mock-silent");
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        let mut channel = DeviceControlChannel::new(&mut connection);

        assert_eq!(channel.request_version_with_retry().await?, None);
        assert_eq!(transport.sent().len(), 2);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_version_without_input() -> Result<(), Box<dyn Error>> {
        let transport = mock::Transport::without_input("mock-output-only");
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        let mut channel = DeviceControlChannel::new(&mut connection);

        let start = tokio::time::Instant::now();
        assert_eq!(channel.request_version_with_retry().await?, None);
        assert!(start.elapsed() >= IDENTITY_TIMEOUT * 2 + RETRY_DELAY);
        assert_eq!(transport.sent(), vec![version_request(), version_request()]);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot() -> Result<(), Box<dyn Error>> {
        let transport = mock::Transport::silent("mock-silent");
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        DeviceControlChannel::new(&mut connection).reboot_to_bootloader()?;
        assert_eq!(transport.sent(), vec![reboot_request()]);

        let mut unbound = DeviceConnection::new();
        assert!(matches!(
            DeviceControlChannel::new(&mut unbound).reboot_to_bootloader(),
            Err(ControlError::TransportUnavailable)
        ));
        Ok(())
    }
}
