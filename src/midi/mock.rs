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
use std::{fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc::Sender;
use tracing::debug;

use super::TransportError;
use crate::{
    control,
    sds::{codec, ControlReply, DATA_PACKET_TAG, DUMP_HEADER_TAG, NON_REALTIME_ID, SYSEX_START},
};

/// Produces the device's replies to a message sent to it.
pub type Responder = dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync;

/// The firmware version reported by the default mock device.
pub const MOCK_FIRMWARE: [u8; 3] = [1, 0, 0];

/// A mock device. Records everything sent to it and answers through a responder.
#[derive(Clone)]
pub struct Transport {
    name: String,
    responder: Arc<Responder>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    sender: Arc<Mutex<Option<Sender<Vec<u8>>>>>,
    has_input: bool,
}

impl Transport {
    /// Gets a mock device that acknowledges every dump frame and answers version requests.
    pub fn get(name: &str) -> Transport {
        Transport::with_responder(name, acknowledge)
    }

    /// Gets a mock device that never answers.
    pub fn silent(name: &str) -> Transport {
        Transport::with_responder(name, |_| Vec::new())
    }

    /// Gets a mock device with no MIDI input. It never keeps the event sender.
    pub fn without_input(name: &str) -> Transport {
        Transport {
            has_input: false,
            ..Transport::silent(name)
        }
    }

    /// Gets a mock device that answers through the given responder.
    pub fn with_responder<F>(name: &str, responder: F) -> Transport
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        Transport {
            name: name.to_string(),
            responder: Arc::new(responder),
            sent: Arc::new(Mutex::new(Vec::new())),
            sender: Arc::new(Mutex::new(None)),
            has_input: true,
        }
    }

    /// Returns every message sent to the device so far.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    /// Delivers an unsolicited message from the device.
    pub fn inject(&self, message: &[u8]) {
        self.deliver(message.to_vec());
    }

    /// Returns true while someone is watching the device's events.
    pub fn is_watching(&self) -> bool {
        self.sender.lock().is_some()
    }

    fn deliver(&self, message: Vec<u8>) {
        if let Some(sender) = self.sender.lock().as_ref() {
            if let Err(e) = sender.try_send(message) {
                debug!(err = e.to_string(), "Mock device dropped a reply.");
            }
        }
    }
}

impl super::Transport for Transport {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        self.sent.lock().push(message.to_vec());
        for reply in (self.responder)(message) {
            self.deliver(reply);
        }
        Ok(())
    }

    fn watch_events(&self, sender: Sender<Vec<u8>>) -> Result<(), TransportError> {
        if !self.has_input {
            return Ok(());
        }
        let mut current = self.sender.lock();
        if current.is_some() {
            return Err(TransportError::AlreadyWatching);
        }
        *current = Some(sender);
        Ok(())
    }

    fn stop_watch_events(&self) {
        self.sender.lock().take();
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (Mock)", self.name)
    }
}

/// Returns the kind and packet number of a sample dump frame.
pub fn dump_frame(message: &[u8]) -> Option<(u8, u8)> {
    match message {
        [SYSEX_START, NON_REALTIME_ID, _, DUMP_HEADER_TAG, ..] => Some((DUMP_HEADER_TAG, 0)),
        [SYSEX_START, NON_REALTIME_ID, _, DATA_PACKET_TAG, packet_number, ..] => {
            Some((DATA_PACKET_TAG, *packet_number))
        }
        _ => None,
    }
}

/// Acknowledges every dump frame and reports [`MOCK_FIRMWARE`] when asked.
fn acknowledge(message: &[u8]) -> Vec<Vec<u8>> {
    if let Some((_, packet_number)) = dump_frame(message) {
        return codec::encode_control_reply(ControlReply::Ack(packet_number))
            .into_iter()
            .collect();
    }
    if message == control::version_request().as_slice() {
        return vec![control::version_reply(&MOCK_FIRMWARE)];
    }
    Vec::new()
}
