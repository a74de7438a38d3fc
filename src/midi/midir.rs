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
use std::{collections::HashMap, fmt, mem};

use midir::{
    Ignore, MidiInput, MidiInputConnection, MidiInputPort, MidiOutput, MidiOutputConnection,
    MidiOutputPort,
};
use midly::live::LiveEvent;
use parking_lot::Mutex;
use tokio::sync::mpsc::{error::TrySendError, Sender};
use tracing::{debug, info, span, warn, Level};

use super::TransportError;
use crate::sds::SYSEX_START;

pub struct Transport {
    name: String,
    input_port: Option<MidiInputPort>,
    output_port: Option<MidiOutputPort>,
    event_connection: Mutex<Option<MidiInputConnection<()>>>,
    idle_sender: Mutex<Option<Sender<Vec<u8>>>>,
    output_connection: Mutex<Option<MidiOutputConnection>>,
}

fn midi_error<E: fmt::Display>(e: E) -> TransportError {
    TransportError::Midi(e.to_string())
}

impl Transport {
    fn new(name: String) -> Transport {
        Transport {
            name,
            input_port: None,
            output_port: None,
            event_connection: Mutex::new(None),
            idle_sender: Mutex::new(None),
            output_connection: Mutex::new(None),
        }
    }

    fn connect_output(&self) -> Result<MidiOutputConnection, TransportError> {
        let output_port = self
            .output_port
            .as_ref()
            .ok_or_else(|| TransportError::NoOutput(self.name.clone()))?;
        let output = MidiOutput::new("sdsload output").map_err(midi_error)?;
        output
            .connect(output_port, "sdsload sample dump")
            .map_err(midi_error)
    }
}

impl super::Transport for Transport {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn send(&self, message: &[u8]) -> Result<(), TransportError> {
        // Opened on first use and kept for the life of the device.
        let mut output_connection = self.output_connection.lock();
        if output_connection.is_none() {
            *output_connection = Some(self.connect_output()?);
        }
        let Some(connection) = output_connection.as_mut() else {
            return Err(TransportError::Closed);
        };
        connection.send(message).map_err(midi_error)
    }

    fn watch_events(&self, sender: Sender<Vec<u8>>) -> Result<(), TransportError> {
        let span = span!(Level::INFO, "watch events (midir)");
        let _enter = span.enter();

        let mut event_connection = self.event_connection.lock();
        let mut idle_sender = self.idle_sender.lock();
        if event_connection.is_some() || idle_sender.is_some() {
            return Err(TransportError::AlreadyWatching);
        }

        let input_port = match self.input_port.as_ref() {
            Some(input_port) => input_port,
            None => {
                warn!(
                    device = self.name,
                    "No MIDI input configured, the device will be treated as non-handshaking."
                );
                // Held so that waits for replies time out rather than see a closed stream.
                *idle_sender = Some(sender);
                return Ok(());
            }
        };

        info!(device = self.name, "Watching MIDI events.");

        let mut input = MidiInput::new("sdsload input").map_err(midi_error)?;
        // SysEx is filtered out by default, and every reply we care about is SysEx.
        input.ignore(Ignore::None);
        *event_connection = Some(
            input
                .connect(
                    input_port,
                    "sdsload reply watcher",
                    move |_, raw_event, _| {
                        if raw_event.first() != Some(&SYSEX_START) {
                            if let Ok(event) = LiveEvent::parse(raw_event) {
                                debug!(event = format!("{:?}", event), "Received MIDI event.");
                            }
                        }
                        match sender.try_send(Vec::from(raw_event)) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!("Inbound MIDI queue is full, dropping message.")
                            }
                            Err(TrySendError::Closed(_)) => {
                                debug!("Inbound MIDI receiver closed.")
                            }
                        }
                    },
                    (),
                )
                .map_err(midi_error)?,
        );

        Ok(())
    }

    fn stop_watch_events(&self) {
        // Explicitly drop the connection.
        let event_connection = self.event_connection.lock().take();
        mem::drop(event_connection);
        self.idle_sender.lock().take();
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut capabilities: Vec<String> = Vec::new();
        if self.input_port.is_some() {
            capabilities.push(String::from("Input"));
        }
        if self.output_port.is_some() {
            capabilities.push(String::from("Output"));
        }

        write!(f, "{} ({})", self.name, capabilities.join("/"))
    }
}

/// Lists midir devices and produces the Transport trait.
pub fn list() -> Result<Vec<Box<dyn super::Transport>>, TransportError> {
    Ok(list_midir_devices()?
        .into_iter()
        .map(|device| {
            let device: Box<dyn super::Transport> = Box::new(device);
            device
        })
        .collect())
}

/// Lists midir devices, merging input and output ports that share a name.
fn list_midir_devices() -> Result<Vec<Transport>, TransportError> {
    let input = MidiInput::new("sdsload input listing").map_err(midi_error)?;
    let output = MidiOutput::new("sdsload output listing").map_err(midi_error)?;

    let mut devices: HashMap<String, Transport> = HashMap::new();

    for port in input.ports() {
        let name = input.port_name(&port).map_err(midi_error)?;
        devices
            .entry(name.clone())
            .or_insert_with(|| Transport::new(name))
            .input_port = Some(port);
    }

    for port in output.ports() {
        let name = output.port_name(&port).map_err(midi_error)?;
        devices
            .entry(name.clone())
            .or_insert_with(|| Transport::new(name))
            .output_port = Some(port);
    }

    let mut sorted_devices = devices.into_values().collect::<Vec<Transport>>();
    sorted_devices.sort_by_key(|device| device.name.clone());
    Ok(sorted_devices)
}

/// Gets the given midir device.
pub fn get(name: &str) -> Result<Transport, TransportError> {
    let mut matches = list_midir_devices()?
        .into_iter()
        .filter(|device| device.name.contains(name))
        .collect::<Vec<Transport>>();

    if matches.is_empty() {
        return Err(TransportError::NotFound(name.to_string()));
    }
    if matches.len() > 1 {
        return Err(TransportError::Ambiguous(
            matches
                .iter()
                .map(|device| device.name.clone())
                .collect::<Vec<String>>()
                .join(", "),
        ));
    }

    // We've verified that there's only one element in the vector, so this should be safe.
    Ok(matches.swap_remove(0))
}
