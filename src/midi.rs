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
use std::{fmt, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc::{self, Receiver, Sender},
    time::{sleep_until, timeout_at, Instant},
};
use tracing::{debug, info};

mod midir;
pub mod mock;

/// How many inbound messages may queue up before the transport starts dropping them.
const INBOUND_CAPACITY: usize = 256;

/// Errors raised by a MIDI transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no MIDI transport is bound")]
    Unavailable,

    #[error("MIDI transport closed")]
    Closed,

    #[error("no device found with name {0}")]
    NotFound(String),

    #[error("found too many devices that match ({0}), use a less ambiguous device name")]
    Ambiguous(String),

    #[error("{0} has no MIDI output")]
    NoOutput(String),

    #[error("already watching events")]
    AlreadyWatching,

    #[error("MIDI error: {0}")]
    Midi(String),
}

/// A bidirectional MIDI channel to a single device.
pub trait Transport: fmt::Display + std::marker::Send + std::marker::Sync {
    /// Returns the name of the device.
    fn name(&self) -> String;

    /// Sends a complete MIDI message.
    fn send(&self, message: &[u8]) -> Result<(), TransportError>;

    /// Watches MIDI input and forwards every raw message, in arrival order, to the sender.
    fn watch_events(&self, sender: Sender<Vec<u8>>) -> Result<(), TransportError>;

    /// Stops watching events.
    fn stop_watch_events(&self);
}

/// Lists devices known to midir.
pub fn list_devices() -> Result<Vec<Box<dyn Transport>>, TransportError> {
    midir::list()
}

/// Gets a device with the given name. Names starting with "mock" produce a
/// mock device that acknowledges everything.
pub fn get_device(name: &str) -> Result<Arc<dyn Transport>, TransportError> {
    if name.starts_with("mock") {
        return Ok(Arc::new(mock::Transport::get(name)));
    };

    Ok(Arc::new(midir::get(name)?))
}

/// The reply currently being waited on.
#[derive(Debug)]
struct PendingWait {
    what: &'static str,
    deadline: Instant,
}

/// Clears the pending wait even if the waiting future is dropped.
struct PendingGuard<'a>(&'a mut Option<PendingWait>);

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.take();
    }
}

struct Link {
    transport: Arc<dyn Transport>,
    inbound: Receiver<Vec<u8>>,
}

/// The connection to a device. Owns the bound transport and its inbound
/// message stream, and allows at most one outstanding wait for a reply.
pub struct DeviceConnection {
    link: Option<Link>,
    pending: Option<PendingWait>,
}

impl DeviceConnection {
    /// Creates a connection with no transport bound.
    pub fn new() -> DeviceConnection {
        DeviceConnection {
            link: None,
            pending: None,
        }
    }

    /// Creates a connection bound to the given transport.
    pub fn bound(transport: Arc<dyn Transport>) -> Result<DeviceConnection, TransportError> {
        let mut connection = DeviceConnection::new();
        connection.bind(transport)?;
        Ok(connection)
    }

    /// Binds the transport, replacing any previously bound one.
    pub fn bind(&mut self, transport: Arc<dyn Transport>) -> Result<(), TransportError> {
        self.detach();

        let (sender, inbound) = mpsc::channel::<Vec<u8>>(INBOUND_CAPACITY);
        transport.watch_events(sender)?;
        info!(device = transport.name(), "Bound MIDI transport.");
        self.link = Some(Link { transport, inbound });
        Ok(())
    }

    /// Detaches the bound transport, if any.
    pub fn detach(&mut self) {
        if let Some(link) = self.link.take() {
            link.transport.stop_watch_events();
            info!(device = link.transport.name(), "Detached MIDI transport.");
        }
    }

    /// Returns true if a transport is bound.
    pub fn is_bound(&self) -> bool {
        self.link.is_some()
    }

    /// Returns the name of the bound device.
    pub fn device_name(&self) -> Option<String> {
        self.link.as_ref().map(|link| link.transport.name())
    }

    /// Sends a message over the bound transport.
    pub fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        debug_assert!(
            self.pending.is_none(),
            "sent a message while a reply was outstanding"
        );
        match self.link.as_ref() {
            Some(link) => link.transport.send(message),
            None => Err(TransportError::Unavailable),
        }
    }

    /// Drops any inbound messages that arrived while nobody was waiting.
    pub fn discard_inbound(&mut self) -> usize {
        let mut discarded = 0;
        if let Some(link) = self.link.as_mut() {
            while link.inbound.try_recv().is_ok() {
                discarded += 1;
            }
        }
        if discarded > 0 {
            debug!(discarded, "Discarded stale inbound messages.");
        }
        discarded
    }

    /// Waits for the next inbound message that `parse` recognizes. Messages it
    /// doesn't recognize are discarded. Returns `None` if nothing matched before
    /// the timeout.
    pub async fn await_message<T, F>(
        &mut self,
        what: &'static str,
        timeout: Duration,
        mut parse: F,
    ) -> Result<Option<T>, TransportError>
    where
        F: FnMut(&[u8]) -> Option<T>,
    {
        let DeviceConnection { link, pending } = self;
        let link = link.as_mut().ok_or(TransportError::Unavailable)?;

        if let Some(outstanding) = pending.as_ref() {
            debug_assert!(
                false,
                "awaiting {} while {} is outstanding",
                what, outstanding.what
            );
        }
        let deadline = Instant::now() + timeout;
        *pending = Some(PendingWait { what, deadline });
        let _guard = PendingGuard(pending);

        loop {
            match timeout_at(deadline, link.inbound.recv()).await {
                Ok(Some(message)) => match parse(&message) {
                    Some(parsed) => return Ok(Some(parsed)),
                    None => debug!(
                        waiting_for = what,
                        len = message.len(),
                        "Discarding unrelated inbound message."
                    ),
                },
                Ok(None) => {
                    // The transport delivers no input, so nothing can arrive before the deadline.
                    debug!(waiting_for = what, "No inbound messages available.");
                    sleep_until(deadline).await;
                    return Ok(None);
                }
                Err(_) => return Ok(None),
            }
        }
    }
}

impl Default for DeviceConnection {
    fn default() -> Self {
        DeviceConnection::new()
    }
}

impl Drop for DeviceConnection {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("device", &self.device_name())
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_unbound_connection() {
        let mut connection = DeviceConnection::new();
        assert!(!connection.is_bound());
        assert!(matches!(
            connection.send(&[0xF0, 0xF7]),
            Err(TransportError::Unavailable)
        ));
        assert!(matches!(
            connection
                .await_message("anything", Duration::from_millis(10), |_| Some(()))
                .await,
            Err(TransportError::Unavailable)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_skips_unrelated_messages() -> Result<(), TransportError> {
        let transport = mock::Transport::silent("mock-silent");
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;

        transport.inject(&[0x90, 0x3C, 0x64]);
        transport.inject(&[0xF0, 0x01, 0xF7]);
        let found = connection
            .await_message("sysex", Duration::from_millis(100), |message| {
                (message.first() == Some(&0xF0)).then(|| message.to_vec())
            })
            .await?;
        assert_eq!(found, Some(vec![0xF0, 0x01, 0xF7]));

        let nothing = connection
            .await_message("sysex", Duration::from_millis(100), |_| Some(()))
            .await?;
        assert_eq!(nothing, None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_times_out_without_input() -> Result<(), TransportError> {
        let transport = mock::Transport::without_input("mock-output-only");
        let mut connection = DeviceConnection::bound(Arc::new(transport))?;

        let start = Instant::now();
        let nothing = connection
            .await_message("sysex", Duration::from_millis(250), |_| Some(()))
            .await?;
        assert_eq!(nothing, None);
        assert!(start.elapsed() >= Duration::from_millis(250));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_and_detach() -> Result<(), TransportError> {
        let transport = mock::Transport::silent("mock-silent");
        let mut connection = DeviceConnection::bound(Arc::new(transport.clone()))?;
        assert_eq!(connection.device_name(), Some("mock-silent".to_string()));

        transport.inject(&[0x01]);
        transport.inject(&[0x02]);
        assert_eq!(connection.discard_inbound(), 2);

        connection.detach();
        assert!(!connection.is_bound());
        assert!(!transport.is_watching());
        Ok(())
    }
}
