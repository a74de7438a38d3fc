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
use std::{fmt, time::Duration};

use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    codec, packet_count, ControlReply, TransferError, HEADER_REPLY_TIMEOUT,
    PACKET_REPLY_TIMEOUT, PCM_BYTES_PER_PACKET, WAIT_REPLY_TIMEOUT,
};
use crate::{audio::ProcessedAudio, midi::DeviceConnection, playsync::CancelHandle};

/// The states of a single slot transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHeaderReply,
    StreamingHandshake,
    StreamingNonHandshake,
    Complete,
    Failed,
    Cancelled,
}

impl SessionState {
    /// Returns true if the session can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Complete | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::AwaitingHeaderReply => "awaiting header reply",
            SessionState::StreamingHandshake => "streaming (handshake)",
            SessionState::StreamingNonHandshake => "streaming (no handshake)",
            SessionState::Complete => "complete",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A progress report, emitted on every send and every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub state: SessionState,
    pub packets_sent: usize,
    pub successful_packets: usize,
    pub total_packets: usize,
}

impl Progress {
    /// The fraction of packets delivered, from 0.0 to 1.0.
    pub fn fraction(&self) -> f64 {
        if self.total_packets == 0 {
            return 1.0;
        }
        self.successful_packets as f64 / self.total_packets as f64
    }

    /// The whole percentage of packets delivered. Only reaches 100 once every packet is out.
    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).floor() as u8
    }
}

/// Counters describing what a session did on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub header_sends: usize,
    pub packets_sent: usize,
    pub successful_packets: usize,
    /// Replies waited for, including ones that timed out.
    pub replies_awaited: usize,
    pub naks: usize,
    pub waits: usize,
    /// True if the device stopped handshaking partway through.
    pub fell_back: bool,
}

/// Drives one slot transfer to completion over a device connection.
///
/// The session borrows the connection mutably for its whole life, so no other
/// session or control request can wait on the same transport while it runs.
pub struct TransferSession<'a> {
    connection: &'a mut DeviceConnection,
    audio: &'a ProcessedAudio,
    slot: u16,
    cancel_handle: CancelHandle,
    state: SessionState,
    packet_number: u8,
    byte_offset: usize,
    total_packets: usize,
    stats: SessionStats,
}

impl<'a> TransferSession<'a> {
    /// Creates a session that will write the audio into the given slot.
    pub fn new(
        connection: &'a mut DeviceConnection,
        slot: u16,
        audio: &'a ProcessedAudio,
    ) -> TransferSession<'a> {
        TransferSession {
            connection,
            audio,
            slot,
            cancel_handle: CancelHandle::new(),
            state: SessionState::AwaitingHeaderReply,
            packet_number: 0,
            byte_offset: 0,
            total_packets: packet_count(audio.pcm_bytes().len()),
            stats: SessionStats::default(),
        }
    }

    /// Uses the given cancel handle, checked before every frame is sent.
    pub fn with_cancel_handle(mut self, cancel_handle: CancelHandle) -> TransferSession<'a> {
        self.cancel_handle = cancel_handle;
        self
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the transfer, reporting progress through `on_progress`.
    pub async fn run<F>(mut self, mut on_progress: F) -> Result<SessionStats, TransferError>
    where
        F: FnMut(&Progress),
    {
        let span = info_span!(
            "transfer session",
            slot = self.slot,
            source = self.audio.source_name()
        );

        async move {
            info!(
                bytes = self.audio.pcm_bytes().len(),
                packets = self.total_packets,
                "Starting sample transfer."
            );

            let result = self.transfer(&mut on_progress).await;
            let final_state = match &result {
                Ok(()) => SessionState::Complete,
                Err(TransferError::Cancelled) => SessionState::Cancelled,
                Err(_) => SessionState::Failed,
            };
            self.transition(final_state, &mut on_progress);

            match result {
                Ok(()) => {
                    info!(
                        packets = self.stats.successful_packets,
                        naks = self.stats.naks,
                        fell_back = self.stats.fell_back,
                        "Sample transfer complete."
                    );
                    Ok(self.stats)
                }
                Err(e) => {
                    warn!(err = e.to_string(), "Sample transfer stopped.");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn transfer<F>(&mut self, on_progress: &mut F) -> Result<(), TransferError>
    where
        F: FnMut(&Progress),
    {
        if !self.connection.is_bound() {
            return Err(TransferError::TransportUnavailable);
        }
        self.check_cancelled()?;
        self.connection.discard_inbound();

        let mode = self.negotiate(on_progress).await?;
        self.transition(mode, on_progress);
        self.stream(on_progress).await
    }

    /// Sends the dump header and works out from the reply whether the device
    /// handshakes.
    async fn negotiate<F>(&mut self, on_progress: &mut F) -> Result<SessionState, TransferError>
    where
        F: FnMut(&Progress),
    {
        let header = codec::build_default_dump_header(
            self.slot,
            self.audio.sample_rate(),
            self.audio.pcm_bytes().len(),
        )
        .to_sysex();

        self.send_header(&header, on_progress)?;
        match self.header_verdict().await? {
            ControlReply::Ack(_) => return Ok(SessionState::StreamingHandshake),
            ControlReply::Timeout => {
                info!("No reply to the dump header, streaming without handshaking.");
                return Ok(SessionState::StreamingNonHandshake);
            }
            ControlReply::Cancel(packet_number) => {
                return Err(TransferError::DeviceCancelled { packet_number })
            }
            ControlReply::Nak(_) | ControlReply::Wait(_) => {
                warn!("Device rejected the dump header, resending.");
            }
        }

        self.check_cancelled()?;
        self.send_header(&header, on_progress)?;
        match self.header_verdict().await? {
            ControlReply::Ack(_) => Ok(SessionState::StreamingHandshake),
            ControlReply::Timeout => Ok(SessionState::StreamingNonHandshake),
            _ => Err(TransferError::HeaderRejectedTwice),
        }
    }

    async fn stream<F>(&mut self, on_progress: &mut F) -> Result<(), TransferError>
    where
        F: FnMut(&Progress),
    {
        let audio = self.audio;
        let pcm = audio.pcm_bytes();

        while self.byte_offset < pcm.len() {
            self.check_cancelled()?;

            let packet = codec::build_data_packet(self.packet_number, pcm, self.byte_offset);
            self.connection.send(&packet.to_sysex())?;
            self.stats.packets_sent += 1;
            self.report(on_progress);

            if self.state == SessionState::StreamingNonHandshake {
                self.advance(on_progress);
                continue;
            }

            match self.await_reply(PACKET_REPLY_TIMEOUT).await? {
                ControlReply::Ack(_) => self.advance(on_progress),
                ControlReply::Nak(_) => {
                    debug!(packet = self.packet_number, "Device rejected packet, resending.")
                }
                ControlReply::Wait(_) => match self.await_final_reply().await? {
                    ControlReply::Ack(_) => self.advance(on_progress),
                    ControlReply::Nak(_) => {
                        debug!(packet = self.packet_number, "Device rejected packet, resending.")
                    }
                    ControlReply::Cancel(packet_number) => {
                        return Err(TransferError::DeviceCancelled { packet_number })
                    }
                    ControlReply::Timeout | ControlReply::Wait(_) => {
                        self.fall_back(on_progress);
                        self.advance(on_progress);
                    }
                },
                ControlReply::Cancel(packet_number) => {
                    return Err(TransferError::DeviceCancelled { packet_number })
                }
                ControlReply::Timeout => {
                    self.fall_back(on_progress);
                    self.advance(on_progress);
                }
            }
        }

        Ok(())
    }

    fn send_header<F>(&mut self, header: &[u8], on_progress: &mut F) -> Result<(), TransferError>
    where
        F: FnMut(&Progress),
    {
        self.connection.send(header)?;
        self.stats.header_sends += 1;
        self.report(on_progress);
        Ok(())
    }

    /// Waits for the header reply, resolving any WAIT into a final verdict.
    async fn header_verdict(&mut self) -> Result<ControlReply, TransferError> {
        match self.await_reply(HEADER_REPLY_TIMEOUT).await? {
            ControlReply::Wait(_) => self.await_final_reply().await,
            reply => Ok(reply),
        }
    }

    /// Waits for the verdict that follows a WAIT. Repeated WAITs extend the wait.
    async fn await_final_reply(&mut self) -> Result<ControlReply, TransferError> {
        loop {
            match self.await_reply(WAIT_REPLY_TIMEOUT).await? {
                ControlReply::Wait(_) => {
                    self.check_cancelled()?;
                    debug!("Device asked to wait again.");
                }
                reply => return Ok(reply),
            }
        }
    }

    async fn await_reply(&mut self, timeout: Duration) -> Result<ControlReply, TransferError> {
        self.stats.replies_awaited += 1;
        let reply = self
            .connection
            .await_message("sample dump reply", timeout, codec::parse_control_reply)
            .await?
            .unwrap_or(ControlReply::Timeout);

        match reply {
            ControlReply::Nak(_) => self.stats.naks += 1,
            ControlReply::Wait(_) => self.stats.waits += 1,
            _ => {}
        }
        if let Some(echoed) = reply.packet_number() {
            if self.state != SessionState::AwaitingHeaderReply && echoed != self.packet_number {
                debug!(
                    expected = self.packet_number,
                    echoed, "Reply echoes a different packet number."
                );
            }
        }
        Ok(reply)
    }

    fn advance<F>(&mut self, on_progress: &mut F)
    where
        F: FnMut(&Progress),
    {
        self.stats.successful_packets += 1;
        self.byte_offset += PCM_BYTES_PER_PACKET;
        self.packet_number = (self.packet_number + 1) & 0x7F;
        self.report(on_progress);
    }

    fn fall_back<F>(&mut self, on_progress: &mut F)
    where
        F: FnMut(&Progress),
    {
        warn!(
            packet = self.packet_number,
            "Device stopped acknowledging, continuing without handshaking."
        );
        self.stats.fell_back = true;
        self.transition(SessionState::StreamingNonHandshake, on_progress);
    }

    fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancel_handle.is_cancelled() {
            info!(packet = self.packet_number, "Transfer cancelled.");
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn transition<F>(&mut self, state: SessionState, on_progress: &mut F)
    where
        F: FnMut(&Progress),
    {
        if state != self.state {
            info!(from = %self.state, to = %state, "Transfer state changed.");
            self.state = state;
        }
        self.report(on_progress);
    }

    fn report<F>(&self, on_progress: &mut F)
    where
        F: FnMut(&Progress),
    {
        on_progress(&Progress {
            state: self.state,
            packets_sent: self.stats.packets_sent,
            successful_packets: self.stats.successful_packets,
            total_packets: self.total_packets,
        });
    }
}
