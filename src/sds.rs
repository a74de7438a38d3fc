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

//! MIDI Sample Dump Standard (SDS) transfer protocol.
//!
//! Samples are moved into a device slot as a dump header followed by a run of
//! fixed-size data packets. Every frame is a non-realtime SysEx message. Devices
//! that implement handshaking answer each frame with ACK/NAK/WAIT/CANCEL; devices
//! that don't are fed open-loop.

use std::time::Duration;

pub mod codec;
pub mod error;
pub mod session;

pub use codec::{DataPacket, DumpHeader};
pub use error::TransferError;
pub use session::{Progress, SessionState, SessionStats, TransferSession};

/// Start of a SysEx message.
pub const SYSEX_START: u8 = 0xF0;
/// End of a SysEx message.
pub const SYSEX_END: u8 = 0xF7;
/// Universal non-realtime SysEx ID.
pub const NON_REALTIME_ID: u8 = 0x7E;
/// The SysEx channel the device listens on.
pub const CHANNEL_ID: u8 = 0x00;

pub const DUMP_HEADER_TAG: u8 = 0x01;
pub const DATA_PACKET_TAG: u8 = 0x02;
pub const WAIT_TAG: u8 = 0x7C;
pub const CANCEL_TAG: u8 = 0x7D;
pub const NAK_TAG: u8 = 0x7E;
pub const ACK_TAG: u8 = 0x7F;

/// Loop type sentinel meaning the sample does not loop.
pub const NO_LOOP: u8 = 0x7F;

/// The device's native sample width.
pub const BITS_PER_SAMPLE: u8 = 16;
/// Samples carried by a single data packet.
pub const SAMPLES_PER_PACKET: usize = 40;
/// PCM bytes consumed by a single data packet (16-bit samples).
pub const PCM_BYTES_PER_PACKET: usize = SAMPLES_PER_PACKET * 2;
/// Packed payload bytes in a single data packet (3 bytes per sample).
pub const PACKET_PAYLOAD_LEN: usize = SAMPLES_PER_PACKET * 3;

/// How long to wait for the device to answer the dump header.
pub const HEADER_REPLY_TIMEOUT: Duration = Duration::from_millis(2000);
/// How long to wait for the device to answer a data packet.
pub const PACKET_REPLY_TIMEOUT: Duration = Duration::from_millis(20);
/// How long to wait for a final verdict after the device asked us to WAIT.
pub const WAIT_REPLY_TIMEOUT: Duration = Duration::from_millis(30000);

/// A handshake reply from the device, or the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Ack(u8),
    Nak(u8),
    Wait(u8),
    Cancel(u8),
    /// No reply arrived before the deadline.
    Timeout,
}

impl ControlReply {
    /// The echoed packet number, if the reply carries one.
    pub fn packet_number(&self) -> Option<u8> {
        match self {
            ControlReply::Ack(n)
            | ControlReply::Nak(n)
            | ControlReply::Wait(n)
            | ControlReply::Cancel(n) => Some(*n),
            ControlReply::Timeout => None,
        }
    }
}

/// A protocol frame. Outbound frames are dump headers and data packets;
/// replies travel the other way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    DumpHeader(DumpHeader),
    DataPacket(DataPacket),
    Reply(ControlReply),
}

impl Frame {
    /// Serializes the frame into a complete SysEx message. A timeout has no
    /// wire representation.
    pub fn to_sysex(&self) -> Option<Vec<u8>> {
        match self {
            Frame::DumpHeader(header) => Some(header.to_sysex()),
            Frame::DataPacket(packet) => Some(packet.to_sysex()),
            Frame::Reply(reply) => codec::encode_control_reply(*reply),
        }
    }
}

/// Number of data packets needed to carry the given number of PCM bytes.
pub fn packet_count(total_bytes: usize) -> usize {
    total_bytes.div_ceil(PCM_BYTES_PER_PACKET)
}
