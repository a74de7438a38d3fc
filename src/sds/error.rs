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
use crate::midi::TransportError;

/// Terminal failures of a sample transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no MIDI transport is bound")]
    TransportUnavailable,

    #[error("transport error: {0}")]
    Transport(TransportError),

    #[error("device rejected the dump header twice")]
    HeaderRejectedTwice,

    #[error("device cancelled the transfer at packet {packet_number} (its sample storage may be full)")]
    DeviceCancelled { packet_number: u8 },

    #[error("cancelled")]
    Cancelled,
}

impl TransferError {
    /// Returns true if the device cancelled the transfer, which it usually does
    /// when it has run out of sample storage.
    pub fn is_storage_full(&self) -> bool {
        matches!(self, TransferError::DeviceCancelled { .. })
    }
}

impl From<TransportError> for TransferError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unavailable => TransferError::TransportUnavailable,
            e => TransferError::Transport(e),
        }
    }
}
