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
//! Pure encoders and decoders for SDS frames.

use super::{
    ControlReply, ACK_TAG, BITS_PER_SAMPLE, CANCEL_TAG, CHANNEL_ID, DATA_PACKET_TAG,
    DUMP_HEADER_TAG, NAK_TAG, NON_REALTIME_ID, NO_LOOP, PACKET_PAYLOAD_LEN, SAMPLES_PER_PACKET,
    SYSEX_END, SYSEX_START, WAIT_TAG,
};

/// The dump header announcing an upcoming transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    pub slot: u16,
    pub bits_per_sample: u8,
    /// Sample period in nanoseconds, least significant 7-bit group first.
    pub period_ns: [u8; 3],
    /// Sample length in words, least significant 7-bit group first.
    pub length_words: [u8; 3],
    pub loop_start: [u8; 3],
    pub loop_end: [u8; 3],
    pub loop_type: u8,
}

impl DumpHeader {
    /// Serializes the header into a complete SysEx message.
    pub fn to_sysex(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(21);
        message.extend_from_slice(&[SYSEX_START, NON_REALTIME_ID, CHANNEL_ID, DUMP_HEADER_TAG]);
        message.push((self.slot & 0x7F) as u8);
        message.push(((self.slot >> 7) & 0x7F) as u8);
        message.push(self.bits_per_sample);
        message.extend_from_slice(&self.period_ns);
        message.extend_from_slice(&self.length_words);
        message.extend_from_slice(&self.loop_start);
        message.extend_from_slice(&self.loop_end);
        message.push(self.loop_type);
        message.push(SYSEX_END);
        message
    }
}

/// A single data packet: 40 packed samples plus a checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub packet_number: u8,
    pub payload: [u8; PACKET_PAYLOAD_LEN],
    pub checksum: u8,
}

impl DataPacket {
    /// Serializes the packet into a complete SysEx message.
    pub fn to_sysex(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(PACKET_PAYLOAD_LEN + 7);
        message.extend_from_slice(&[
            SYSEX_START,
            NON_REALTIME_ID,
            CHANNEL_ID,
            DATA_PACKET_TAG,
            self.packet_number & 0x7F,
        ]);
        message.extend_from_slice(&self.payload);
        message.push(self.checksum);
        message.push(SYSEX_END);
        message
    }
}

/// Packs a signed 16-bit sample into three left-justified 7-bit bytes.
pub fn pack_sample16(sample: i16) -> [u8; 3] {
    let unsigned = (sample as i32 + 0x8000) as u16;
    [
        ((unsigned >> 9) & 0x7F) as u8,
        ((unsigned >> 2) & 0x7F) as u8,
        ((unsigned & 0x03) << 5) as u8,
    ]
}

/// Inverse of [`pack_sample16`]. The device never sends samples back, so this
/// only exists to verify packing.
pub fn unpack_sample16(packed: [u8; 3]) -> i16 {
    let unsigned = ((packed[0] as u32 & 0x7F) << 9)
        | ((packed[1] as u32 & 0x7F) << 2)
        | ((packed[2] as u32 >> 5) & 0x03);
    (unsigned as i32 - 0x8000) as i16
}

/// Computes the 7-bit data packet checksum.
pub fn checksum(packet_number: u8, payload: &[u8]) -> u8 {
    let folded = payload.iter().fold(0u8, |acc, byte| acc ^ byte);
    (NON_REALTIME_ID ^ CHANNEL_ID ^ DATA_PACKET_TAG ^ (packet_number & 0x7F) ^ folded) & 0x7F
}

/// Builds the data packet starting at `byte_offset` into 16-bit little-endian PCM.
/// Samples past the end of `pcm` are encoded as silence.
pub fn build_data_packet(packet_number: u8, pcm: &[u8], byte_offset: usize) -> DataPacket {
    let packet_number = packet_number & 0x7F;
    let mut payload = [0u8; PACKET_PAYLOAD_LEN];

    for (i, chunk) in payload.chunks_exact_mut(3).enumerate() {
        let at = byte_offset + i * 2;
        let sample = match pcm.get(at..at + 2) {
            Some(bytes) => i16::from_le_bytes([bytes[0], bytes[1]]),
            None => 0,
        };
        chunk.copy_from_slice(&pack_sample16(sample));
    }
    debug_assert_eq!(payload.len() / 3, SAMPLES_PER_PACKET);

    DataPacket {
        packet_number,
        checksum: checksum(packet_number, &payload),
        payload,
    }
}

/// Builds the dump header for a transfer of `total_byte_length` PCM bytes. The
/// loop points are both set to the sample length, which together with the
/// loop type sentinel means "no loop".
pub fn build_dump_header(
    slot: u16,
    bits_per_sample: u8,
    sample_rate: u32,
    total_byte_length: usize,
) -> DumpHeader {
    let period_ns = (1e9 / sample_rate as f64).round() as u32;
    let length_words = split_7bit((total_byte_length / 2) as u32);

    DumpHeader {
        slot,
        bits_per_sample,
        period_ns: split_7bit(period_ns),
        length_words,
        loop_start: length_words,
        loop_end: length_words,
        loop_type: NO_LOOP,
    }
}

/// Builds the default 16-bit dump header.
pub fn build_default_dump_header(slot: u16, sample_rate: u32, total_byte_length: usize) -> DumpHeader {
    build_dump_header(slot, BITS_PER_SAMPLE, sample_rate, total_byte_length)
}

/// Parses a handshake reply. Returns `None` for anything that isn't one,
/// which is distinct from a reply that never arrived ([`ControlReply::Timeout`]).
pub fn parse_control_reply(bytes: &[u8]) -> Option<ControlReply> {
    let body = match bytes {
        [SYSEX_START, body @ .., SYSEX_END] => body,
        _ => return None,
    };

    // ID, channel, tag, and an optional echoed packet number.
    let (id, tag, rest) = match body {
        [id, _channel, tag, rest @ ..] => (*id, *tag, rest),
        _ => return None,
    };
    if id != NON_REALTIME_ID {
        return None;
    }

    let packet_number = rest.first().map(|n| n & 0x7F).unwrap_or(0);
    match tag {
        ACK_TAG => Some(ControlReply::Ack(packet_number)),
        NAK_TAG => Some(ControlReply::Nak(packet_number)),
        WAIT_TAG => Some(ControlReply::Wait(packet_number)),
        CANCEL_TAG => Some(ControlReply::Cancel(packet_number)),
        _ => None,
    }
}

/// Encodes a handshake reply the way a device would send it.
pub fn encode_control_reply(reply: ControlReply) -> Option<Vec<u8>> {
    let (tag, packet_number) = match reply {
        ControlReply::Ack(n) => (ACK_TAG, n),
        ControlReply::Nak(n) => (NAK_TAG, n),
        ControlReply::Wait(n) => (WAIT_TAG, n),
        ControlReply::Cancel(n) => (CANCEL_TAG, n),
        ControlReply::Timeout => return None,
    };
    Some(vec![
        SYSEX_START,
        NON_REALTIME_ID,
        CHANNEL_ID,
        tag,
        packet_number & 0x7F,
        SYSEX_END,
    ])
}

/// Splits a value into three 7-bit groups, least significant first.
fn split_7bit(value: u32) -> [u8; 3] {
    [
        (value & 0x7F) as u8,
        ((value >> 7) & 0x7F) as u8,
        ((value >> 14) & 0x7F) as u8,
    ]
}

#[cfg(test)]
fn join_7bit(groups: [u8; 3]) -> u32 {
    groups[0] as u32 | (groups[1] as u32) << 7 | (groups[2] as u32) << 14
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pack_sample16_exact_bytes() {
        assert_eq!(pack_sample16(0), [0x40, 0x00, 0x00]);
        assert_eq!(pack_sample16(1), [0x40, 0x00, 0x20]);
        assert_eq!(pack_sample16(-1), [0x3F, 0x7F, 0x60]);
        assert_eq!(pack_sample16(i16::MAX), [0x7F, 0x7F, 0x60]);
        assert_eq!(pack_sample16(i16::MIN), [0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_pack_unpack_every_sample() {
        for sample in i16::MIN..=i16::MAX {
            let packed = pack_sample16(sample);
            assert!(packed.iter().all(|b| *b < 0x80));
            assert_eq!(packed[2] & 0x1F, 0);
            assert_eq!(unpack_sample16(packed), sample);
        }
    }

    #[test]
    fn test_silent_packet() {
        let packet = build_data_packet(0, &[], 0);
        assert_eq!(packet.packet_number, 0);
        assert!(packet.payload.chunks(3).all(|c| c == [0x40, 0x00, 0x00]));
        // Forty 0x40 bytes cancel out, leaving 0x7E ^ 0x00 ^ 0x02.
        assert_eq!(packet.checksum, 0x7C);

        let message = packet.to_sysex();
        assert_eq!(message.len(), 127);
        assert_eq!(&message[..5], &[0xF0, 0x7E, 0x00, 0x02, 0x00]);
        assert_eq!(&message[125..], &[0x7C, 0xF7]);
    }

    #[test]
    fn test_data_packet_reads_little_endian_and_pads() {
        // One full-scale sample followed by nothing.
        let pcm = i16::MAX.to_le_bytes();
        let packet = build_data_packet(0, &pcm, 0);
        assert_eq!(&packet.payload[..3], &[0x7F, 0x7F, 0x60]);
        assert_eq!(&packet.payload[3..6], &[0x40, 0x00, 0x00]);
        assert_eq!(packet.checksum, 0x5C);
    }

    #[test]
    fn test_data_packet_offset() {
        let pcm: Vec<u8> = (0..100i16).flat_map(|s| s.to_le_bytes()).collect();
        let packet = build_data_packet(1, &pcm, 80);
        assert_eq!(unpack_sample16([packet.payload[0], packet.payload[1], packet.payload[2]]), 40);
        let last = &packet.payload[117..120];
        assert_eq!(unpack_sample16([last[0], last[1], last[2]]), 79);
    }

    #[test]
    fn test_data_packet_number_wraps() {
        let packet = build_data_packet(130, &[], 0);
        assert_eq!(packet.packet_number, 2);
    }

    #[test]
    fn test_checksum_determinism() {
        let pcm: Vec<u8> = (0..40i16).flat_map(|s| (s * 311).to_le_bytes()).collect();
        let packet = build_data_packet(9, &pcm, 0);
        assert_eq!(packet.checksum, build_data_packet(9, &pcm, 0).checksum);
        assert_eq!(packet.checksum, checksum(9, &packet.payload));
        assert!(packet.checksum < 0x80);

        assert_ne!(packet.checksum, checksum(10, &packet.payload));
        for i in 0..packet.payload.len() {
            let mut changed = packet.payload;
            changed[i] ^= 0x01;
            assert_ne!(packet.checksum, checksum(9, &changed), "byte {}", i);
        }
    }

    #[test]
    fn test_dump_header_fields() {
        let header = build_dump_header(5, 16, 44100, 8820);
        assert_eq!(join_7bit(header.period_ns), 22676);
        assert_eq!(header.period_ns, [0x14, 0x31, 0x01]);
        assert_eq!(join_7bit(header.length_words), 4410);
        assert_eq!(header.loop_start, header.length_words);
        assert_eq!(header.loop_end, header.length_words);
        assert_eq!(header.loop_type, NO_LOOP);

        assert_eq!(
            header.to_sysex(),
            vec![
                0xF0, 0x7E, 0x00, 0x01, 0x05, 0x00, 0x10, 0x14, 0x31, 0x01, 0x3A, 0x22, 0x00,
                0x3A, 0x22, 0x00, 0x3A, 0x22, 0x00, 0x7F, 0xF7
            ]
        );
    }

    #[test]
    fn test_dump_header_high_slot() {
        let message = build_default_dump_header(200, 44100, 2).to_sysex();
        assert_eq!(message[4], 200 & 0x7F);
        assert_eq!(message[5], 1);
        assert_eq!(message[6], 16);
    }

    #[test]
    fn test_parse_control_reply() {
        assert_eq!(
            parse_control_reply(&[0xF0, 0x7E, 0x00, 0x7F, 0x05, 0xF7]),
            Some(ControlReply::Ack(5))
        );
        assert_eq!(
            parse_control_reply(&[0xF0, 0x7E, 0x00, 0x7E, 0x06, 0xF7]),
            Some(ControlReply::Nak(6))
        );
        assert_eq!(
            parse_control_reply(&[0xF0, 0x7E, 0x00, 0x7C, 0x03, 0xF7]),
            Some(ControlReply::Wait(3))
        );
        assert_eq!(
            parse_control_reply(&[0xF0, 0x7E, 0x00, 0x7D, 0x7F, 0xF7]),
            Some(ControlReply::Cancel(0x7F))
        );
        // The packet number is optional.
        assert_eq!(
            parse_control_reply(&[0xF0, 0x7E, 0x00, 0x7F, 0xF7]),
            Some(ControlReply::Ack(0))
        );
    }

    #[test]
    fn test_parse_control_reply_ignores_other_messages() {
        // Note on.
        assert_eq!(parse_control_reply(&[0x90, 0x3C, 0x64]), None);
        // Dump header echo.
        assert_eq!(parse_control_reply(&build_default_dump_header(1, 44100, 2).to_sysex()), None);
        // Manufacturer specific SysEx.
        assert_eq!(parse_control_reply(&[0xF0, 0x7D, 0x7F, 0x7F, 0x00, 0xF7]), None);
        // Truncated.
        assert_eq!(parse_control_reply(&[0xF0, 0x7E, 0x00, 0xF7]), None);
        assert_eq!(parse_control_reply(&[0xF0, 0x7E, 0x00, 0x7F, 0x05]), None);
        assert_eq!(parse_control_reply(&[]), None);
    }

    #[test]
    fn test_control_reply_round_trip() {
        for reply in [
            ControlReply::Ack(1),
            ControlReply::Nak(2),
            ControlReply::Wait(3),
            ControlReply::Cancel(4),
        ] {
            let encoded = encode_control_reply(reply).unwrap();
            assert_eq!(parse_control_reply(&encoded), Some(reply));
        }
        assert_eq!(encode_control_reply(ControlReply::Timeout), None);
    }
}
