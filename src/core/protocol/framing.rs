//! Packet framing
//!
//! Outbound packets are `[0x58, length, sequence, checksum, command, payload...]`.
//! Inbound responses are `[type, length, sequence, checksum, command, sequence, payload...]`
//! where bytes 4 and 5 echo the command code and sequence id of the request.

use super::checksum::{self, CHECKSUM_OFFSET};
use super::command::Command;
use bytes::Bytes;
use thiserror::Error;

/// Fixed protocol header of every outbound packet
pub const PACKET_HEADER: [u8; 4] = [0x58, 0x00, 0x00, 0x00];

/// Offset of the total length byte
pub const LENGTH_OFFSET: usize = 1;
/// Offset of the sequence id
pub const SEQUENCE_OFFSET: usize = 2;
/// Offset of the echoed command code in a response
pub const RESPONSE_COMMAND_OFFSET: usize = 4;
/// Offset of the echoed sequence id in a response
pub const RESPONSE_SEQUENCE_OFFSET: usize = 5;
/// Offset of the first payload byte in a response
pub const RESPONSE_PAYLOAD_OFFSET: usize = 6;

/// Response type tag of unsolicited measurement notifications
pub const MEASUREMENT_RESPONSE: u8 = 0x20;
/// Response type tag the device uses for command responses
pub const COMMAND_RESPONSE: u8 = 0x5A;

/// Largest packet the one-byte length field can describe
pub const MAX_PACKET_LEN: usize = u8::MAX as usize;

/// Sequence counter value after INIT; the first framed packet carries `0xFE`
pub const INITIAL_SEQUENCE: u8 = 0xFF;

/// Framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Packet does not fit the one-byte length field
    #[error("Packet too long: {0} bytes (max 255)")]
    TooLong(usize),
}

/// A finalized outbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command code at offset 4
    pub command: u8,
    /// Sequence id at offset 2
    pub sequence: u8,
    /// Wire bytes
    pub bytes: Bytes,
}

/// Build a packet with an explicit sequence id
pub fn build_packet(command: u8, payload: &[u8], sequence: u8) -> Result<Vec<u8>, FrameError> {
    let len = PACKET_HEADER.len() + 1 + payload.len();
    if len > MAX_PACKET_LEN {
        return Err(FrameError::TooLong(len));
    }

    let mut packet = Vec::with_capacity(len);
    packet.extend_from_slice(&PACKET_HEADER);
    packet.push(command);
    packet.extend_from_slice(payload);

    packet[LENGTH_OFFSET] = len as u8;
    packet[SEQUENCE_OFFSET] = sequence;
    packet[CHECKSUM_OFFSET] = checksum::calculate(&packet);
    debug_assert!(checksum::verify(&packet));

    Ok(packet)
}

/// Build a device response packet.
///
/// Used by the virtual device; the engine itself never sends responses.
pub fn build_response(
    response_type: u8,
    command: u8,
    sequence: u8,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let len = RESPONSE_PAYLOAD_OFFSET + payload.len();
    if len > MAX_PACKET_LEN {
        return Err(FrameError::TooLong(len));
    }

    let mut packet = vec![response_type, len as u8, sequence, 0x00, command, sequence];
    packet.extend_from_slice(payload);
    packet[CHECKSUM_OFFSET] = checksum::calculate(&packet);
    Ok(packet)
}

/// Split a packet into transport-sized chunks
pub fn chunks(packet: &[u8], max_len: usize) -> std::slice::Chunks<'_, u8> {
    packet.chunks(max_len.max(1))
}

/// Frames commands with the device's rolling sequence counter
#[derive(Debug, Clone)]
pub struct Framer {
    sequence: u8,
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

impl Framer {
    /// Create a framer with a fresh counter
    pub fn new() -> Self {
        Self {
            sequence: INITIAL_SEQUENCE,
        }
    }

    /// Reset the counter, as done before INIT
    pub fn reset(&mut self) {
        self.sequence = INITIAL_SEQUENCE;
    }

    /// Sequence id of the most recently framed packet
    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Frame a command, decrementing the counter.
    ///
    /// The counter is left untouched when the command cannot be framed.
    pub fn frame(&mut self, command: &Command) -> Result<Frame, FrameError> {
        let sequence = self.sequence.wrapping_sub(1);
        let bytes = build_packet(command.code, &command.payload, sequence)?;
        self.sequence = sequence;

        Ok(Frame {
            command: command.code,
            sequence,
            bytes: Bytes::from(bytes),
        })
    }
}

/// Response type tag of a complete response
pub fn response_type(response: &[u8]) -> Option<u8> {
    response.first().copied()
}

/// Echoed `(command, sequence)` of a complete command response
pub fn response_key(response: &[u8]) -> Option<(u8, u8)> {
    Some((
        *response.get(RESPONSE_COMMAND_OFFSET)?,
        *response.get(RESPONSE_SEQUENCE_OFFSET)?,
    ))
}

/// Payload of a command response (bytes from offset 6)
pub fn response_payload(response: &[u8]) -> &[u8] {
    response.get(RESPONSE_PAYLOAD_OFFSET..).unwrap_or(&[])
}
