//! Packet checksum
//!
//! The device protects every outbound packet with an 8-bit additive checksum
//! stored at [`CHECKSUM_OFFSET`]. The checksum byte itself is excluded from the
//! sum, so the value is the wrapping sum of every other byte in the packet.

/// Offset of the checksum byte inside the packet header
pub const CHECKSUM_OFFSET: usize = 3;

/// Simple 8-bit sum
pub fn sum8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Calculate the checksum of a packet.
///
/// Starts from the negated checksum byte and then adds every byte of the
/// packet, which cancels whatever value currently sits at the checksum offset.
/// Packets shorter than the header have no checksum slot and sum as-is.
pub fn calculate(packet: &[u8]) -> u8 {
    let seed = packet
        .get(CHECKSUM_OFFSET)
        .map_or(0u8, |&b| 0u8.wrapping_sub(b));
    packet.iter().fold(seed, |acc, &b| acc.wrapping_add(b))
}

/// Verify the checksum stored in a finalized packet
pub fn verify(packet: &[u8]) -> bool {
    packet.get(CHECKSUM_OFFSET) == Some(&calculate(packet))
}
