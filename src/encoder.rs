//! Two-byte 7-bit encoding for values wider than a data byte.

/// Largest value that survives a two-byte round trip.
pub const MAX_TWO_7BIT: u16 = 0x3FFF;

/// Splits `value` into its low and high 7-bit groups, low byte first.
/// Bits above 13 are dropped.
pub fn encode_two_7bit(value: u16) -> [u8; 2] {
    [(value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8]
}

pub fn decode_two_7bit(lsb: u8, msb: u8) -> u16 {
    u16::from(lsb & 0x7F) | (u16::from(msb & 0x7F) << 7)
}

/// Appends the two-byte encoding of every value to `out`.
pub fn extend_two_7bit(out: &mut Vec<u8>, values: impl IntoIterator<Item = u16>) {
    for value in values {
        out.extend_from_slice(&encode_two_7bit(value));
    }
}

/// Decodes consecutive byte pairs. A trailing odd byte is ignored.
pub fn decode_pairs(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| decode_two_7bit(pair[0], pair[1]))
}
