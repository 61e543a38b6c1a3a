//! Variable-length integer encoding.
//!
//! Cells store payload lengths as unsigned LEB128 varints and row keys as
//! zigzag-mapped varints, so small negative keys stay as short as small
//! positive ones.

/// Longest encoding of a `u64`
pub const MAX_VARINT_LEN: usize = 10;

/// Encode a u64 as a variable-length integer.
///
/// Each byte carries 7 data bits; the high bit is set when more bytes follow.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    put_varint(&mut buf, value);
    buf
}

/// Append the varint encoding of `value` to `buf`
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Decode a variable-length integer from a byte slice.
///
/// Returns the decoded value and the number of bytes consumed, or `None`
/// when the encoding is truncated or longer than ten bytes.
pub fn decode_varint(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;

    for (i, &byte) in bytes.iter().take(MAX_VARINT_LEN).enumerate() {
        let shift = 7 * i as u32;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }

    None
}

/// Number of bytes `encode_varint(value)` produces
pub fn varint_size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(7)
}

/// Map a signed key onto an unsigned value (0, -1, 1, -2, ... -> 0, 1, 2, 3, ...)
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}
