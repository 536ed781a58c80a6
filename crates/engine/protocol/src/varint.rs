//! LEB128 variable-length unsigned integers.
//!
//! Used for frame lengths and for the length of strings and byte blobs.
//! Values are limited to `u32`, so an encoding is at most five bytes long and
//! the fifth byte may only carry the top four bits. Only the shortest
//! encoding of a value is accepted, which keeps decode/encode byte exact.

use bytes::BufMut;
use thiserror::Error;

/// Longest valid encoding of a `u32`.
pub const MAX_VARINT_LEN: usize = 5;

/// Result of reading a varint from the front of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarIntRead {
    /// A complete value occupying `len` bytes.
    Value { value: u32, len: usize },
    /// The buffer ended while the continuation bit was still set.
    Incomplete,
}

/// Reasons a varint can never become valid, no matter how many bytes follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VarIntError {
    #[error("varint is longer than {} bytes", MAX_VARINT_LEN)]
    TooLong,
    #[error("varint overflows u32")]
    Overflow,
    #[error("varint is not minimally encoded")]
    NonCanonical,
}

/// Read a varint from the start of `buf`.
pub fn read_varint(buf: &[u8]) -> Result<VarIntRead, VarIntError> {
    let mut value = 0u32;

    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        let bits = u32::from(byte & 0x7F);

        if i == MAX_VARINT_LEN - 1 {
            if byte & 0x80 != 0 {
                return Err(VarIntError::TooLong);
            }
            if bits > 0x0F {
                return Err(VarIntError::Overflow);
            }
        }

        value |= bits << (7 * i);

        if byte & 0x80 == 0 {
            // A zero final group after other groups means a shorter encoding exists.
            if i > 0 && byte == 0 {
                return Err(VarIntError::NonCanonical);
            }
            return Ok(VarIntRead::Value { value, len: i + 1 });
        }
    }

    Ok(VarIntRead::Incomplete)
}

/// Append the shortest encoding of `value`.
pub fn write_varint(dst: &mut impl BufMut, mut value: u32) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Number of bytes [`write_varint`] emits for `value`.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7F => 1,
        0x80..=0x3FFF => 2,
        0x4000..=0x1F_FFFF => 3,
        0x20_0000..=0x0FFF_FFFF => 4,
        _ => 5,
    }
}
