use crate::packet::Packet;
use crate::varint::{read_varint, varint_len, write_varint, VarIntError, VarIntRead};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Largest accepted frame body (tag + fields). A full chunk is 16 KiB, so
/// this leaves generous room while bounding per-connection buffering.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Outcome of [`decode`] on a buffer that is not malformed.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// One complete packet taken from the front of the buffer.
    Frame { packet: Packet, consumed: usize },
    /// Keep the buffer and wait for more bytes.
    Incomplete,
}

/// A frame that can never decode. Fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedFrame {
    #[error("invalid frame length prefix: {0}")]
    LengthPrefix(#[from] VarIntError),
    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },
    #[error("empty frame")]
    Empty,
    #[error("unknown packet tag 0x{0:02X}")]
    UnknownTag(u8),
    #[error("{packet}: truncated field `{field}`")]
    Truncated {
        packet: &'static str,
        field: &'static str,
    },
    #[error("{packet}: invalid varint in `{field}`: {source}")]
    FieldVarInt {
        packet: &'static str,
        field: &'static str,
        source: VarIntError,
    },
    #[error("{packet}: field `{field}` is not valid UTF-8")]
    InvalidUtf8 {
        packet: &'static str,
        field: &'static str,
    },
    #[error("unknown disconnect code {0}")]
    UnknownDisconnectCode(u8),
    #[error("{packet}: {count} trailing bytes")]
    TrailingBytes { packet: &'static str, count: usize },
}

/// Try to take one frame from the front of `buf`.
///
/// Never mutates anything and never returns a partial packet: while the
/// length prefix or the body is still arriving the answer is
/// [`Decoded::Incomplete`].
pub fn decode(buf: &[u8]) -> Result<Decoded, MalformedFrame> {
    let (len, prefix_len) = match read_varint(buf)? {
        VarIntRead::Value { value, len } => (value as usize, len),
        VarIntRead::Incomplete => return Ok(Decoded::Incomplete),
    };

    if len > MAX_FRAME_LEN {
        return Err(MalformedFrame::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    if len == 0 {
        return Err(MalformedFrame::Empty);
    }

    let total = prefix_len + len;
    if buf.len() < total {
        return Ok(Decoded::Incomplete);
    }

    let packet = Packet::read_body(&buf[prefix_len..total])?;
    Ok(Decoded::Frame {
        packet,
        consumed: total,
    })
}

/// Append the complete frame for `packet` to `dst`.
pub fn encode_into(packet: &Packet, dst: &mut BytesMut) {
    let mut body = BytesMut::new();
    packet.write_body(&mut body);
    debug_assert!(
        body.len() <= MAX_FRAME_LEN,
        "{} frame of {} bytes exceeds the protocol maximum",
        packet.name(),
        body.len()
    );

    dst.reserve(varint_len(body.len() as u32) + body.len());
    write_varint(dst, body.len() as u32);
    dst.extend_from_slice(&body);
}

/// Encode `packet` as a standalone frame.
pub fn encode(packet: &Packet) -> Bytes {
    let mut dst = BytesMut::new();
    encode_into(packet, &mut dst);
    dst.freeze()
}
