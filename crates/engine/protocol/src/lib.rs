//! ReactoCraft wire protocol.
//!
//! Every message travels as one length-prefixed frame:
//!
//! ```text
//! [Length: varint]  number of bytes that follow (tag + fields)
//! [Tag: u8]         packet kind, see `packet::tags`
//! [Fields]          packet specific, big-endian fixed width integers,
//!                   varint-prefixed strings and byte blobs
//! ```
//!
//! [`decode`] is pure: it inspects a buffer and reports either a complete
//! [`Packet`] with the number of bytes it used, [`Decoded::Incomplete`] when
//! more bytes are needed, or a [`MalformedFrame`] which is fatal for the
//! connection. [`PacketCodec`] wraps the same functions for `tokio_util`
//! framed streams.
//!
//! Field layouts, the chunk size and the protocol version are this server's
//! own contract and are not byte compatible with any other voxel game.

pub mod codec;
pub mod coords;
pub mod frame;
pub mod packet;
pub mod varint;

pub use codec::{CodecError, PacketCodec};
pub use coords::{BlockPosition, ChunkCoordinate, CHUNK_WIDTH};
pub use frame::{decode, encode, encode_into, Decoded, MalformedFrame, MAX_FRAME_LEN};
pub use packet::{DisconnectCode, Packet};

/// Protocol version spoken by this build. Clients announce theirs in the
/// handshake and are turned away on mismatch.
pub const PROTOCOL_VERSION: u32 = 7;
