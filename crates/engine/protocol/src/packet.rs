//! Packet kinds and their field layouts.

use crate::coords::{BlockPosition, ChunkCoordinate};
use crate::frame::MalformedFrame;
use crate::varint::{read_varint, write_varint, VarIntRead};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Packet tag bytes. Stable across builds sharing a protocol version.
pub mod tags {
    pub const HANDSHAKE: u8 = 0x00;
    pub const HANDSHAKE_ACK: u8 = 0x01;
    pub const LOGIN: u8 = 0x02;
    pub const LOGIN_SUCCESS: u8 = 0x03;
    pub const LOGIN_FAILURE: u8 = 0x04;
    pub const CHUNK_REQUEST: u8 = 0x05;
    pub const CHUNK_DATA: u8 = 0x06;
    pub const CHUNK_UNAVAILABLE: u8 = 0x07;
    pub const CHUNK_UNLOAD: u8 = 0x08;
    pub const BLOCK_UPDATE: u8 = 0x09;
    pub const ENTITY_UPDATE: u8 = 0x0A;
    pub const PLAYER_POSITION: u8 = 0x0B;
    pub const KEEP_ALIVE: u8 = 0x0C;
    pub const RESYNC: u8 = 0x0D;
    pub const DISCONNECT: u8 = 0x0E;
}

/// Why a side is ending the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectCode {
    ClientQuit = 0,
    VersionMismatch = 1,
    ProtocolViolation = 2,
    LoginTimeout = 3,
    Backpressure = 4,
    IdleTimeout = 5,
    ServerShutdown = 6,
}

impl DisconnectCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::ClientQuit,
            1 => Self::VersionMismatch,
            2 => Self::ProtocolViolation,
            3 => Self::LoginTimeout,
            4 => Self::Backpressure,
            5 => Self::IdleTimeout,
            6 => Self::ServerShutdown,
            _ => return None,
        })
    }
}

impl fmt::Display for DisconnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ClientQuit => "client quit",
            Self::VersionMismatch => "version mismatch",
            Self::ProtocolViolation => "protocol violation",
            Self::LoginTimeout => "login timeout",
            Self::Backpressure => "backpressure",
            Self::IdleTimeout => "idle timeout",
            Self::ServerShutdown => "server shutdown",
        };
        f.write_str(name)
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Client -> Server: first packet on every connection.
    Handshake { protocol_version: u32 },
    /// Server -> Client: handshake accepted.
    HandshakeAck { protocol_version: u32 },
    /// Client -> Server: identity and requested view distance.
    Login { player: String, view_distance: u8 },
    /// Server -> Client: session created, with the granted view distance.
    LoginSuccess { session_id: u64, view_distance: u8 },
    /// Server -> Client: login rejected; the connection closes next.
    LoginFailure { reason: String },
    /// Client -> Server: send me this chunk.
    ChunkRequest { coord: ChunkCoordinate },
    /// Server -> Client: raw block data for a chunk.
    ChunkData { coord: ChunkCoordinate, blocks: Bytes },
    /// Server -> Client: the chunk could not be produced.
    ChunkUnavailable { coord: ChunkCoordinate, reason: String },
    /// Server -> Client: chunk left the view distance and may be dropped.
    ChunkUnload { coord: ChunkCoordinate },
    /// Both directions: a single block changed.
    BlockUpdate { position: BlockPosition, block: u16 },
    /// Server -> Client: another entity moved.
    EntityUpdate { entity_id: u64, position: [f64; 3] },
    /// Client -> Server: the player moved.
    PlayerPosition { position: [f64; 3] },
    /// Both directions: liveness check, echoed by the peer.
    KeepAlive { id: u64 },
    /// Server -> Client: updates were dropped, re-request chunks in view.
    Resync,
    /// Both directions: the sender is closing the connection.
    Disconnect { code: DisconnectCode, message: String },
}

impl Packet {
    pub fn tag(&self) -> u8 {
        match self {
            Packet::Handshake { .. } => tags::HANDSHAKE,
            Packet::HandshakeAck { .. } => tags::HANDSHAKE_ACK,
            Packet::Login { .. } => tags::LOGIN,
            Packet::LoginSuccess { .. } => tags::LOGIN_SUCCESS,
            Packet::LoginFailure { .. } => tags::LOGIN_FAILURE,
            Packet::ChunkRequest { .. } => tags::CHUNK_REQUEST,
            Packet::ChunkData { .. } => tags::CHUNK_DATA,
            Packet::ChunkUnavailable { .. } => tags::CHUNK_UNAVAILABLE,
            Packet::ChunkUnload { .. } => tags::CHUNK_UNLOAD,
            Packet::BlockUpdate { .. } => tags::BLOCK_UPDATE,
            Packet::EntityUpdate { .. } => tags::ENTITY_UPDATE,
            Packet::PlayerPosition { .. } => tags::PLAYER_POSITION,
            Packet::KeepAlive { .. } => tags::KEEP_ALIVE,
            Packet::Resync => tags::RESYNC,
            Packet::Disconnect { .. } => tags::DISCONNECT,
        }
    }

    /// Short name for logs and error messages.
    pub fn name(&self) -> &'static str {
        tag_name(self.tag()).unwrap_or("unknown")
    }

    pub(crate) fn write_body(&self, dst: &mut BytesMut) {
        dst.put_u8(self.tag());
        match self {
            Packet::Handshake { protocol_version } | Packet::HandshakeAck { protocol_version } => {
                write_varint(dst, *protocol_version);
            }
            Packet::Login {
                player,
                view_distance,
            } => {
                put_blob(dst, player.as_bytes());
                dst.put_u8(*view_distance);
            }
            Packet::LoginSuccess {
                session_id,
                view_distance,
            } => {
                dst.put_u64(*session_id);
                dst.put_u8(*view_distance);
            }
            Packet::LoginFailure { reason } => put_blob(dst, reason.as_bytes()),
            Packet::ChunkRequest { coord } | Packet::ChunkUnload { coord } => put_coord(dst, coord),
            Packet::ChunkData { coord, blocks } => {
                put_coord(dst, coord);
                put_blob(dst, blocks);
            }
            Packet::ChunkUnavailable { coord, reason } => {
                put_coord(dst, coord);
                put_blob(dst, reason.as_bytes());
            }
            Packet::BlockUpdate { position, block } => {
                dst.put_i32(position.x);
                dst.put_i32(position.y);
                dst.put_i32(position.z);
                dst.put_u16(*block);
            }
            Packet::EntityUpdate {
                entity_id,
                position,
            } => {
                dst.put_u64(*entity_id);
                put_vec3(dst, position);
            }
            Packet::PlayerPosition { position } => put_vec3(dst, position),
            Packet::KeepAlive { id } => dst.put_u64(*id),
            Packet::Resync => {}
            Packet::Disconnect { code, message } => {
                dst.put_u8(*code as u8);
                put_blob(dst, message.as_bytes());
            }
        }
    }

    /// Parse a frame body. `body` starts at the tag and ends exactly at the
    /// end of the frame.
    pub(crate) fn read_body(body: &[u8]) -> Result<Packet, MalformedFrame> {
        let (&tag, fields) = body.split_first().ok_or(MalformedFrame::Empty)?;
        let name = tag_name(tag).ok_or(MalformedFrame::UnknownTag(tag))?;
        let mut r = FieldReader::new(name, fields);

        let packet = match tag {
            tags::HANDSHAKE => Packet::Handshake {
                protocol_version: r.varint("protocol_version")?,
            },
            tags::HANDSHAKE_ACK => Packet::HandshakeAck {
                protocol_version: r.varint("protocol_version")?,
            },
            tags::LOGIN => Packet::Login {
                player: r.string("player")?,
                view_distance: r.u8("view_distance")?,
            },
            tags::LOGIN_SUCCESS => Packet::LoginSuccess {
                session_id: r.u64("session_id")?,
                view_distance: r.u8("view_distance")?,
            },
            tags::LOGIN_FAILURE => Packet::LoginFailure {
                reason: r.string("reason")?,
            },
            tags::CHUNK_REQUEST => Packet::ChunkRequest {
                coord: r.coord()?,
            },
            tags::CHUNK_DATA => Packet::ChunkData {
                coord: r.coord()?,
                blocks: Bytes::copy_from_slice(r.blob("blocks")?),
            },
            tags::CHUNK_UNAVAILABLE => Packet::ChunkUnavailable {
                coord: r.coord()?,
                reason: r.string("reason")?,
            },
            tags::CHUNK_UNLOAD => Packet::ChunkUnload { coord: r.coord()? },
            tags::BLOCK_UPDATE => Packet::BlockUpdate {
                position: BlockPosition::new(r.i32("x")?, r.i32("y")?, r.i32("z")?),
                block: r.u16("block")?,
            },
            tags::ENTITY_UPDATE => Packet::EntityUpdate {
                entity_id: r.u64("entity_id")?,
                position: r.vec3()?,
            },
            tags::PLAYER_POSITION => Packet::PlayerPosition {
                position: r.vec3()?,
            },
            tags::KEEP_ALIVE => Packet::KeepAlive { id: r.u64("id")? },
            tags::RESYNC => Packet::Resync,
            tags::DISCONNECT => {
                let raw = r.u8("code")?;
                Packet::Disconnect {
                    code: DisconnectCode::from_u8(raw)
                        .ok_or(MalformedFrame::UnknownDisconnectCode(raw))?,
                    message: r.string("message")?,
                }
            }
            _ => return Err(MalformedFrame::UnknownTag(tag)),
        };

        r.finish()?;
        Ok(packet)
    }
}

fn tag_name(tag: u8) -> Option<&'static str> {
    Some(match tag {
        tags::HANDSHAKE => "handshake",
        tags::HANDSHAKE_ACK => "handshake_ack",
        tags::LOGIN => "login",
        tags::LOGIN_SUCCESS => "login_success",
        tags::LOGIN_FAILURE => "login_failure",
        tags::CHUNK_REQUEST => "chunk_request",
        tags::CHUNK_DATA => "chunk_data",
        tags::CHUNK_UNAVAILABLE => "chunk_unavailable",
        tags::CHUNK_UNLOAD => "chunk_unload",
        tags::BLOCK_UPDATE => "block_update",
        tags::ENTITY_UPDATE => "entity_update",
        tags::PLAYER_POSITION => "player_position",
        tags::KEEP_ALIVE => "keep_alive",
        tags::RESYNC => "resync",
        tags::DISCONNECT => "disconnect",
        _ => return None,
    })
}

fn put_blob(dst: &mut BytesMut, data: &[u8]) {
    write_varint(dst, data.len() as u32);
    dst.put_slice(data);
}

fn put_coord(dst: &mut BytesMut, coord: &ChunkCoordinate) {
    dst.put_i32(coord.x);
    dst.put_i32(coord.z);
}

fn put_vec3(dst: &mut BytesMut, v: &[f64; 3]) {
    for component in v {
        dst.put_f64(*component);
    }
}

/// Bounds-checked cursor over the fields of one complete frame. Running out
/// of bytes here is malformed, never incomplete, because the frame length
/// already promised the bytes were there.
struct FieldReader<'a> {
    packet: &'static str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn new(packet: &'static str, data: &'a [u8]) -> Self {
        Self {
            packet,
            data,
            pos: 0,
        }
    }

    fn take(&mut self, field: &'static str, len: usize) -> Result<&'a [u8], MalformedFrame> {
        let end = self.pos.checked_add(len).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(MalformedFrame::Truncated {
                packet: self.packet,
                field,
            });
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], MalformedFrame> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(field, N)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, MalformedFrame> {
        Ok(self.take(field, 1)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, MalformedFrame> {
        self.array(field).map(u16::from_be_bytes)
    }

    fn i32(&mut self, field: &'static str) -> Result<i32, MalformedFrame> {
        self.array(field).map(i32::from_be_bytes)
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, MalformedFrame> {
        self.array(field).map(u64::from_be_bytes)
    }

    fn f64(&mut self, field: &'static str) -> Result<f64, MalformedFrame> {
        self.array(field).map(f64::from_be_bytes)
    }

    fn varint(&mut self, field: &'static str) -> Result<u32, MalformedFrame> {
        match read_varint(&self.data[self.pos..]) {
            Ok(VarIntRead::Value { value, len }) => {
                self.pos += len;
                Ok(value)
            }
            Ok(VarIntRead::Incomplete) => Err(MalformedFrame::Truncated {
                packet: self.packet,
                field,
            }),
            Err(source) => Err(MalformedFrame::FieldVarInt {
                packet: self.packet,
                field,
                source,
            }),
        }
    }

    fn blob(&mut self, field: &'static str) -> Result<&'a [u8], MalformedFrame> {
        let len = self.varint(field)? as usize;
        self.take(field, len)
    }

    fn string(&mut self, field: &'static str) -> Result<String, MalformedFrame> {
        let raw = self.blob(field)?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| MalformedFrame::InvalidUtf8 {
                packet: self.packet,
                field,
            })
    }

    fn coord(&mut self) -> Result<ChunkCoordinate, MalformedFrame> {
        Ok(ChunkCoordinate::new(self.i32("x")?, self.i32("z")?))
    }

    fn vec3(&mut self) -> Result<[f64; 3], MalformedFrame> {
        Ok([self.f64("x")?, self.f64("y")?, self.f64("z")?])
    }

    fn finish(self) -> Result<(), MalformedFrame> {
        let remaining = self.data.len() - self.pos;
        if remaining > 0 {
            return Err(MalformedFrame::TrailingBytes {
                packet: self.packet,
                count: remaining,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(packet: &Packet) -> Vec<u8> {
        let mut buf = BytesMut::new();
        packet.write_body(&mut buf);
        buf.to_vec()
    }

    #[test]
    fn chunk_request_layout() {
        let bytes = body(&Packet::ChunkRequest {
            coord: ChunkCoordinate::new(1, -1),
        });
        assert_eq!(
            bytes,
            vec![tags::CHUNK_REQUEST, 0, 0, 0, 1, 0xFF, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn login_layout() {
        let bytes = body(&Packet::Login {
            player: "alice".into(),
            view_distance: 4,
        });
        assert_eq!(bytes, vec![tags::LOGIN, 5, b'a', b'l', b'i', b'c', b'e', 4]);
    }

    #[test]
    fn every_packet_reads_back() {
        let packets = vec![
            Packet::Handshake { protocol_version: 7 },
            Packet::HandshakeAck { protocol_version: 7 },
            Packet::LoginSuccess {
                session_id: 42,
                view_distance: 8,
            },
            Packet::LoginFailure {
                reason: "name taken".into(),
            },
            Packet::ChunkData {
                coord: ChunkCoordinate::new(3, 4),
                blocks: Bytes::from_static(&[1, 2, 3]),
            },
            Packet::ChunkUnavailable {
                coord: ChunkCoordinate::new(5, 5),
                reason: "generator failed".into(),
            },
            Packet::ChunkUnload {
                coord: ChunkCoordinate::new(-9, 2),
            },
            Packet::BlockUpdate {
                position: BlockPosition::new(-3, 60, 17),
                block: 513,
            },
            Packet::EntityUpdate {
                entity_id: 9,
                position: [1.5, 64.0, -2.25],
            },
            Packet::PlayerPosition {
                position: [0.0, 70.0, 0.0],
            },
            Packet::KeepAlive { id: u64::MAX },
            Packet::Resync,
            Packet::Disconnect {
                code: DisconnectCode::Backpressure,
                message: "slow".into(),
            },
        ];

        for packet in packets {
            let bytes = body(&packet);
            assert_eq!(Packet::read_body(&bytes), Ok(packet));
        }
    }

    #[test]
    fn unknown_disconnect_code_is_malformed() {
        let bytes = vec![tags::DISCONNECT, 200, 0];
        assert_eq!(
            Packet::read_body(&bytes),
            Err(MalformedFrame::UnknownDisconnectCode(200))
        );
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let bytes = vec![tags::LOGIN_FAILURE, 2, 0xC3, 0x28];
        assert!(matches!(
            Packet::read_body(&bytes),
            Err(MalformedFrame::InvalidUtf8 { field: "reason", .. })
        ));
    }

    #[test]
    fn short_fields_are_truncated() {
        let bytes = vec![tags::KEEP_ALIVE, 0, 0, 0];
        assert!(matches!(
            Packet::read_body(&bytes),
            Err(MalformedFrame::Truncated { field: "id", .. })
        ));
    }
}
