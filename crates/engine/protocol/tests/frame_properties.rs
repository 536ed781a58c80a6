//! Frame-level properties of the wire codec.
//!
//! Every valid frame must survive decode → encode byte for byte, and every
//! strict prefix of a valid frame must report `Incomplete` rather than an
//! error, whatever the split point.

use bytes::Bytes;
use reactocraft_protocol::{
    decode, encode, BlockPosition, ChunkCoordinate, Decoded, DisconnectCode, MalformedFrame,
    Packet, PROTOCOL_VERSION,
};

fn sample_packets() -> Vec<Packet> {
    let chunk: Vec<u8> = (0..16 * 16 * 64).map(|i| (i % 7) as u8).collect();

    vec![
        Packet::Handshake {
            protocol_version: PROTOCOL_VERSION,
        },
        Packet::Handshake {
            protocol_version: u32::MAX,
        },
        Packet::HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
        },
        Packet::Login {
            player: "alice".into(),
            view_distance: 6,
        },
        Packet::Login {
            player: String::new(),
            view_distance: 0,
        },
        Packet::LoginSuccess {
            session_id: 0xDEAD_BEEF,
            view_distance: 6,
        },
        Packet::LoginFailure {
            reason: "player already online".into(),
        },
        Packet::ChunkRequest {
            coord: ChunkCoordinate::new(0, 0),
        },
        Packet::ChunkRequest {
            coord: ChunkCoordinate::new(i32::MIN, i32::MAX),
        },
        Packet::ChunkData {
            coord: ChunkCoordinate::new(-4, 12),
            blocks: Bytes::from(chunk),
        },
        Packet::ChunkUnavailable {
            coord: ChunkCoordinate::new(5, 5),
            reason: "terrain generation failed".into(),
        },
        Packet::ChunkUnload {
            coord: ChunkCoordinate::new(1, 1),
        },
        Packet::BlockUpdate {
            position: BlockPosition::new(-100, 3, 250),
            block: 4,
        },
        Packet::EntityUpdate {
            entity_id: 12,
            position: [-0.5, 65.0, 1e9],
        },
        Packet::PlayerPosition {
            position: [8.0, 64.0, 8.0],
        },
        Packet::KeepAlive { id: 0 },
        Packet::Resync,
        Packet::Disconnect {
            code: DisconnectCode::VersionMismatch,
            message: "server speaks protocol 7".into(),
        },
    ]
}

#[test]
fn decode_then_encode_reproduces_bytes() {
    for packet in sample_packets() {
        let frame = encode(&packet);

        let decoded = match decode(&frame) {
            Ok(Decoded::Frame { packet, consumed }) => {
                assert_eq!(consumed, frame.len(), "{} consumed", packet.name());
                packet
            }
            other => panic!("{}: expected a frame, got {other:?}", packet.name()),
        };

        assert_eq!(decoded, packet);
        assert_eq!(encode(&decoded), frame, "{} re-encoding", packet.name());
    }
}

#[test]
fn every_truncated_prefix_is_incomplete() {
    for packet in sample_packets() {
        let frame = encode(&packet);
        for cut in 0..frame.len() {
            assert_eq!(
                decode(&frame[..cut]),
                Ok(Decoded::Incomplete),
                "{} cut at {cut} of {}",
                packet.name(),
                frame.len()
            );
        }
    }
}

#[test]
fn back_to_back_frames_decode_one_at_a_time() {
    let packets = sample_packets();
    let mut wire = Vec::new();
    for packet in &packets {
        wire.extend_from_slice(&encode(packet));
    }

    let mut offset = 0;
    let mut seen = Vec::new();
    while offset < wire.len() {
        match decode(&wire[offset..]) {
            Ok(Decoded::Frame { packet, consumed }) => {
                seen.push(packet);
                offset += consumed;
            }
            other => panic!("unexpected {other:?} at offset {offset}"),
        }
    }

    assert_eq!(seen, packets);
}

#[test]
fn string_length_past_frame_end_is_malformed() {
    // login_failure claiming a 5 byte reason inside a 3 byte frame
    let wire = [3u8, 0x04, 5, b'x'];
    assert!(matches!(
        decode(&wire),
        Err(MalformedFrame::Truncated { field: "reason", .. })
    ));
}
