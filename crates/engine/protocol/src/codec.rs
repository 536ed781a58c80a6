use crate::frame::{decode, encode_into, Decoded, MalformedFrame};
use crate::packet::Packet;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Errors surfaced by [`PacketCodec`] on a framed stream.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] MalformedFrame),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// `tokio_util` adapter over [`decode`] and [`encode_into`].
///
/// Besides [`Packet`]s the encoder accepts pre-encoded frames as [`Bytes`],
/// which lets a broadcast encode once and share the buffer between
/// connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match decode(&src[..])? {
            Decoded::Frame { packet, consumed } => {
                src.advance(consumed);
                Ok(Some(packet))
            }
            Decoded::Incomplete => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        encode_into(&packet, dst);
        Ok(())
    }
}

impl Encoder<Bytes> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coords::ChunkCoordinate;
    use crate::frame::encode;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[tokio::test]
    async fn framed_stream_yields_packets_in_order() {
        let mut wire = Vec::new();
        {
            let mut sink = FramedWrite::new(&mut wire, PacketCodec::new());
            sink.send(Packet::Handshake { protocol_version: 7 })
                .await
                .unwrap();
            sink.send(encode(&Packet::ChunkRequest {
                coord: ChunkCoordinate::new(0, 0),
            }))
            .await
            .unwrap();
        }

        let mut stream = FramedRead::new(wire.as_slice(), PacketCodec::new());
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Packet::Handshake { protocol_version: 7 }
        );
        assert_eq!(
            stream.next().await.unwrap().unwrap(),
            Packet::ChunkRequest {
                coord: ChunkCoordinate::new(0, 0)
            }
        );
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn decoder_waits_for_split_frame() {
        let frame = encode(&Packet::KeepAlive { id: 99 });
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&frame[..4]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4);

        buf.extend_from_slice(&frame[4..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::KeepAlive { id: 99 })
        );
        assert!(buf.is_empty());
    }
}
