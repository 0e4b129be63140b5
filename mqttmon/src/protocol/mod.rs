//! MQTT 3.1.1 wire codec.
//!
//! [`Packet::encode`] turns a control packet into bytes and [`decode`]
//! parses one from the front of a buffer, reporting `Ok(None)` when more
//! bytes are needed. [`PacketBuffer`] wraps `decode` for streaming reads
//! where packets arrive split across several socket reads.

pub mod codec;
pub mod packet;

use bytes::{Buf, BytesMut};

use crate::error::Result;

pub use packet::{
    decode, ConnAck, Connect, Packet, Publish, SubAck, Subscribe, SubscribeFilter,
    SubscribeReasonCode, Unsubscribe,
};

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &[u8] = b"MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;

/// Accumulates bytes from the transport and splits them into packets.
#[derive(Debug)]
pub struct PacketBuffer {
    buf: BytesMut,
    max_packet_size: usize,
}

impl PacketBuffer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn inner_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Take the next complete packet, if one has fully arrived.
    pub fn next_packet(&mut self) -> Result<Option<Packet>> {
        match decode(&self.buf, self.max_packet_size)? {
            Some((packet, consumed)) => {
                self.buf.advance(consumed);
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::QoS;
    use bytes::Bytes;

    #[test]
    fn test_streaming_decode_byte_by_byte() {
        let mut wire = BytesMut::new();
        Packet::Publish(Publish::new("a/b", Bytes::from_static(b"one"), QoS::AtLeastOnce, false, 1))
            .encode(&mut wire)
            .unwrap();
        Packet::PingResp.encode(&mut wire).unwrap();

        let mut buffer = PacketBuffer::new(MAX_PACKET_SIZE);
        let mut packets = Vec::new();
        for byte in wire.iter() {
            buffer.extend(&[*byte]);
            while let Some(packet) = buffer.next_packet().unwrap() {
                packets.push(packet);
            }
        }

        assert_eq!(packets.len(), 2);
        assert!(matches!(&packets[0], Packet::Publish(p) if p.payload.as_ref() == b"one"));
        assert_eq!(packets[1], Packet::PingResp);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_streaming_decode_keeps_partial_tail() {
        let mut wire = BytesMut::new();
        Packet::PubAck(1).encode(&mut wire).unwrap();
        Packet::PubAck(2).encode(&mut wire).unwrap();

        let mut buffer = PacketBuffer::new(MAX_PACKET_SIZE);
        buffer.extend(&wire[..5]);

        assert_eq!(buffer.next_packet().unwrap(), Some(Packet::PubAck(1)));
        assert_eq!(buffer.next_packet().unwrap(), None);
        assert_eq!(buffer.len(), 1);

        buffer.extend(&wire[5..]);
        assert_eq!(buffer.next_packet().unwrap(), Some(Packet::PubAck(2)));
    }

    #[test]
    fn test_streaming_decode_malformed() {
        let mut buffer = PacketBuffer::new(MAX_PACKET_SIZE);
        buffer.extend(&[0xF0, 0x00]);
        assert!(matches!(buffer.next_packet(), Err(Error::Malformed(_))));
    }
}
