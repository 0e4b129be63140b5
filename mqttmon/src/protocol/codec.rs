//! MQTT packet encoding/decoding primitives.
//!
//! Low-level readers and writers for the building blocks of MQTT 3.1.1
//! control packets: the fixed header, the variable-length remaining length,
//! big-endian integers and length-prefixed strings and binary data.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Largest value the remaining length field can carry (4 bytes).
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Control packet type (upper nibble of the first byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    PubRec = 5,
    PubRel = 6,
    PubComp = 7,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    /// Parse a packet type. 0 and 15 are reserved and yield `None`.
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => PacketType::Connect,
            2 => PacketType::ConnAck,
            3 => PacketType::Publish,
            4 => PacketType::PubAck,
            5 => PacketType::PubRec,
            6 => PacketType::PubRel,
            7 => PacketType::PubComp,
            8 => PacketType::Subscribe,
            9 => PacketType::SubAck,
            10 => PacketType::Unsubscribe,
            11 => PacketType::UnsubAck,
            12 => PacketType::PingReq,
            13 => PacketType::PingResp,
            14 => PacketType::Disconnect,
            _ => return None,
        })
    }

    /// Fixed-header flags every packet but PUBLISH must carry.
    pub fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::PubRel | PacketType::Subscribe | PacketType::Unsubscribe => Some(0x02),
            _ => Some(0x00),
        }
    }
}

/// Parsed fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub flags: u8,
    pub remaining_length: usize,
    /// Bytes taken by the fixed header itself (2..=5).
    pub header_length: usize,
}

/// Read a variable-length integer (remaining length encoding).
///
/// Returns `Ok(None)` when more bytes are needed and `Malformed` when a
/// fifth continuation byte shows up.
pub fn read_variable_int(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut multiplier = 1usize;
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(Error::Malformed("remaining length exceeds 4 bytes".to_string()));
        }

        value += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }

        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(Error::Malformed("remaining length exceeds 4 bytes".to_string()));
    }

    Ok(None)
}

/// Write a variable-length integer, returning the number of bytes written.
pub fn write_variable_int(buf: &mut BytesMut, mut value: usize) -> Result<usize> {
    if value > MAX_REMAINING_LENGTH {
        return Err(Error::Malformed(format!("remaining length {} too large", value)));
    }

    let mut written = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;

        if value > 0 {
            byte |= 0x80;
        }

        buf.put_u8(byte);
        written += 1;

        if value == 0 {
            return Ok(written);
        }
    }
}

/// Calculate the number of bytes needed for a variable-length integer.
pub const fn variable_int_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 128 * 128 {
        2
    } else if value < 128 * 128 * 128 {
        3
    } else {
        4
    }
}

/// Parse a fixed header, or `Ok(None)` if the buffer does not hold one yet.
pub fn read_fixed_header(buf: &[u8]) -> Result<Option<FixedHeader>> {
    let Some(&first_byte) = buf.first() else {
        return Ok(None);
    };

    let type_byte = first_byte >> 4;
    let flags = first_byte & 0x0F;

    let packet_type = PacketType::from_u8(type_byte)
        .ok_or_else(|| Error::Malformed(format!("unknown packet type {}", type_byte)))?;

    if let Some(required) = packet_type.required_flags() {
        if flags != required {
            return Err(Error::Malformed(format!(
                "invalid flags {:#04x} for {:?}",
                flags, packet_type
            )));
        }
    }

    let Some((remaining_length, var_len)) = read_variable_int(&buf[1..])? else {
        return Ok(None);
    };

    Ok(Some(FixedHeader {
        packet_type,
        flags,
        remaining_length,
        header_length: 1 + var_len,
    }))
}

/// Write a fixed header, returning its length.
pub fn write_fixed_header(
    buf: &mut BytesMut,
    packet_type: PacketType,
    flags: u8,
    remaining_length: usize,
) -> Result<usize> {
    buf.put_u8(((packet_type as u8) << 4) | (flags & 0x0F));
    Ok(1 + write_variable_int(buf, remaining_length)?)
}

/// Write a UTF-8 string (2-byte length prefix + data).
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<()> {
    write_binary(buf, s.as_bytes())
}

/// Write binary data (2-byte length prefix + data).
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    let len = u16::try_from(data.len())
        .map_err(|_| Error::Malformed(format!("field of {} bytes exceeds 65535", data.len())))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

/// Cursor over the body of a complete packet.
///
/// The body is known to be complete, so running short here means the
/// declared lengths are inconsistent and the packet is malformed.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::Malformed("unexpected end of packet".to_string()))?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn binary(&mut self) -> Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn string(&mut self) -> Result<String> {
        let bytes = self.binary()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| Error::Malformed("invalid utf-8 string".to_string()))
    }

    /// Everything left in the body.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fail if bytes are left over.
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Malformed(format!("{} trailing bytes", self.remaining())))
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::Malformed(format!(
                "field of {} bytes overruns packet ({} left)",
                len,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_int() {
        for value in [0, 1, 127, 128, 16383, 16384, 2097151, 2097152, MAX_REMAINING_LENGTH] {
            let mut buf = BytesMut::new();
            let written = write_variable_int(&mut buf, value).unwrap();
            let (decoded, consumed) = read_variable_int(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(written, consumed);
            assert_eq!(written, variable_int_len(value));
        }
    }

    #[test]
    fn test_variable_int_incomplete() {
        assert_eq!(read_variable_int(&[]).unwrap(), None);
        assert_eq!(read_variable_int(&[0x80]).unwrap(), None);
        assert_eq!(read_variable_int(&[0xFF, 0xFF, 0xFF]).unwrap(), None);
    }

    #[test]
    fn test_variable_int_too_long() {
        assert!(matches!(
            read_variable_int(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(read_variable_int(&[0x80, 0x80, 0x80, 0x80]), Err(Error::Malformed(_))));
        assert!(write_variable_int(&mut BytesMut::new(), MAX_REMAINING_LENGTH + 1).is_err());
    }

    #[test]
    fn test_fixed_header() {
        let header = read_fixed_header(&[0x30, 0x80, 0x01]).unwrap().unwrap();
        assert_eq!(header.packet_type, PacketType::Publish);
        assert_eq!(header.remaining_length, 128);
        assert_eq!(header.header_length, 3);

        assert_eq!(read_fixed_header(&[]).unwrap(), None);
        assert_eq!(read_fixed_header(&[0x30]).unwrap(), None);
    }

    #[test]
    fn test_fixed_header_rejects_reserved() {
        // type 0 and 15 are reserved
        assert!(read_fixed_header(&[0x00, 0x00]).is_err());
        assert!(read_fixed_header(&[0xF0, 0x00]).is_err());
        // SUBSCRIBE must carry flags 0x02
        assert!(read_fixed_header(&[0x80, 0x00]).is_err());
        // PINGREQ must carry flags 0x00
        assert!(read_fixed_header(&[0xC1, 0x00]).is_err());
    }

    #[test]
    fn test_reader() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "hello").unwrap();
        buf.put_u8(7);

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.string().unwrap(), "hello");
        assert!(reader.finish().is_err());
        assert_eq!(reader.u8().unwrap(), 7);
        assert!(reader.finish().is_ok());
        assert!(reader.u16().is_err());
    }

    #[test]
    fn test_reader_string_overrun() {
        // declares 10 bytes, carries 2
        let mut reader = Reader::new(&[0x00, 0x0A, b'a', b'b']);
        assert!(matches!(reader.string(), Err(Error::Malformed(_))));
    }
}
