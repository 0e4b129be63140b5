//! MQTT 3.1.1 control packets.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::{ConnectReturnCode, LastWill, QoS};

use super::codec::{
    read_fixed_header, variable_int_len, write_binary, write_fixed_header, write_string,
    PacketType, Reader,
};
use super::{PROTOCOL_LEVEL, PROTOCOL_NAME};

/// MQTT 3.1.1 control packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNECT packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keep_alive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<LastWill>,
}

/// CONNACK packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// PUBLISH packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Zero for QoS 0.
    pub pkid: u16,
}

/// SUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

/// Subscribe filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    pub qos: QoS,
}

impl SubscribeFilter {
    pub fn new(path: impl Into<String>, qos: QoS) -> Self {
        Self {
            path: path.into(),
            qos,
        }
    }
}

/// SUBACK packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

/// Subscribe return code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Failure,
}

impl SubscribeReasonCode {
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x80 => Ok(SubscribeReasonCode::Failure),
            v => QoS::from_u8(v)
                .map(SubscribeReasonCode::Success)
                .ok_or_else(|| Error::Malformed(format!("invalid SUBACK return code {:#04x}", v))),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            SubscribeReasonCode::Success(qos) => qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        }
    }
}

/// UNSUBSCRIBE packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

// ============================================================================
// Packet parsing
// ============================================================================

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` if `buf` does not yet hold a complete packet, and the
/// packet together with the number of bytes it occupied otherwise.
pub fn decode(buf: &[u8], max_size: usize) -> Result<Option<(Packet, usize)>> {
    let Some(header) = read_fixed_header(buf)? else {
        return Ok(None);
    };

    let total_len = header.header_length + header.remaining_length;
    if total_len > max_size {
        return Err(Error::Malformed(format!(
            "packet of {} bytes exceeds limit of {}",
            total_len, max_size
        )));
    }

    if buf.len() < total_len {
        return Ok(None);
    }

    let mut body = Reader::new(&buf[header.header_length..total_len]);

    let packet = match header.packet_type {
        PacketType::Connect => Packet::Connect(Connect::read(&mut body)?),
        PacketType::ConnAck => Packet::ConnAck(ConnAck::read(&mut body)?),
        PacketType::Publish => Packet::Publish(Publish::read(header.flags, &mut body)?),
        PacketType::PubAck => Packet::PubAck(read_pkid(&mut body)?),
        PacketType::PubRec => Packet::PubRec(read_pkid(&mut body)?),
        PacketType::PubRel => Packet::PubRel(read_pkid(&mut body)?),
        PacketType::PubComp => Packet::PubComp(read_pkid(&mut body)?),
        PacketType::Subscribe => Packet::Subscribe(Subscribe::read(&mut body)?),
        PacketType::SubAck => Packet::SubAck(SubAck::read(&mut body)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(Unsubscribe::read(&mut body)?),
        PacketType::UnsubAck => Packet::UnsubAck(read_pkid(&mut body)?),
        PacketType::PingReq => Packet::PingReq,
        PacketType::PingResp => Packet::PingResp,
        PacketType::Disconnect => Packet::Disconnect,
    };
    body.finish()?;

    Ok(Some((packet, total_len)))
}

fn read_pkid(body: &mut Reader<'_>) -> Result<u16> {
    let pkid = body.u16()?;
    if pkid == 0 {
        return Err(Error::Malformed("packet identifier 0".to_string()));
    }
    Ok(pkid)
}

impl Packet {
    /// Append the encoded packet to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.reserve(self.size());
        match self {
            Packet::Connect(p) => p.write(buf),
            Packet::ConnAck(p) => p.write(buf),
            Packet::Publish(p) => p.write(buf),
            Packet::PubAck(pkid) => write_pkid_packet(buf, PacketType::PubAck, *pkid),
            Packet::PubRec(pkid) => write_pkid_packet(buf, PacketType::PubRec, *pkid),
            Packet::PubRel(pkid) => write_pkid_packet(buf, PacketType::PubRel, *pkid),
            Packet::PubComp(pkid) => write_pkid_packet(buf, PacketType::PubComp, *pkid),
            Packet::Subscribe(p) => p.write(buf),
            Packet::SubAck(p) => p.write(buf),
            Packet::Unsubscribe(p) => p.write(buf),
            Packet::UnsubAck(pkid) => write_pkid_packet(buf, PacketType::UnsubAck, *pkid),
            Packet::PingReq => write_fixed_header(buf, PacketType::PingReq, 0, 0).map(|_| ()),
            Packet::PingResp => write_fixed_header(buf, PacketType::PingResp, 0, 0).map(|_| ()),
            Packet::Disconnect => write_fixed_header(buf, PacketType::Disconnect, 0, 0).map(|_| ()),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        let remaining = match self {
            Packet::Connect(p) => p.remaining_length(),
            Packet::ConnAck(_) => 2,
            Packet::Publish(p) => p.remaining_length(),
            Packet::PubAck(_)
            | Packet::PubRec(_)
            | Packet::PubRel(_)
            | Packet::PubComp(_)
            | Packet::UnsubAck(_) => 2,
            Packet::Subscribe(p) => p.remaining_length(),
            Packet::SubAck(p) => 2 + p.return_codes.len(),
            Packet::Unsubscribe(p) => p.remaining_length(),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => 0,
        };
        1 + variable_int_len(remaining) + remaining
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck(_) => "PUBACK",
            Packet::PubRec(_) => "PUBREC",
            Packet::PubRel(_) => "PUBREL",
            Packet::PubComp(_) => "PUBCOMP",
            Packet::Subscribe(_) => "SUBSCRIBE",
            Packet::SubAck(_) => "SUBACK",
            Packet::Unsubscribe(_) => "UNSUBSCRIBE",
            Packet::UnsubAck(_) => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

fn write_pkid_packet(buf: &mut BytesMut, packet_type: PacketType, pkid: u16) -> Result<()> {
    let flags = packet_type.required_flags().unwrap_or(0);
    write_fixed_header(buf, packet_type, flags, 2)?;
    buf.put_u16(pkid);
    Ok(())
}

// ============================================================================
// Individual packet implementations
// ============================================================================

impl Connect {
    fn read(body: &mut Reader<'_>) -> Result<Self> {
        let name = body.binary()?;
        if name != PROTOCOL_NAME {
            return Err(Error::Malformed("unknown protocol name".to_string()));
        }

        let level = body.u8()?;
        if level != PROTOCOL_LEVEL {
            return Err(Error::Malformed(format!("unsupported protocol level {}", level)));
        }

        let flags = body.u8()?;
        if flags & 0x01 != 0 {
            return Err(Error::Malformed("reserved connect flag set".to_string()));
        }
        let clean_session = flags & 0x02 != 0;
        let will_flag = flags & 0x04 != 0;
        let will_qos = (flags >> 3) & 0x03;
        let will_retain = flags & 0x20 != 0;
        let password_flag = flags & 0x40 != 0;
        let username_flag = flags & 0x80 != 0;

        if !will_flag && (will_qos != 0 || will_retain) {
            return Err(Error::Malformed("will qos/retain without will flag".to_string()));
        }
        if password_flag && !username_flag {
            return Err(Error::Malformed("password without username".to_string()));
        }

        let keep_alive = body.u16()?;
        let client_id = body.string()?;

        let will = if will_flag {
            let topic = body.string()?;
            let payload = body.binary()?.to_vec();
            let qos = QoS::from_u8(will_qos)
                .ok_or_else(|| Error::Malformed(format!("invalid will qos {}", will_qos)))?;
            Some(LastWill {
                topic,
                payload,
                qos,
                retain: will_retain,
            })
        } else {
            None
        };

        let username = if username_flag { Some(body.string()?) } else { None };
        let password = if password_flag { Some(body.binary()?.to_vec()) } else { None };

        Ok(Connect {
            client_id,
            keep_alive,
            clean_session,
            username,
            password,
            will,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_fixed_header(buf, PacketType::Connect, 0, self.remaining_length())?;

        write_binary(buf, PROTOCOL_NAME)?;
        buf.put_u8(PROTOCOL_LEVEL);

        let mut flags = 0u8;
        if self.clean_session {
            flags |= 0x02;
        }
        if let Some(ref will) = self.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if self.password.is_some() {
            flags |= 0x40;
        }
        if self.username.is_some() {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        buf.put_u16(self.keep_alive);

        write_string(buf, &self.client_id)?;

        if let Some(ref will) = self.will {
            write_string(buf, &will.topic)?;
            write_binary(buf, &will.payload)?;
        }
        if let Some(ref username) = self.username {
            write_string(buf, username)?;
        }
        if let Some(ref password) = self.password {
            write_binary(buf, password)?;
        }

        Ok(())
    }

    fn remaining_length(&self) -> usize {
        // protocol name + level + flags + keep alive
        let mut len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2;
        len += 2 + self.client_id.len();

        if let Some(ref will) = self.will {
            len += 2 + will.topic.len();
            len += 2 + will.payload.len();
        }
        if let Some(ref username) = self.username {
            len += 2 + username.len();
        }
        if let Some(ref password) = self.password {
            len += 2 + password.len();
        }

        len
    }
}

impl ConnAck {
    fn read(body: &mut Reader<'_>) -> Result<Self> {
        let ack_flags = body.u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(Error::Malformed("reserved CONNACK flags set".to_string()));
        }
        let code = body.u8()?;
        let code = ConnectReturnCode::from_u8(code)
            .ok_or_else(|| Error::Malformed(format!("invalid CONNACK return code {}", code)))?;

        Ok(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            code,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_fixed_header(buf, PacketType::ConnAck, 0, 2)?;
        buf.put_u8(if self.session_present { 0x01 } else { 0x00 });
        buf.put_u8(self.code as u8);
        Ok(())
    }
}

impl Publish {
    /// Create a PUBLISH packet. `pkid` is ignored for QoS 0.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool, pkid: u16) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
            dup: false,
            pkid: if qos == QoS::AtMostOnce { 0 } else { pkid },
        }
    }

    fn read(flags: u8, body: &mut Reader<'_>) -> Result<Self> {
        let dup = flags & 0x08 != 0;
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits)
            .ok_or_else(|| Error::Malformed(format!("invalid publish qos {}", qos_bits)))?;
        let retain = flags & 0x01 != 0;

        if qos == QoS::AtMostOnce && dup {
            return Err(Error::Malformed("DUP set on QoS 0 publish".to_string()));
        }

        let topic = body.string()?;
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(Error::Malformed(format!("invalid publish topic {:?}", topic)));
        }

        let pkid = if qos != QoS::AtMostOnce { read_pkid(body)? } else { 0 };
        let payload = Bytes::copy_from_slice(body.rest());

        Ok(Publish {
            topic,
            payload,
            qos,
            retain,
            dup,
            pkid,
        })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        let mut flags = (self.qos as u8) << 1;
        if self.dup {
            flags |= 0x08;
        }
        if self.retain {
            flags |= 0x01;
        }

        write_fixed_header(buf, PacketType::Publish, flags, self.remaining_length())?;
        write_string(buf, &self.topic)?;
        if self.qos != QoS::AtMostOnce {
            buf.put_u16(self.pkid);
        }
        buf.put_slice(&self.payload);

        Ok(())
    }

    fn remaining_length(&self) -> usize {
        let mut len = 2 + self.topic.len() + self.payload.len();
        if self.qos != QoS::AtMostOnce {
            len += 2;
        }
        len
    }
}

impl Subscribe {
    fn read(body: &mut Reader<'_>) -> Result<Self> {
        let pkid = read_pkid(body)?;

        let mut filters = Vec::new();
        while !body.is_empty() {
            let path = body.string()?;
            let options = body.u8()?;
            if options & 0xFC != 0 {
                return Err(Error::Malformed("reserved subscription option bits set".to_string()));
            }
            let qos = QoS::from_u8(options)
                .ok_or_else(|| Error::Malformed(format!("invalid subscription qos {}", options)))?;
            filters.push(SubscribeFilter { path, qos });
        }

        if filters.is_empty() {
            return Err(Error::Malformed("SUBSCRIBE without filters".to_string()));
        }

        Ok(Subscribe { pkid, filters })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_fixed_header(buf, PacketType::Subscribe, 0x02, self.remaining_length())?;
        buf.put_u16(self.pkid);
        for filter in &self.filters {
            write_string(buf, &filter.path)?;
            buf.put_u8(filter.qos as u8);
        }
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        2 + self
            .filters
            .iter()
            .map(|f| 2 + f.path.len() + 1)
            .sum::<usize>()
    }
}

impl SubAck {
    fn read(body: &mut Reader<'_>) -> Result<Self> {
        let pkid = read_pkid(body)?;
        let return_codes = body
            .rest()
            .iter()
            .map(|&b| SubscribeReasonCode::from_u8(b))
            .collect::<Result<Vec<_>>>()?;

        if return_codes.is_empty() {
            return Err(Error::Malformed("SUBACK without return codes".to_string()));
        }

        Ok(SubAck { pkid, return_codes })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_fixed_header(buf, PacketType::SubAck, 0, 2 + self.return_codes.len())?;
        buf.put_u16(self.pkid);
        for code in &self.return_codes {
            buf.put_u8(code.to_u8());
        }
        Ok(())
    }
}

impl Unsubscribe {
    fn read(body: &mut Reader<'_>) -> Result<Self> {
        let pkid = read_pkid(body)?;

        let mut topics = Vec::new();
        while !body.is_empty() {
            topics.push(body.string()?);
        }

        if topics.is_empty() {
            return Err(Error::Malformed("UNSUBSCRIBE without filters".to_string()));
        }

        Ok(Unsubscribe { pkid, topics })
    }

    fn write(&self, buf: &mut BytesMut) -> Result<()> {
        write_fixed_header(buf, PacketType::Unsubscribe, 0x02, self.remaining_length())?;
        buf.put_u16(self.pkid);
        for topic in &self.topics {
            write_string(buf, topic)?;
        }
        Ok(())
    }

    fn remaining_length(&self) -> usize {
        2 + self.topics.iter().map(|t| 2 + t.len()).sum::<usize>()
    }
}
