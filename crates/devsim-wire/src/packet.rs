//! MQTT control packets
//!
//! Packet = Fixed Header + Variable Header + Payload
//!
//! Decoding is streaming: [`Packet::decode`] returns `Ok(None)` until a
//! whole packet is buffered, so a reader can keep appending bytes and retry.

use bytes::{BufMut, Bytes, BytesMut};
use devsim_core::{DeviceError, DeviceResult};

use crate::{
    validate_filter, validate_topic, ConnectFlags, FixedHeader, PacketType, PublishFlags, QoS,
};

/// Protocol name carried in CONNECT
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1
pub const PROTOCOL_LEVEL: u8 = 4;

/// SUBACK return code for a rejected subscription
pub const SUBACK_FAILURE: u8 = 0x80;

/// CONNACK return codes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn from_byte(b: u8) -> DeviceResult<Self> {
        match b {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadCredentials),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(DeviceError::InvalidWireFormat(format!(
                "Unknown CONNACK return code {b}"
            ))),
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    #[inline]
    pub fn is_accepted(self) -> bool {
        self == ConnectReturnCode::Accepted
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    /// Keepalive in seconds; 0 disables it
    pub keep_alive: u16,
    pub clean_session: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

impl ConnAck {
    pub fn accepted() -> Self {
        ConnAck {
            session_present: false,
            code: ConnectReturnCode::Accepted,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present iff `qos` is above `AtMostOnce`
    pub packet_id: Option<u16>,
}

impl Publish {
    /// Fire-and-forget publish, the only kind a device sends
    pub fn at_most_once(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Publish {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    /// Granted QoS per filter, or [`SUBACK_FAILURE`]
    pub return_codes: Vec<u8>,
}

/// A complete MQTT control packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    Subscribe(Subscribe),
    SubAck(SubAck),
    PingReq,
    PingResp,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::PingReq => PacketType::PingReq,
            Packet::PingResp => PacketType::PingResp,
        }
    }

    /// Decode one packet from the front of `buf`.
    ///
    /// Returns the packet and the number of bytes consumed, or `Ok(None)` if
    /// `buf` does not yet hold a complete packet.
    pub fn decode(buf: &[u8]) -> DeviceResult<Option<(Packet, usize)>> {
        let Some((header, header_len)) = FixedHeader::parse(buf)? else {
            return Ok(None);
        };

        let total = header_len + header.remaining_length;
        if buf.len() < total {
            return Ok(None);
        }

        let mut body = Reader::new(&buf[header_len..total]);
        let packet = match header.packet_type {
            PacketType::Connect => Packet::Connect(decode_connect(&mut body)?),
            PacketType::ConnAck => {
                let ack_flags = body.read_u8()?;
                let code = ConnectReturnCode::from_byte(body.read_u8()?)?;
                Packet::ConnAck(ConnAck {
                    session_present: ack_flags & 0x01 != 0,
                    code,
                })
            }
            PacketType::Publish => Packet::Publish(decode_publish(header.flags, &mut body)?),
            PacketType::Subscribe => {
                let packet_id = body.read_u16()?;
                let mut filters = Vec::new();
                while !body.is_empty() {
                    let filter = body.read_string()?;
                    let qos = QoS::from_byte(body.read_u8()?)?;
                    filters.push((filter, qos));
                }
                if filters.is_empty() {
                    return Err(DeviceError::InvalidWireFormat(
                        "SUBSCRIBE without filters".into(),
                    ));
                }
                Packet::Subscribe(Subscribe { packet_id, filters })
            }
            PacketType::SubAck => {
                let packet_id = body.read_u16()?;
                let return_codes = body.rest().to_vec();
                Packet::SubAck(SubAck {
                    packet_id,
                    return_codes,
                })
            }
            PacketType::PingReq => Packet::PingReq,
            PacketType::PingResp => Packet::PingResp,
        };

        if !body.is_empty() {
            return Err(DeviceError::InvalidWireFormat(format!(
                "{:?} has {} trailing bytes",
                header.packet_type,
                body.remaining()
            )));
        }

        Ok(Some((packet, total)))
    }

    /// Append the encoded packet to `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> DeviceResult<()> {
        let mut body = BytesMut::new();
        let mut flags = 0u8;

        match self {
            Packet::Connect(connect) => {
                put_string(&mut body, PROTOCOL_NAME)?;
                body.put_u8(PROTOCOL_LEVEL);
                let mut connect_flags = ConnectFlags::NONE;
                connect_flags.set_clean_session(connect.clean_session);
                body.put_u8(connect_flags.into());
                body.put_u16(connect.keep_alive);
                put_string(&mut body, &connect.client_id)?;
            }
            Packet::ConnAck(ack) => {
                body.put_u8(ack.session_present as u8);
                body.put_u8(ack.code.to_byte());
            }
            Packet::Publish(publish) => {
                validate_topic(&publish.topic)?;
                flags = PublishFlags {
                    dup: publish.dup,
                    qos: publish.qos,
                    retain: publish.retain,
                }
                .to_nibble();
                put_string(&mut body, &publish.topic)?;
                match (publish.qos, publish.packet_id) {
                    (QoS::AtMostOnce, None) => {}
                    (QoS::AtMostOnce, Some(_)) => {
                        return Err(DeviceError::InvalidWireFormat(
                            "QoS 0 PUBLISH must not carry a packet id".into(),
                        ))
                    }
                    (_, Some(id)) => body.put_u16(id),
                    (_, None) => {
                        return Err(DeviceError::InvalidWireFormat(
                            "QoS > 0 PUBLISH requires a packet id".into(),
                        ))
                    }
                }
                body.put_slice(&publish.payload);
            }
            Packet::Subscribe(subscribe) => {
                flags = 0b0010;
                body.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    validate_filter(filter)?;
                    put_string(&mut body, filter)?;
                    body.put_u8(qos.to_byte());
                }
            }
            Packet::SubAck(ack) => {
                body.put_u16(ack.packet_id);
                body.put_slice(&ack.return_codes);
            }
            Packet::PingReq | Packet::PingResp => {}
        }

        FixedHeader::new(self.packet_type(), flags, body.len()).serialize(buf)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Encode into a fresh buffer
    pub fn to_bytes(&self) -> DeviceResult<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn decode_connect(body: &mut Reader<'_>) -> DeviceResult<Connect> {
    let protocol = body.read_string()?;
    if protocol != PROTOCOL_NAME {
        return Err(DeviceError::InvalidWireFormat(format!(
            "Unknown protocol name {protocol:?}"
        )));
    }
    let level = body.read_u8()?;
    if level != PROTOCOL_LEVEL {
        return Err(DeviceError::InvalidWireFormat(format!(
            "Unsupported protocol level {level}"
        )));
    }

    let flags = ConnectFlags::new(body.read_u8()?);
    if flags.0 & ConnectFlags::RESERVED != 0 {
        return Err(DeviceError::InvalidWireFormat(
            "CONNECT reserved flag set".into(),
        ));
    }
    let keep_alive = body.read_u16()?;
    let client_id = body.read_string()?;

    // Will, username and password are accepted but not retained.
    if flags.has_will() {
        body.read_string()?;
        body.read_binary()?;
    }
    if flags.has_username() {
        body.read_string()?;
    }
    if flags.has_password() {
        body.read_binary()?;
    }

    Ok(Connect {
        client_id,
        keep_alive,
        clean_session: flags.is_clean_session(),
    })
}

fn decode_publish(flags: u8, body: &mut Reader<'_>) -> DeviceResult<Publish> {
    let flags = PublishFlags::from_nibble(flags)?;
    let topic = body.read_string()?;
    validate_topic(&topic)?;
    let packet_id = if flags.qos > QoS::AtMostOnce {
        Some(body.read_u16()?)
    } else {
        None
    };
    let payload = Bytes::copy_from_slice(body.rest());

    Ok(Publish {
        topic,
        payload,
        qos: flags.qos,
        retain: flags.retain,
        dup: flags.dup,
        packet_id,
    })
}

fn put_string(buf: &mut BytesMut, s: &str) -> DeviceResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        DeviceError::InvalidWireFormat(format!("String too long: {} bytes", s.len()))
    })?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked cursor over a packet body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> DeviceResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(DeviceError::BufferTooShort {
                expected: n,
                actual: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> DeviceResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> DeviceResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_binary(&mut self) -> DeviceResult<&'a [u8]> {
        let len = self.read_u16()? as usize;
        self.take(len)
    }

    fn read_string(&mut self) -> DeviceResult<String> {
        let bytes = self.read_binary()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DeviceError::InvalidWireFormat("String is not UTF-8".into()))
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}
