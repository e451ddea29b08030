//! MQTT 3.1.1 control packets used by the client role
//!
//! Builders append complete frames (fixed header, remaining length, body) to a
//! caller-owned `BytesMut` so the sender can reuse one transmit buffer.
//! Parsers take the fixed header byte plus the body that the remaining length
//! announced and borrow from it; nothing is copied on the receive path.

use super::codec::{
    put_binary, put_string, put_varint, read_string, read_u16, ProtocolError, VarintDecoder,
};
use bytes::{BufMut, BytesMut};
use std::fmt;

pub const PROTOCOL_NAME: &str = "MQTT";
/// Protocol level byte for MQTT 3.1.1
pub const PROTOCOL_LEVEL: u8 = 0x04;

const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

const PUBLISH_FLAG_RETAIN: u8 = 0x01;
const PUBLISH_FLAG_DUP: u8 = 0x08;

/// Control packet types (upper nibble of the fixed header)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    PubAck = 4,
    Subscribe = 8,
    SubAck = 9,
    Unsubscribe = 10,
    UnsubAck = 11,
    PingReq = 12,
    PingResp = 13,
    Disconnect = 14,
}

impl PacketType {
    pub fn from_header(header: u8) -> Option<Self> {
        Some(match header >> 4 {
            1 => Self::Connect,
            2 => Self::ConnAck,
            3 => Self::Publish,
            4 => Self::PubAck,
            8 => Self::Subscribe,
            9 => Self::SubAck,
            10 => Self::Unsubscribe,
            11 => Self::UnsubAck,
            12 => Self::PingReq,
            13 => Self::PingResp,
            14 => Self::Disconnect,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::ConnAck => "CONNACK",
            Self::Publish => "PUBLISH",
            Self::PubAck => "PUBACK",
            Self::Subscribe => "SUBSCRIBE",
            Self::SubAck => "SUBACK",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::UnsubAck => "UNSUBACK",
            Self::PingReq => "PINGREQ",
            Self::PingResp => "PINGRESP",
            Self::Disconnect => "DISCONNECT",
        }
    }

    /// First byte of a frame of this type with no flags set
    pub fn header(self) -> u8 {
        (self as u8) << 4
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Quality of service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QoS {
    /// Fire and forget
    AtMostOnce = 0,
    /// Acknowledged with PUBACK, retransmitted with DUP until then
    AtLeastOnce = 1,
    /// Exactly once; the engine rejects it
    ExactlyOnce = 2,
}

impl QoS {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// Last will carried in CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub message: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Variable header and payload fields of CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub keepalive: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    /// Only sent together with a username
    pub password: Option<&'a [u8]>,
    pub last_will: Option<LastWill<'a>>,
}

fn put_fixed_header(out: &mut BytesMut, header: u8, body_len: usize) -> Result<(), ProtocolError> {
    let len = u32::try_from(body_len).map_err(|_| ProtocolError::VarintOverflow(u32::MAX))?;
    out.put_u8(header);
    put_varint(out, len)?;
    Ok(())
}

pub fn connect(out: &mut BytesMut, opts: &ConnectOptions<'_>) -> Result<(), ProtocolError> {
    let mut flags = 0u8;
    let mut body_len = 2 + PROTOCOL_NAME.len() + 1 + 1 + 2 + 2 + opts.client_id.len();

    if opts.clean_session {
        flags |= CONNECT_FLAG_CLEAN_SESSION;
    }
    if let Some(will) = &opts.last_will {
        flags |= CONNECT_FLAG_WILL | (will.qos.level() << 3);
        if will.retain {
            flags |= CONNECT_FLAG_WILL_RETAIN;
        }
        body_len += 2 + will.topic.len() + 2 + will.message.len();
    }
    let password = opts.username.and(opts.password);
    if let Some(username) = opts.username {
        flags |= CONNECT_FLAG_USERNAME;
        body_len += 2 + username.len();
    }
    if let Some(password) = password {
        flags |= CONNECT_FLAG_PASSWORD;
        body_len += 2 + password.len();
    }

    put_fixed_header(out, PacketType::Connect.header(), body_len)?;
    put_string(out, PROTOCOL_NAME)?;
    out.put_u8(PROTOCOL_LEVEL);
    out.put_u8(flags);
    out.put_u16(opts.keepalive);
    put_string(out, opts.client_id)?;
    if let Some(will) = &opts.last_will {
        put_string(out, will.topic)?;
        put_binary(out, will.message)?;
    }
    if let Some(username) = opts.username {
        put_string(out, username)?;
    }
    if let Some(password) = password {
        put_binary(out, password)?;
    }
    Ok(())
}

/// A PUBLISH frame, outbound or inbound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    /// Present exactly when `qos` is above `AtMostOnce`
    pub pid: Option<u16>,
}

impl<'a> Publish<'a> {
    pub fn header(&self) -> u8 {
        let mut header = PacketType::Publish.header() | (self.qos.level() << 1);
        if self.retain {
            header |= PUBLISH_FLAG_RETAIN;
        }
        if self.dup {
            header |= PUBLISH_FLAG_DUP;
        }
        header
    }

    pub fn encode(&self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let pid = match (self.qos, self.pid) {
            (QoS::AtMostOnce, _) => None,
            (_, Some(pid)) => Some(pid),
            (_, None) => return Err(ProtocolError::MissingPacketId),
        };
        let body_len =
            2 + self.topic.len() + if pid.is_some() { 2 } else { 0 } + self.payload.len();
        put_fixed_header(out, self.header(), body_len)?;
        put_string(out, self.topic)?;
        if let Some(pid) = pid {
            out.put_u16(pid);
        }
        out.put_slice(self.payload);
        Ok(())
    }

    pub fn parse(header: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let qos = match (header >> 1) & 0x03 {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => return Err(ProtocolError::InboundQoS2),
            _ => return Err(ProtocolError::MalformedQoS(header)),
        };
        let (topic, mut offset) = read_string(body)?;
        let pid = if qos == QoS::AtMostOnce {
            None
        } else {
            let pid = read_u16(&body[offset..])?;
            offset += 2;
            Some(pid)
        };
        Ok(Self {
            topic,
            payload: &body[offset..],
            qos,
            retain: header & PUBLISH_FLAG_RETAIN != 0,
            dup: header & PUBLISH_FLAG_DUP != 0,
            pid,
        })
    }
}

pub fn subscribe(
    out: &mut BytesMut,
    pid: u16,
    filters: &[(&str, QoS)],
) -> Result<(), ProtocolError> {
    let body_len = 2 + filters
        .iter()
        .map(|(filter, _)| 2 + filter.len() + 1)
        .sum::<usize>();
    // SUBSCRIBE carries the reserved flag bits 0b0010
    put_fixed_header(out, PacketType::Subscribe.header() | 0x02, body_len)?;
    out.put_u16(pid);
    for (filter, qos) in filters {
        put_string(out, filter)?;
        out.put_u8(qos.level());
    }
    Ok(())
}

pub fn unsubscribe(out: &mut BytesMut, pid: u16, filters: &[&str]) -> Result<(), ProtocolError> {
    let body_len = 2 + filters.iter().map(|filter| 2 + filter.len()).sum::<usize>();
    put_fixed_header(out, PacketType::Unsubscribe.header() | 0x02, body_len)?;
    out.put_u16(pid);
    for filter in filters {
        put_string(out, filter)?;
    }
    Ok(())
}

pub fn puback(out: &mut BytesMut, pid: u16) {
    out.put_u8(PacketType::PubAck.header());
    out.put_u8(0x02);
    out.put_u16(pid);
}

pub fn pingreq(out: &mut BytesMut) {
    out.put_slice(&[PacketType::PingReq.header(), 0x00]);
}

pub fn disconnect(out: &mut BytesMut) {
    out.put_slice(&[PacketType::Disconnect.header(), 0x00]);
}

fn expect_len(packet: PacketType, body: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if body.len() != expected {
        return Err(ProtocolError::LengthMismatch {
            packet: packet.name(),
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}

/// CONNACK variable header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    /// Acknowledge flags; bit 0 is session-present
    pub flags: u8,
    pub return_code: u8,
}

impl ConnAck {
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        expect_len(PacketType::ConnAck, body, 2)?;
        Ok(Self {
            flags: body[0],
            return_code: body[1],
        })
    }
}

/// PUBACK, tolerating the MQTT 5 reason code and property extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pid: u16,
    pub reason_code: Option<u8>,
}

impl PubAck {
    pub fn parse(body: &[u8]) -> Result<Self, ProtocolError> {
        let pid = read_u16(body)?;
        let reason_code = body.get(2).copied();
        if body.len() > 3 {
            let mut decoder = VarintDecoder::new();
            let mut props = None;
            for &byte in &body[3..] {
                if let Some(done) = decoder.push(byte)? {
                    props = Some(done);
                    break;
                }
            }
            let (props_len, consumed) = props.ok_or(ProtocolError::Truncated {
                needed: body.len() + 1,
                available: body.len(),
            })?;
            expect_len(PacketType::PubAck, body, 3 + consumed + props_len as usize)?;
        }
        Ok(Self { pid, reason_code })
    }

    pub fn is_failure(&self) -> bool {
        self.reason_code.is_some_and(|code| code >= 0x80)
    }
}

/// SUBACK: one granted-QoS / failure byte per requested filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubAck<'a> {
    pub pid: u16,
    pub return_codes: &'a [u8],
}

impl<'a> SubAck<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self, ProtocolError> {
        let pid = read_u16(body)?;
        if body.len() < 3 {
            return Err(ProtocolError::Truncated {
                needed: 3,
                available: body.len(),
            });
        }
        Ok(Self {
            pid,
            return_codes: &body[2..],
        })
    }

    /// Require exactly one return code per filter sent
    pub fn expect_codes(self, filters: usize) -> Result<Self, ProtocolError> {
        if self.return_codes.len() != filters {
            return Err(ProtocolError::LengthMismatch {
                packet: "SUBACK",
                expected: 2 + filters,
                actual: 2 + self.return_codes.len(),
            });
        }
        Ok(self)
    }
}

/// UNSUBACK; MQTT 3.1.1 brokers send no reason codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck<'a> {
    pub pid: u16,
    pub reason_codes: &'a [u8],
}

impl<'a> UnsubAck<'a> {
    pub fn parse(body: &'a [u8]) -> Result<Self, ProtocolError> {
        let pid = read_u16(body)?;
        Ok(Self {
            pid,
            reason_codes: &body[2..],
        })
    }

    /// Require no reason codes, or one per filter sent
    pub fn expect_codes(self, filters: usize) -> Result<Self, ProtocolError> {
        let count = self.reason_codes.len();
        if count != 0 && count != filters {
            return Err(ProtocolError::LengthMismatch {
                packet: "UNSUBACK",
                expected: 2 + filters,
                actual: 2 + count,
            });
        }
        Ok(self)
    }
}

/// A decoded broker-to-client packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incoming<'a> {
    ConnAck(ConnAck),
    Publish(Publish<'a>),
    PubAck(PubAck),
    SubAck(SubAck<'a>),
    UnsubAck(UnsubAck<'a>),
    PingResp,
}

impl<'a> Incoming<'a> {
    pub fn parse(header: u8, body: &'a [u8]) -> Result<Self, ProtocolError> {
        let packet_type =
            PacketType::from_header(header).ok_or(ProtocolError::UnexpectedPacket(header))?;
        if packet_type != PacketType::Publish && header & 0x0F != 0 {
            return Err(ProtocolError::UnexpectedPacket(header));
        }
        match packet_type {
            PacketType::ConnAck => ConnAck::parse(body).map(Self::ConnAck),
            PacketType::Publish => Publish::parse(header, body).map(Self::Publish),
            PacketType::PubAck => PubAck::parse(body).map(Self::PubAck),
            PacketType::SubAck => SubAck::parse(body).map(Self::SubAck),
            PacketType::UnsubAck => UnsubAck::parse(body).map(Self::UnsubAck),
            PacketType::PingResp => {
                expect_len(PacketType::PingResp, body, 0)?;
                Ok(Self::PingResp)
            }
            _ => Err(ProtocolError::UnexpectedPacket(header)),
        }
    }
}
