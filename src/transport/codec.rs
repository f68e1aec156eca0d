//! MQTT 3.1.1 packet codec
//!
//! Frames the native protocol for both listeners: the TCP listener drives it
//! through `tokio_util::codec::Framed`, the WebSocket listener feeds it the
//! contents of binary frames. Only the packets needed for QoS 0 and QoS 1 are
//! understood; the QoS 2 handshake packets (PUBREC, PUBREL, PUBCOMP) are
//! refused with [`CodecError::Unsupported`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::broker::message::QoS;
use crate::utils::error::CodecError;

/// Largest value the variable-length "remaining length" field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Default upper bound for a whole packet, header included.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const PUBREC: u8 = 5;
const PUBREL: u8 = 6;
const PUBCOMP: u8 = 7;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(u16),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// A clean-session MQTT 3.1.1 CONNECT without will or credentials.
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            protocol_name: "MQTT".to_string(),
            protocol_level: 4,
            clean_session: true,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    /// MQTT 3.1.1 ("MQTT", level 4) and MQTT 3.1 ("MQIsdp", level 3).
    pub fn is_supported_protocol(&self) -> bool {
        matches!(
            (self.protocol_name.as_str(), self.protocol_level),
            ("MQTT", 4) | ("MQIsdp", 3)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocolVersion,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            _ => return Err(CodecError::Malformed("unknown connect return code")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }

    pub fn with_qos(mut self, qos: QoS, packet_id: Option<u16>) -> Self {
        self.qos = qos;
        self.packet_id = packet_id;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub filter: String,
    pub requested_qos: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    fn as_u8(self) -> u8 {
        match self {
            Self::Success(qos) => qos.as_u8(),
            Self::Failure => 0x80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub packet_id: u16,
    pub return_codes: Vec<SubscribeReturnCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

/// `Decoder`/`Encoder` pair for MQTT 3.1.1 frames.
#[derive(Debug, Clone, Copy)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl MqttCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_REMAINING_LENGTH + 5),
        }
    }
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        let Some((remaining, header_len)) = read_remaining_length(src)? else {
            return Ok(None);
        };

        let size = header_len + remaining;
        if size > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }

        let first = src[0];
        let mut body = src.split_to(size).freeze();
        body.advance(header_len);
        parse_packet(first, body).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        let first = write_body(&packet, &mut body)?;

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(CodecError::MalformedLength);
        }
        let size = 1 + remaining_length_len(body.len()) + body.len();
        if size > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size,
                max: self.max_packet_size,
            });
        }

        dst.reserve(size);
        dst.put_u8(first);
        write_remaining_length(dst, body.len());
        dst.extend_from_slice(&body);
        Ok(())
    }
}

/// Returns `(remaining_length, fixed_header_len)` once the whole fixed header
/// is buffered.
fn read_remaining_length(src: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (index, byte) in src.iter().skip(1).enumerate() {
        if index == 4 {
            return Err(CodecError::MalformedLength);
        }
        value += usize::from(byte & 0x7F) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 2)));
        }
        multiplier *= 128;
    }
    Ok(None)
}

fn remaining_length_len(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

fn write_remaining_length(dst: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        dst.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn parse_packet(first: u8, mut body: Bytes) -> Result<Packet, CodecError> {
    let packet_type = first >> 4;
    let flags = first & 0x0F;

    let packet = match packet_type {
        CONNECT => {
            expect_flags(packet_type, flags, 0)?;
            Packet::Connect(parse_connect(&mut body)?)
        }
        CONNACK => {
            expect_flags(packet_type, flags, 0)?;
            let acknowledge = read_u8(&mut body)?;
            let code = ConnectReturnCode::try_from(read_u8(&mut body)?)?;
            Packet::ConnAck(ConnAck {
                session_present: acknowledge & 0x01 != 0,
                code,
            })
        }
        PUBLISH => Packet::Publish(parse_publish(flags, &mut body)?),
        PUBACK => {
            expect_flags(packet_type, flags, 0)?;
            Packet::PubAck(read_u16(&mut body)?)
        }
        PUBREC | PUBREL | PUBCOMP => return Err(CodecError::Unsupported(packet_type)),
        SUBSCRIBE => {
            expect_flags(packet_type, flags, 0b0010)?;
            Packet::Subscribe(parse_subscribe(&mut body)?)
        }
        SUBACK => {
            expect_flags(packet_type, flags, 0)?;
            let packet_id = read_u16(&mut body)?;
            let return_codes = body
                .iter()
                .map(|code| match *code {
                    0x80 => Ok(SubscribeReturnCode::Failure),
                    other => QoS::try_from(other).map(SubscribeReturnCode::Success),
                })
                .collect::<Result<Vec<_>, _>>()?;
            body.clear();
            Packet::SubAck(SubAck {
                packet_id,
                return_codes,
            })
        }
        UNSUBSCRIBE => {
            expect_flags(packet_type, flags, 0b0010)?;
            let packet_id = read_u16(&mut body)?;
            let mut filters = Vec::new();
            while body.has_remaining() {
                filters.push(read_string(&mut body)?);
            }
            if filters.is_empty() {
                return Err(CodecError::Malformed("unsubscribe without filters"));
            }
            Packet::Unsubscribe(Unsubscribe { packet_id, filters })
        }
        UNSUBACK => {
            expect_flags(packet_type, flags, 0)?;
            Packet::UnsubAck(read_u16(&mut body)?)
        }
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => return Err(CodecError::InvalidPacketType(other)),
    };

    if body.has_remaining() {
        return Err(CodecError::Malformed("trailing bytes after packet"));
    }
    Ok(packet)
}

fn expect_flags(packet_type: u8, flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidFlags { packet_type, flags })
    }
}

fn parse_connect(body: &mut Bytes) -> Result<Connect, CodecError> {
    let protocol_name = read_string(body)?;
    let protocol_level = read_u8(body)?;
    let flags = read_u8(body)?;
    if flags & 0x01 != 0 {
        return Err(CodecError::Malformed("reserved connect flag is set"));
    }
    let keep_alive = read_u16(body)?;
    let client_id = read_string(body)?;

    let will = if flags & 0x04 != 0 {
        let topic = read_string(body)?;
        let message = read_bytes(body)?;
        Some(LastWill {
            topic,
            message,
            qos: QoS::granted((flags >> 3) & 0x03)
                .ok_or(CodecError::InvalidQoS((flags >> 3) & 0x03))?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 {
        Some(read_string(body)?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(read_bytes(body)?)
    } else {
        None
    };

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & 0x02 != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn parse_publish(flags: u8, body: &mut Bytes) -> Result<Publish, CodecError> {
    let qos = match (flags >> 1) & 0x03 {
        2 => return Err(CodecError::ExactlyOnceUnsupported),
        level => QoS::try_from(level)?,
    };
    let topic = read_string(body)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce => match read_u16(body)? {
            0 => return Err(CodecError::Malformed("packet id 0 is not allowed")),
            id => Some(id),
        },
    };

    Ok(Publish {
        dup: flags & 0x08 != 0,
        qos,
        retain: flags & 0x01 != 0,
        topic,
        packet_id,
        payload: body.split_to(body.len()),
    })
}

fn parse_subscribe(body: &mut Bytes) -> Result<Subscribe, CodecError> {
    let packet_id = read_u16(body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        let filter = read_string(body)?;
        let requested_qos = read_u8(body)?;
        if requested_qos > 2 {
            return Err(CodecError::InvalidQoS(requested_qos));
        }
        filters.push(SubscribeFilter {
            filter,
            requested_qos,
        });
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("subscribe without filters"));
    }
    Ok(Subscribe { packet_id, filters })
}

fn read_u8(body: &mut Bytes) -> Result<u8, CodecError> {
    if body.remaining() < 1 {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(body.get_u8())
}

fn read_u16(body: &mut Bytes) -> Result<u16, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(body.get_u16())
}

fn read_bytes(body: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = usize::from(read_u16(body)?);
    if body.remaining() < len {
        return Err(CodecError::Malformed("length prefix exceeds packet"));
    }
    Ok(body.split_to(len))
}

fn read_string(body: &mut Bytes) -> Result<String, CodecError> {
    let bytes = read_bytes(body)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn put_bytes(dst: &mut BytesMut, bytes: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CodecError::Malformed("field too long"))?;
    dst.put_u16(len);
    dst.extend_from_slice(bytes);
    Ok(())
}

/// Writes the variable header and payload; returns the fixed header byte.
fn write_body(packet: &Packet, body: &mut BytesMut) -> Result<u8, CodecError> {
    let first = match packet {
        Packet::Connect(connect) => {
            put_bytes(body, connect.protocol_name.as_bytes())?;
            body.put_u8(connect.protocol_level);

            let mut flags = 0u8;
            if connect.clean_session {
                flags |= 0x02;
            }
            if let Some(will) = &connect.will {
                flags |= 0x04 | (will.qos.as_u8() << 3);
                if will.retain {
                    flags |= 0x20;
                }
            }
            if connect.password.is_some() {
                flags |= 0x40;
            }
            if connect.username.is_some() {
                flags |= 0x80;
            }
            body.put_u8(flags);
            body.put_u16(connect.keep_alive);
            put_bytes(body, connect.client_id.as_bytes())?;
            if let Some(will) = &connect.will {
                put_bytes(body, will.topic.as_bytes())?;
                put_bytes(body, &will.message)?;
            }
            if let Some(username) = &connect.username {
                put_bytes(body, username.as_bytes())?;
            }
            if let Some(password) = &connect.password {
                put_bytes(body, password)?;
            }
            CONNECT << 4
        }
        Packet::ConnAck(ack) => {
            body.put_u8(u8::from(ack.session_present));
            body.put_u8(ack.code as u8);
            CONNACK << 4
        }
        Packet::Publish(publish) => {
            put_bytes(body, publish.topic.as_bytes())?;
            if publish.qos == QoS::AtLeastOnce {
                let packet_id = publish
                    .packet_id
                    .ok_or(CodecError::Malformed("qos 1 publish without packet id"))?;
                body.put_u16(packet_id);
            }
            body.extend_from_slice(&publish.payload);

            let mut first = PUBLISH << 4 | publish.qos.as_u8() << 1;
            if publish.dup {
                first |= 0x08;
            }
            if publish.retain {
                first |= 0x01;
            }
            first
        }
        Packet::PubAck(packet_id) => {
            body.put_u16(*packet_id);
            PUBACK << 4
        }
        Packet::Subscribe(subscribe) => {
            body.put_u16(subscribe.packet_id);
            for entry in &subscribe.filters {
                put_bytes(body, entry.filter.as_bytes())?;
                body.put_u8(entry.requested_qos);
            }
            SUBSCRIBE << 4 | 0b0010
        }
        Packet::SubAck(ack) => {
            body.put_u16(ack.packet_id);
            for code in &ack.return_codes {
                body.put_u8(code.as_u8());
            }
            SUBACK << 4
        }
        Packet::Unsubscribe(unsubscribe) => {
            body.put_u16(unsubscribe.packet_id);
            for filter in &unsubscribe.filters {
                put_bytes(body, filter.as_bytes())?;
            }
            UNSUBSCRIBE << 4 | 0b0010
        }
        Packet::UnsubAck(packet_id) => {
            body.put_u16(*packet_id);
            UNSUBACK << 4
        }
        Packet::PingReq => PINGREQ << 4,
        Packet::PingResp => PINGRESP << 4,
        Packet::Disconnect => DISCONNECT << 4,
    };
    Ok(first)
}
