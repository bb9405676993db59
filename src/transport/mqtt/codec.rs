//! MQTT 3.1.1 packet codec (the subset a device client needs).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::{error::Error, fmt};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const MAX_REMAINING_LENGTH: usize = 268_435_455;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Length prefix longer than four bytes or above the protocol maximum.
    BadRemainingLength,
    PayloadTooLarge(usize),
    UnsupportedPacket(u8),
    InvalidQos(u8),
    Malformed(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::BadRemainingLength => write!(f, "malformed remaining length"),
            CodecError::PayloadTooLarge(n) => write!(f, "packet of {n} bytes exceeds mqtt limit"),
            CodecError::UnsupportedPacket(t) => write!(f, "unsupported packet type {t}"),
            CodecError::InvalidQos(q) => write!(f, "invalid qos {q}"),
            CodecError::Malformed(what) => write!(f, "malformed packet: {what}"),
        }
    }
}

impl Error for CodecError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub client_id: String,
    pub keepalive: u16,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
    pub dup: bool,
    /// Zero for QoS 0.
    pub pkid: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck { session_present: bool, code: u8 },
    Publish(Publish),
    PubAck { pkid: u16 },
    Subscribe { pkid: u16, filters: Vec<(String, u8)> },
    SubAck { pkid: u16, codes: Vec<u8> },
    PingReq,
    PingResp,
    Disconnect,
}

/// CONNACK return code meaning.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "accepted",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown return code",
    }
}

fn check_qos(qos: u8) -> Result<u8, CodecError> {
    if qos > 2 { Err(CodecError::InvalidQos(qos)) } else { Ok(qos) }
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), CodecError> {
    let len = u16::try_from(s.len()).map_err(|_| CodecError::PayloadTooLarge(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn str_len(s: &str) -> usize {
    2 + s.len()
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) -> Result<(), CodecError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(CodecError::PayloadTooLarge(len));
    }
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// `(remaining length, bytes used by the prefix)`, or `None` if the prefix
/// itself is incomplete.
fn read_remaining_length(buf: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value = 0usize;
    let mut multiplier = 1usize;
    for (i, byte) in buf.iter().enumerate() {
        if i == 4 {
            return Err(CodecError::BadRemainingLength);
        }
        value += (*byte as usize & 0x7f) * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }
    if buf.len() >= 4 {
        return Err(CodecError::BadRemainingLength);
    }
    Ok(None)
}

fn take_u8(body: &mut Bytes) -> Result<u8, CodecError> {
    if body.remaining() < 1 {
        return Err(CodecError::Malformed("truncated byte"));
    }
    Ok(body.get_u8())
}

fn take_u16(body: &mut Bytes) -> Result<u16, CodecError> {
    if body.remaining() < 2 {
        return Err(CodecError::Malformed("truncated u16"));
    }
    Ok(body.get_u16())
}

fn take_str(body: &mut Bytes) -> Result<String, CodecError> {
    let len = take_u16(body)? as usize;
    if body.remaining() < len {
        return Err(CodecError::Malformed("truncated string"));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::Malformed("string is not utf-8"))
}

impl Packet {
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            Packet::Connect(c) => {
                let mut len = str_len(PROTOCOL_NAME) + 1 + 1 + 2 + str_len(&c.client_id);
                let mut flags = 0u8;
                if c.clean_session {
                    flags |= 0x02;
                }
                if let Some(user) = &c.username {
                    flags |= 0x80;
                    len += str_len(user);
                }
                if let Some(pass) = &c.password {
                    flags |= 0x40;
                    len += str_len(pass);
                }

                buf.put_u8(CONNECT << 4);
                put_remaining_length(buf, len)?;
                put_str(buf, PROTOCOL_NAME)?;
                buf.put_u8(PROTOCOL_LEVEL);
                buf.put_u8(flags);
                buf.put_u16(c.keepalive);
                put_str(buf, &c.client_id)?;
                if let Some(user) = &c.username {
                    put_str(buf, user)?;
                }
                if let Some(pass) = &c.password {
                    put_str(buf, pass)?;
                }
            }
            Packet::ConnAck { session_present, code } => {
                buf.put_u8(CONNACK << 4);
                buf.put_u8(2);
                buf.put_u8(u8::from(*session_present));
                buf.put_u8(*code);
            }
            Packet::Publish(p) => {
                let qos = check_qos(p.qos)?;
                let mut len = str_len(&p.topic) + p.payload.len();
                if qos > 0 {
                    len += 2;
                }
                let header = (PUBLISH << 4) | (u8::from(p.dup) << 3) | (qos << 1) | u8::from(p.retain);
                buf.put_u8(header);
                put_remaining_length(buf, len)?;
                put_str(buf, &p.topic)?;
                if qos > 0 {
                    buf.put_u16(p.pkid);
                }
                buf.put_slice(&p.payload);
            }
            Packet::PubAck { pkid } => {
                buf.put_u8(PUBACK << 4);
                buf.put_u8(2);
                buf.put_u16(*pkid);
            }
            Packet::Subscribe { pkid, filters } => {
                if filters.is_empty() {
                    return Err(CodecError::Malformed("subscribe without filters"));
                }
                let len = 2 + filters.iter().map(|(f, _)| str_len(f) + 1).sum::<usize>();
                buf.put_u8((SUBSCRIBE << 4) | 0x02);
                put_remaining_length(buf, len)?;
                buf.put_u16(*pkid);
                for (filter, qos) in filters {
                    put_str(buf, filter)?;
                    buf.put_u8(check_qos(*qos)?);
                }
            }
            Packet::SubAck { pkid, codes } => {
                buf.put_u8(SUBACK << 4);
                put_remaining_length(buf, 2 + codes.len())?;
                buf.put_u16(*pkid);
                buf.put_slice(codes);
            }
            Packet::PingReq => buf.put_slice(&[PINGREQ << 4, 0]),
            Packet::PingResp => buf.put_slice(&[PINGRESP << 4, 0]),
            Packet::Disconnect => buf.put_slice(&[DISCONNECT << 4, 0]),
        }
        Ok(())
    }

    /// Take one complete packet off the front of `buf`. Returns `Ok(None)`
    /// and leaves `buf` untouched while the packet is still incomplete.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let Some((remaining, prefix)) = read_remaining_length(&buf[1..])? else {
            return Ok(None);
        };
        let total = 1 + prefix + remaining;
        if buf.len() < total {
            return Ok(None);
        }

        let mut frame = buf.split_to(total).freeze();
        let header = frame.get_u8();
        frame.advance(prefix);
        let mut body = frame;

        let packet = match header >> 4 {
            CONNECT => {
                let name = take_str(&mut body)?;
                let level = take_u8(&mut body)?;
                if name != PROTOCOL_NAME || level != PROTOCOL_LEVEL {
                    return Err(CodecError::Malformed("unsupported protocol"));
                }
                let flags = take_u8(&mut body)?;
                let keepalive = take_u16(&mut body)?;
                let client_id = take_str(&mut body)?;
                let username = if flags & 0x80 != 0 { Some(take_str(&mut body)?) } else { None };
                let password = if flags & 0x40 != 0 { Some(take_str(&mut body)?) } else { None };
                Packet::Connect(Connect {
                    client_id,
                    keepalive,
                    clean_session: flags & 0x02 != 0,
                    username,
                    password,
                })
            }
            CONNACK => {
                let flags = take_u8(&mut body)?;
                let code = take_u8(&mut body)?;
                Packet::ConnAck {
                    session_present: flags & 0x01 != 0,
                    code,
                }
            }
            PUBLISH => {
                let qos = check_qos((header >> 1) & 0x03)?;
                let topic = take_str(&mut body)?;
                let pkid = if qos > 0 { take_u16(&mut body)? } else { 0 };
                Packet::Publish(Publish {
                    topic,
                    payload: body,
                    qos,
                    retain: header & 0x01 != 0,
                    dup: header & 0x08 != 0,
                    pkid,
                })
            }
            PUBACK => Packet::PubAck {
                pkid: take_u16(&mut body)?,
            },
            SUBSCRIBE => {
                let pkid = take_u16(&mut body)?;
                let mut filters = Vec::new();
                while body.has_remaining() {
                    let filter = take_str(&mut body)?;
                    let qos = check_qos(take_u8(&mut body)?)?;
                    filters.push((filter, qos));
                }
                Packet::Subscribe { pkid, filters }
            }
            SUBACK => {
                let pkid = take_u16(&mut body)?;
                Packet::SubAck {
                    pkid,
                    codes: body.to_vec(),
                }
            }
            PINGREQ => Packet::PingReq,
            PINGRESP => Packet::PingResp,
            DISCONNECT => Packet::Disconnect,
            other => return Err(CodecError::UnsupportedPacket(other)),
        };
        Ok(Some(packet))
    }
}
