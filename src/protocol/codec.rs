//! Wire primitives for MQTT 3.1.1 frames
//!
//! Variable byte integers (the remaining-length field), two-byte big-endian
//! integers and length-prefixed UTF-8 strings. Everything here is a pure
//! function over byte slices or a `BytesMut` sink.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Largest value a four byte variable length integer can carry (2^28 - 1).
pub const MAX_VARINT: u32 = 268_435_455;

/// Longest string or binary field a two byte length prefix can describe.
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Stream-level protocol violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed remaining length: continuation bit set on byte 4")]
    MalformedVarint,
    #[error("value {0} does not fit in a variable byte integer")]
    VarintOverflow(u32),
    #[error("field of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),
    #[error("truncated field: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("{packet} remaining length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        packet: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("unexpected packet header {0:#04x}")]
    UnexpectedPacket(u8),
    #[error("packet of {size} bytes exceeds the {max} byte receive limit")]
    PacketTooLarge { size: usize, max: usize },
    #[error("packet id {pid} in {packet} is not in flight")]
    UnknownPacketId { pid: u16, packet: &'static str },
    #[error("no free packet identifier")]
    PacketIdsExhausted,
    #[error("malformed QoS bits in header {0:#04x}")]
    MalformedQoS(u8),
    #[error("QoS 1 PUBLISH without a packet id")]
    MissingPacketId,
    #[error("inbound QoS 2 delivery is not supported")]
    InboundQoS2,
}

/// Incremental decoder for a variable byte integer.
///
/// Feed one byte at a time; the value is returned once a byte with a clear
/// continuation bit arrives. A fourth byte that still has the continuation
/// bit set is rejected.
#[derive(Debug, Default, Clone, Copy)]
pub struct VarintDecoder {
    value: u32,
    consumed: usize,
}

impl VarintDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Result<Option<(u32, usize)>, ProtocolError> {
        if self.consumed == 4 {
            return Err(ProtocolError::MalformedVarint);
        }
        self.value |= u32::from(byte & 0x7F) << (7 * self.consumed);
        self.consumed += 1;
        if byte & 0x80 == 0 {
            return Ok(Some((self.value, self.consumed)));
        }
        if self.consumed == 4 {
            return Err(ProtocolError::MalformedVarint);
        }
        Ok(None)
    }
}

/// Number of bytes `value` occupies once encoded.
pub fn varint_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

/// Append `value` as a variable byte integer, least significant group first.
pub fn put_varint(out: &mut BytesMut, value: u32) -> Result<usize, ProtocolError> {
    if value > MAX_VARINT {
        return Err(ProtocolError::VarintOverflow(value));
    }
    let mut rest = value;
    let mut written = 0;
    loop {
        let mut byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        written += 1;
        if rest == 0 {
            return Ok(written);
        }
    }
}

/// Encode `value` into a fresh buffer.
pub fn encode_varint(value: u32) -> Result<Vec<u8>, ProtocolError> {
    let mut out = BytesMut::with_capacity(4);
    put_varint(&mut out, value)?;
    Ok(out.to_vec())
}

/// Decode a variable byte integer from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(bytes: &[u8]) -> Result<(u32, usize), ProtocolError> {
    let mut decoder = VarintDecoder::new();
    for &byte in bytes.iter().take(4) {
        if let Some(done) = decoder.push(byte)? {
            return Ok(done);
        }
    }
    Err(ProtocolError::Truncated {
        needed: bytes.len() + 1,
        available: bytes.len(),
    })
}

/// Append a two byte big-endian length prefix followed by the raw bytes.
pub fn put_binary(out: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_STRING_LEN {
        return Err(ProtocolError::StringTooLong(data.len()));
    }
    out.put_u16(data.len() as u16);
    out.put_slice(data);
    Ok(())
}

pub fn put_string(out: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    put_binary(out, s.as_bytes())
}

/// Length-prefixed encoding of `s` into a fresh buffer.
pub fn encode_string(s: &str) -> Result<Vec<u8>, ProtocolError> {
    let mut out = BytesMut::with_capacity(2 + s.len());
    put_string(&mut out, s)?;
    Ok(out.to_vec())
}

/// Read a big-endian `u16` at the front of `bytes`.
pub fn read_u16(bytes: &[u8]) -> Result<u16, ProtocolError> {
    match bytes {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(ProtocolError::Truncated {
            needed: 2,
            available: bytes.len(),
        }),
    }
}

/// Read a length-prefixed UTF-8 string borrowed from `bytes`.
///
/// Returns the string and the number of bytes consumed including the prefix.
pub fn read_string(bytes: &[u8]) -> Result<(&str, usize), ProtocolError> {
    let len = read_u16(bytes)? as usize;
    let end = 2 + len;
    let raw = bytes.get(2..end).ok_or(ProtocolError::Truncated {
        needed: end,
        available: bytes.len(),
    })?;
    let s = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok((s, end))
}
