//! Envelope encoding.
//!
//! The body is a stream of MessagePack values with no field tags, in this
//! order:
//!
//! 1. four IPv4 octets, command port, data port (six integers)
//! 2. encrypted flag
//! 3. if encrypted: the key as an array of single-byte integers
//! 4. execute time, milliseconds since midnight
//! 5. topic, partition, class name
//! 6. the payload as an array of single-byte integers
//!
//! Bytes are written as signed 8-bit integers, one array element each, to
//! stay compatible with peers that pack them that way. The decoder also
//! accepts a key or payload sent as a MessagePack binary blob.
//!
//! A frame is the body prefixed with its length as a big-endian `u16`.

use crate::error::WireError;
use meshbus_types::{Envelope, MemberKey};
use rmpv::Value;
use std::io::Cursor;
use std::net::Ipv4Addr;
use tracing::warn;

/// Size of the frame length prefix.
pub const FRAME_HEADER_LEN: usize = 2;

/// Largest body the length prefix can describe.
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Encode an envelope body (no length prefix).
pub fn encode_body(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let sender = &envelope.sender;
    let [a, b, c, d] = sender.ip.octets();

    let mut values = vec![
        Value::from(a),
        Value::from(b),
        Value::from(c),
        Value::from(d),
        Value::from(sender.command_port),
        Value::from(sender.data_port),
        Value::from(envelope.is_encrypted()),
    ];

    if let Some(key) = &envelope.key {
        if key.is_empty() {
            return Err(WireError::Encode(
                "encrypted envelope requires a non-empty key".to_string(),
            ));
        }
        values.push(byte_array(key));
    }

    values.push(Value::from(envelope.execute_time));
    values.push(Value::from(envelope.milliseconds_since_midnight));
    values.push(Value::from(envelope.topic.as_str()));
    values.push(Value::from(envelope.partition.as_str()));
    values.push(Value::from(envelope.class_name.as_str()));
    values.push(byte_array(&envelope.payload));

    let mut body = Vec::with_capacity(64 + envelope.payload.len() * 2);
    for value in &values {
        rmpv::encode::write_value(&mut body, value)
            .map_err(|e| WireError::Encode(e.to_string()))?;
    }
    Ok(body)
}

/// Encode an envelope into a complete frame (2-byte length + body).
///
/// Bodies longer than [`MAX_BODY_LEN`] keep only the low 16 bits of their
/// length in the prefix; receivers will mis-frame them.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let body = encode_body(envelope)?;
    if body.len() > MAX_BODY_LEN {
        warn!(
            topic = %envelope.topic,
            body_len = body.len(),
            "Envelope body exceeds {} bytes; frame length will be truncated",
            MAX_BODY_LEN
        );
    }
    let len = (body.len() & 0xFFFF) as u16;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode the length prefix from a 2-byte header.
pub fn decode_length(header: &[u8; FRAME_HEADER_LEN]) -> u16 {
    u16::from_be_bytes(*header)
}

/// Decode an envelope body (without the length prefix).
pub fn decode_envelope(body: &[u8]) -> Result<Envelope, WireError> {
    let mut reader = BodyReader::new(body);

    let a = reader.octet("ip[0]")?;
    let b = reader.octet("ip[1]")?;
    let c = reader.octet("ip[2]")?;
    let d = reader.octet("ip[3]")?;
    let command_port = reader.port("command port")?;
    let data_port = reader.port("data port")?;
    let sender = MemberKey::new(Ipv4Addr::new(a, b, c, d), command_port, data_port);

    let key = if reader.boolean("encrypted")? {
        let key = reader.bytes("key")?;
        if key.is_empty() {
            return Err(WireError::Decode(
                "encrypted envelope carries an empty key".to_string(),
            ));
        }
        Some(key)
    } else {
        None
    };

    let execute_time = reader.int32("execute time")?;
    let milliseconds_since_midnight = reader.int32("milliseconds since midnight")?;
    let topic = reader.string("topic")?;
    let partition = reader.string("partition")?;
    let class_name = reader.string("class name")?;
    let payload = reader.bytes("payload")?;

    Ok(Envelope {
        sender,
        key,
        execute_time,
        milliseconds_since_midnight,
        topic,
        partition,
        class_name,
        payload,
    })
}

fn byte_array(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|&b| Value::from(b as i8)).collect())
}

/// Sequential reader over the positional body.
struct BodyReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BodyReader<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(body),
        }
    }

    fn next(&mut self, field: &str) -> Result<Value, WireError> {
        rmpv::decode::read_value(&mut self.cursor)
            .map_err(|e| WireError::Decode(format!("{field}: {e}")))
    }

    fn integer(&mut self, field: &str) -> Result<i64, WireError> {
        let value = self.next(field)?;
        value
            .as_i64()
            .ok_or_else(|| WireError::Decode(format!("{field}: expected integer, got {value}")))
    }

    fn octet(&mut self, field: &str) -> Result<u8, WireError> {
        let n = self.integer(field)?;
        u8::try_from(n).map_err(|_| WireError::Decode(format!("{field}: {n} is not an octet")))
    }

    fn port(&mut self, field: &str) -> Result<u16, WireError> {
        let n = self.integer(field)?;
        u16::try_from(n).map_err(|_| WireError::Decode(format!("{field}: {n} is not a port")))
    }

    fn int32(&mut self, field: &str) -> Result<i32, WireError> {
        let n = self.integer(field)?;
        i32::try_from(n).map_err(|_| WireError::Decode(format!("{field}: {n} overflows i32")))
    }

    fn boolean(&mut self, field: &str) -> Result<bool, WireError> {
        let value = self.next(field)?;
        value
            .as_bool()
            .ok_or_else(|| WireError::Decode(format!("{field}: expected bool, got {value}")))
    }

    fn string(&mut self, field: &str) -> Result<String, WireError> {
        match self.next(field)? {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| WireError::Decode(format!("{field}: invalid UTF-8"))),
            other => Err(WireError::Decode(format!(
                "{field}: expected string, got {other}"
            ))),
        }
    }

    /// A byte sequence sent either as a binary blob or as an array of
    /// single-byte integers (signed or unsigned).
    fn bytes(&mut self, field: &str) -> Result<Vec<u8>, WireError> {
        match self.next(field)? {
            Value::Binary(bytes) => Ok(bytes),
            Value::Array(items) => items
                .iter()
                .map(|item| match item.as_i64() {
                    Some(n @ -128..=-1) => Ok(n as i8 as u8),
                    Some(n @ 0..=255) => Ok(n as u8),
                    _ => Err(WireError::Decode(format!(
                        "{field}: element {item} is not a byte"
                    ))),
                })
                .collect(),
            other => Err(WireError::Decode(format!(
                "{field}: expected bytes, got {other}"
            ))),
        }
    }
}
