//! Typed values stored in record cells.
//!
//! Encoding: `[u32 payload length][u8 type tag][payload]`. The length
//! prefix covers the payload only, which keeps values splittable in a
//! revision stream.

use std::fmt;
use std::hash::{Hash, Hasher};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::storage::codec::{self, Codec};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::Locator;

/// An immutable datum held by a cell.
///
/// Floating point variants compare and hash by bit pattern, so `NaN`
/// equals itself and `0.0` differs from `-0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Float(f32),
    Integer(i32),
    Long(i64),
    /// reference to another record
    Link(Locator),
    String(String),
}

impl Value {
    const TAG_BOOLEAN: u8 = 1;
    const TAG_DOUBLE: u8 = 2;
    const TAG_FLOAT: u8 = 3;
    const TAG_INTEGER: u8 = 4;
    const TAG_LONG: u8 = 5;
    const TAG_LINK: u8 = 6;
    const TAG_STRING: u8 = 7;

    /// largest payload the u32 length prefix can describe
    pub const MAX_PAYLOAD: usize = u32::MAX as usize;

    fn tag(&self) -> u8 {
        match self {
            Value::Boolean(_) => Self::TAG_BOOLEAN,
            Value::Double(_) => Self::TAG_DOUBLE,
            Value::Float(_) => Self::TAG_FLOAT,
            Value::Integer(_) => Self::TAG_INTEGER,
            Value::Long(_) => Self::TAG_LONG,
            Value::Link(_) => Self::TAG_LINK,
            Value::String(_) => Self::TAG_STRING,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Value::Boolean(_) => 1,
            Value::Float(_) | Value::Integer(_) => 4,
            Value::Double(_) | Value::Long(_) | Value::Link(_) => 8,
            Value::String(s) => s.len(),
        }
    }

    /// name of the variant, for diagnostics
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Double(_) => "double",
            Value::Float(_) => "float",
            Value::Integer(_) => "integer",
            Value::Long(_) => "long",
            Value::Link(_) => "link",
            Value::String(_) => "string",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Link(a), Value::Link(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            Value::Boolean(v) => v.hash(state),
            Value::Double(v) => v.to_bits().hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Integer(v) => v.hash(state),
            Value::Long(v) => v.hash(state),
            Value::Link(v) => v.hash(state),
            Value::String(v) => v.hash(state),
        }
    }
}

/// fail with `ValueTooLarge` unless `len` fits the length prefix
fn check_payload_len(len: usize) -> StorageResult<()> {
    if len > Value::MAX_PAYLOAD {
        return Err(StorageError::ValueTooLarge {
            size: len,
            max: Value::MAX_PAYLOAD,
        });
    }
    Ok(())
}

impl Codec for Value {
    fn encode(&self, out: &mut BytesMut) {
        // only reachable for values that bypassed `validate`
        debug_assert!(self.payload_len() <= Self::MAX_PAYLOAD);
        out.reserve(self.encoded_len());
        out.put_u32(self.payload_len() as u32);
        out.put_u8(self.tag());
        match self {
            Value::Boolean(v) => out.put_u8(u8::from(*v)),
            Value::Double(v) => out.put_f64(*v),
            Value::Float(v) => out.put_f32(*v),
            Value::Integer(v) => out.put_i32(*v),
            Value::Long(v) => out.put_i64(*v),
            Value::Link(v) => out.put_u64(v.as_u64()),
            Value::String(v) => out.put_slice(v.as_bytes()),
        }
    }

    fn decode(input: &mut &[u8]) -> StorageResult<Self> {
        let len = codec::get_u32(input, "value length")? as usize;
        let tag = codec::get_u8(input, "value type")?;
        let payload = codec::take(input, len, "value payload")?;

        let value = match tag {
            Self::TAG_BOOLEAN => match fixed(payload, tag, 1)?[0] {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                other => {
                    return Err(StorageError::corrupt(format!(
                        "invalid boolean byte {}",
                        other
                    )))
                }
            },
            Self::TAG_DOUBLE => Value::Double(f64::from_be_bytes(array(fixed(payload, tag, 8)?)?)),
            Self::TAG_FLOAT => Value::Float(f32::from_be_bytes(array(fixed(payload, tag, 4)?)?)),
            Self::TAG_INTEGER => Value::Integer(i32::from_be_bytes(array(fixed(payload, tag, 4)?)?)),
            Self::TAG_LONG => Value::Long(i64::from_be_bytes(array(fixed(payload, tag, 8)?)?)),
            Self::TAG_LINK => Value::Link(Locator::new(u64::from_be_bytes(array(fixed(payload, tag, 8)?)?))),
            Self::TAG_STRING => {
                let s = std::str::from_utf8(payload)
                    .map_err(|e| StorageError::corrupt(format!("string value is not utf-8: {}", e)))?;
                Value::String(s.to_string())
            }
            other => {
                return Err(StorageError::corrupt(format!("unknown value type {}", other)));
            }
        };
        Ok(value)
    }

    fn encoded_len(&self) -> usize {
        4 + 1 + self.payload_len()
    }

    fn validate(&self) -> StorageResult<()> {
        check_payload_len(self.payload_len())
    }
}

/// payload of a fixed-width type must be exactly `width` bytes
fn fixed(payload: &[u8], tag: u8, width: usize) -> StorageResult<&[u8]> {
    if payload.len() != width {
        return Err(StorageError::corrupt(format!(
            "value type {} expects {} payload bytes, found {}",
            tag,
            width,
            payload.len()
        )));
    }
    Ok(payload)
}

fn array<const N: usize>(bytes: &[u8]) -> StorageResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| StorageError::corrupt(format!("expected {} bytes", N)))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Integer(v) => write!(f, "{}", v),
            Value::Long(v) => write!(f, "{}", v),
            Value::Link(v) => write!(f, "@{}", v),
            Value::String(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<Locator> for Value {
    fn from(v: Locator) -> Self {
        Value::Link(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}
