//! Bin and key values, sized and placed on the wire.
//!
//! Only scalar types are serialized here. Collection and other complex types
//! travel as [`Value::Raw`] bytes that the caller has already serialized.

use std::fmt;

use bytes::Bytes;

use crate::encoder::Sink;
use crate::error::{ProtoError, Result};

/// Wire particle type tags.
pub mod particle {
    /// No value.
    pub const NULL: u8 = 0;
    /// Signed 64-bit integer.
    pub const INTEGER: u8 = 1;
    /// IEEE 754 double.
    pub const FLOAT: u8 = 2;
    /// UTF-8 string.
    pub const STRING: u8 = 3;
    /// Opaque bytes.
    pub const BLOB: u8 = 4;
    /// Boolean.
    pub const BOOL: u8 = 17;
    /// HyperLogLog.
    pub const HLL: u8 = 18;
    /// Map.
    pub const MAP: u8 = 19;
    /// List.
    pub const LIST: u8 = 20;
    /// GeoJSON.
    pub const GEOJSON: u8 = 23;
}

/// A bin or key value.
#[derive(Clone, PartialEq)]
pub enum Value {
    /// Absent value.
    Nil,
    /// Integer.
    Int(i64),
    /// Double.
    Float(f64),
    /// Boolean.
    Bool(bool),
    /// String.
    String(String),
    /// Byte array.
    Blob(Bytes),
    /// Pre-serialized value of any other particle type.
    Raw {
        /// Particle type tag.
        particle: u8,
        /// Serialized bytes.
        bytes: Bytes,
    },
}

impl Value {
    /// Particle type tag.
    pub fn particle_type(&self) -> u8 {
        match self {
            Value::Nil => particle::NULL,
            Value::Int(_) => particle::INTEGER,
            Value::Float(_) => particle::FLOAT,
            Value::Bool(_) => particle::BOOL,
            Value::String(_) => particle::STRING,
            Value::Blob(_) => particle::BLOB,
            Value::Raw { particle, .. } => *particle,
        }
    }

    /// Serialized size in bytes.
    pub fn estimate_size(&self) -> usize {
        match self {
            Value::Nil => 0,
            Value::Int(_) | Value::Float(_) => 8,
            Value::Bool(_) => 1,
            Value::String(s) => s.len(),
            Value::Blob(b) => b.len(),
            Value::Raw { bytes, .. } => bytes.len(),
        }
    }

    /// Serialize into `sink`.
    pub fn write<S: Sink>(&self, sink: &mut S) {
        match self {
            Value::Nil => {}
            Value::Int(v) => sink.put_u64(*v as u64),
            Value::Float(v) => sink.put_u64(v.to_bits()),
            Value::Bool(v) => sink.put_u8(u8::from(*v)),
            Value::String(s) => sink.put_bytes(s.as_bytes()),
            Value::Blob(b) => sink.put_bytes(b),
            Value::Raw { bytes, .. } => sink.put_bytes(bytes),
        }
    }

    /// Decode a value of the given particle type.
    pub fn decode(particle_type: u8, bytes: &[u8]) -> Result<Value> {
        let fixed = |n: usize| -> Result<[u8; 8]> {
            if bytes.len() != n {
                return Err(ProtoError::InvalidValue {
                    reason: format!(
                        "particle {particle_type} expects {n} bytes, got {}",
                        bytes.len()
                    ),
                });
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Ok(raw)
        };

        Ok(match particle_type {
            particle::NULL => Value::Nil,
            particle::INTEGER => Value::Int(i64::from_be_bytes(fixed(8)?)),
            particle::FLOAT => Value::Float(f64::from_bits(u64::from_be_bytes(fixed(8)?))),
            particle::BOOL => match bytes {
                [b] => Value::Bool(*b != 0),
                _ => {
                    return Err(ProtoError::InvalidValue {
                        reason: format!("bool expects 1 byte, got {}", bytes.len()),
                    })
                }
            },
            particle::STRING => Value::String(String::from_utf8(bytes.to_vec()).map_err(
                |e| ProtoError::InvalidValue {
                    reason: e.to_string(),
                },
            )?),
            particle::BLOB => Value::Blob(Bytes::copy_from_slice(bytes)),
            other => Value::Raw {
                particle: other,
                bytes: Bytes::copy_from_slice(bytes),
            },
        })
    }

    /// True for the types that can identify a record.
    pub fn is_valid_key(&self) -> bool {
        matches!(self, Value::Int(_) | Value::String(_) | Value::Blob(_))
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "blob[{}]", b.len()),
            Value::Raw { particle, bytes } => write!(f, "raw({particle})[{}]", bytes.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
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

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(Bytes::from(v))
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Blob(v)
    }
}
