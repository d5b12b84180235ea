//! Typed, length-prefixed message fields.
//!
//! A field is `[length: u32][type: u8][payload]` where `length` counts the
//! type byte plus the payload.

use bytes::Bytes;

use crate::encoder::{Encode, Sink};
use crate::error::{ProtoError, Result};
use crate::operation::check_bin_name;
use crate::protocol::{FieldType, DIGEST_SIZE, FIELD_HEADER_SIZE};
use crate::reader::ByteReader;
use crate::value::Value;

/// Secondary-index range predicate carried by a query.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRange {
    /// Indexed bin.
    pub bin_name: String,
    /// Particle type of both bounds.
    pub particle: u8,
    /// Inclusive lower bound, serialized.
    pub begin: Bytes,
    /// Inclusive upper bound, serialized.
    pub end: Bytes,
}

impl IndexRange {
    fn payload_size(&self) -> usize {
        // count, name length, name, particle, begin length, begin, end length, end
        1 + 1 + self.bin_name.len() + 1 + 4 + self.begin.len() + 4 + self.end.len()
    }

    fn write<S: Sink>(&self, sink: &mut S) {
        sink.put_u8(1);
        sink.put_u8(self.bin_name.len() as u8);
        sink.put_bytes(self.bin_name.as_bytes());
        sink.put_u8(self.particle);
        sink.put_u32(self.begin.len() as u32);
        sink.put_bytes(&self.begin);
        sink.put_u32(self.end.len() as u32);
        sink.put_bytes(&self.end);
    }
}

/// A message field.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Namespace name.
    Namespace(String),
    /// Set name.
    Set(String),
    /// Key digest.
    Digest([u8; DIGEST_SIZE]),
    /// User key: particle type byte, then the value.
    UserKey(Value),
    /// Compiled filter expression.
    FilterExp(Bytes),
    /// Record version, 7 bytes little-endian.
    RecordVersion(u64),
    /// Transaction id, 8 bytes little-endian.
    TxnId(u64),
    /// Transaction deadline, 4 bytes little-endian.
    TxnDeadline(u32),
    /// Server socket timeout in ms.
    SocketTimeout(u32),
    /// Scan/query task id.
    TaskId(u64),
    /// Record limit.
    MaxRecords(u64),
    /// Throttle.
    RecordsPerSecond(u32),
    /// Partitions to scan, each `u16` little-endian.
    PartitionIds(Vec<u16>),
    /// Digests to resume from.
    DigestArray(Vec<[u8; DIGEST_SIZE]>),
    /// Secondary index name.
    IndexName(String),
    /// Secondary index range predicate.
    IndexRange(IndexRange),
    /// Secondary index collection type.
    IndexType(u8),
    /// UDF package name.
    UdfPackage(String),
    /// UDF function name.
    UdfFunction(String),
    /// Serialized UDF argument list.
    UdfArgs(Bytes),
    /// Bins to return.
    BinList(Vec<String>),
}

impl Field {
    /// Wire type tag.
    pub fn field_type(&self) -> FieldType {
        match self {
            Field::Namespace(_) => FieldType::Namespace,
            Field::Set(_) => FieldType::Set,
            Field::Digest(_) => FieldType::DigestRipe,
            Field::UserKey(_) => FieldType::Key,
            Field::FilterExp(_) => FieldType::FilterExp,
            Field::RecordVersion(_) => FieldType::RecordVersion,
            Field::TxnId(_) => FieldType::TxnId,
            Field::TxnDeadline(_) => FieldType::TxnDeadline,
            Field::SocketTimeout(_) => FieldType::SocketTimeout,
            Field::TaskId(_) => FieldType::TaskId,
            Field::MaxRecords(_) => FieldType::MaxRecords,
            Field::RecordsPerSecond(_) => FieldType::RecordsPerSecond,
            Field::PartitionIds(_) => FieldType::PartitionIds,
            Field::DigestArray(_) => FieldType::DigestArray,
            Field::IndexName(_) => FieldType::IndexName,
            Field::IndexRange(_) => FieldType::IndexRange,
            Field::IndexType(_) => FieldType::IndexType,
            Field::UdfPackage(_) => FieldType::UdfPackage,
            Field::UdfFunction(_) => FieldType::UdfFunction,
            Field::UdfArgs(_) => FieldType::UdfArgs,
            Field::BinList(_) => FieldType::BinList,
        }
    }

    /// Payload size, excluding the 5-byte header.
    pub fn payload_size(&self) -> usize {
        match self {
            Field::Namespace(s)
            | Field::Set(s)
            | Field::IndexName(s)
            | Field::UdfPackage(s)
            | Field::UdfFunction(s) => s.len(),
            Field::Digest(_) => DIGEST_SIZE,
            Field::UserKey(v) => 1 + v.estimate_size(),
            Field::FilterExp(b) | Field::UdfArgs(b) => b.len(),
            Field::RecordVersion(_) => 7,
            Field::TxnId(_) | Field::TaskId(_) | Field::MaxRecords(_) => 8,
            Field::TxnDeadline(_) | Field::SocketTimeout(_) | Field::RecordsPerSecond(_) => 4,
            Field::PartitionIds(ids) => ids.len() * 2,
            Field::DigestArray(d) => d.len() * DIGEST_SIZE,
            Field::IndexRange(r) => r.payload_size(),
            Field::IndexType(_) => 1,
            Field::BinList(names) => 1 + names.iter().map(|n| 1 + n.len()).sum::<usize>(),
        }
    }

    fn write_payload<S: Sink>(&self, sink: &mut S) {
        match self {
            Field::Namespace(s)
            | Field::Set(s)
            | Field::IndexName(s)
            | Field::UdfPackage(s)
            | Field::UdfFunction(s) => sink.put_bytes(s.as_bytes()),
            Field::Digest(d) => sink.put_bytes(d),
            Field::UserKey(v) => {
                sink.put_u8(v.particle_type());
                v.write(sink);
            }
            Field::FilterExp(b) | Field::UdfArgs(b) => sink.put_bytes(b),
            Field::RecordVersion(v) => sink.put_bytes(&v.to_le_bytes()[..7]),
            Field::TxnId(v) => sink.put_bytes(&v.to_le_bytes()),
            Field::TxnDeadline(v) => sink.put_bytes(&v.to_le_bytes()),
            Field::SocketTimeout(v) | Field::RecordsPerSecond(v) => sink.put_u32(*v),
            Field::TaskId(v) | Field::MaxRecords(v) => sink.put_u64(*v),
            Field::PartitionIds(ids) => {
                for id in ids {
                    sink.put_bytes(&id.to_le_bytes());
                }
            }
            Field::DigestArray(digests) => {
                for d in digests {
                    sink.put_bytes(d);
                }
            }
            Field::IndexRange(r) => r.write(sink),
            Field::IndexType(t) => sink.put_u8(*t),
            Field::BinList(names) => {
                sink.put_u8(names.len() as u8);
                for n in names {
                    sink.put_u8(n.len() as u8);
                    sink.put_bytes(n.as_bytes());
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            Field::IndexRange(r) => check_bin_name(&r.bin_name),
            Field::BinList(names) => {
                if names.len() > u8::MAX as usize {
                    return Err(ProtoError::InvalidValue {
                        reason: format!("bin list of {} names", names.len()),
                    });
                }
                names.iter().try_for_each(|n| check_bin_name(n))
            }
            _ => Ok(()),
        }
    }
}

impl Encode for Field {
    fn encode<S: Sink>(&self, sink: &mut S) -> Result<()> {
        self.validate()?;
        sink.put_u32(self.payload_size() as u32 + 1);
        sink.put_u8(self.field_type() as u8);
        self.write_payload(sink);
        Ok(())
    }

    fn encoded_size(&self) -> Result<usize> {
        self.validate()?;
        Ok(FIELD_HEADER_SIZE + self.payload_size())
    }
}

/// A field as seen on the wire, payload borrowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawField<'a> {
    /// Type byte.
    pub field_type: u8,
    /// Payload.
    pub payload: &'a [u8],
}

impl<'a> RawField<'a> {
    /// Read one field from `reader`.
    pub fn read(reader: &mut ByteReader<'a>) -> Result<Self> {
        let len = reader.u32()? as usize;
        if len == 0 {
            return Err(ProtoError::header("zero-length field"));
        }
        let field_type = reader.u8()?;
        let payload = reader.bytes(len - 1)?;
        Ok(Self {
            field_type,
            payload,
        })
    }

    /// Payload as UTF-8.
    pub fn as_str(&self) -> Result<String> {
        String::from_utf8(self.payload.to_vec()).map_err(|e| ProtoError::InvalidValue {
            reason: e.to_string(),
        })
    }

    /// Convert to a typed field.
    pub fn to_field(&self) -> Result<Field> {
        let field_type = FieldType::from_u8(self.field_type)
            .ok_or_else(|| ProtoError::header(format!("unknown field type {}", self.field_type)))?;
        let mut r = ByteReader::new(self.payload);
        let field = match field_type {
            FieldType::Namespace => Field::Namespace(self.as_str()?),
            FieldType::Set => Field::Set(self.as_str()?),
            FieldType::IndexName => Field::IndexName(self.as_str()?),
            FieldType::UdfPackage => Field::UdfPackage(self.as_str()?),
            FieldType::UdfFunction => Field::UdfFunction(self.as_str()?),
            FieldType::DigestRipe => Field::Digest(digest_from(self.payload)?),
            FieldType::Key => {
                let particle = r.u8()?;
                Field::UserKey(Value::decode(particle, r.bytes(r.remaining())?)?)
            }
            FieldType::FilterExp => Field::FilterExp(Bytes::copy_from_slice(self.payload)),
            FieldType::UdfArgs => Field::UdfArgs(Bytes::copy_from_slice(self.payload)),
            FieldType::RecordVersion => Field::RecordVersion(self.as_record_version()?),
            FieldType::TxnId => Field::TxnId(self.le_integer(8)?),
            FieldType::TxnDeadline => Field::TxnDeadline(self.le_integer(4)? as u32),
            FieldType::SocketTimeout => Field::SocketTimeout(r.u32()?),
            FieldType::RecordsPerSecond => Field::RecordsPerSecond(r.u32()?),
            FieldType::TaskId => Field::TaskId(r.u64()?),
            FieldType::MaxRecords => Field::MaxRecords(r.u64()?),
            FieldType::PartitionIds => {
                let mut ids = Vec::with_capacity(self.payload.len() / 2);
                while !r.is_empty() {
                    let raw = r.bytes(2)?;
                    ids.push(u16::from_le_bytes([raw[0], raw[1]]));
                }
                Field::PartitionIds(ids)
            }
            FieldType::DigestArray => {
                let mut digests = Vec::with_capacity(self.payload.len() / DIGEST_SIZE);
                while !r.is_empty() {
                    digests.push(digest_from(r.bytes(DIGEST_SIZE)?)?);
                }
                Field::DigestArray(digests)
            }
            FieldType::IndexRange => {
                let _count = r.u8()?;
                let name_len = r.u8()? as usize;
                let bin_name = String::from_utf8(r.bytes(name_len)?.to_vec()).map_err(|e| {
                    ProtoError::InvalidValue {
                        reason: e.to_string(),
                    }
                })?;
                let particle = r.u8()?;
                let begin_len = r.u32()? as usize;
                let begin = Bytes::copy_from_slice(r.bytes(begin_len)?);
                let end_len = r.u32()? as usize;
                let end = Bytes::copy_from_slice(r.bytes(end_len)?);
                Field::IndexRange(IndexRange {
                    bin_name,
                    particle,
                    begin,
                    end,
                })
            }
            FieldType::IndexType => Field::IndexType(r.u8()?),
            FieldType::BinList => {
                let count = r.u8()? as usize;
                let mut names = Vec::with_capacity(count);
                for _ in 0..count {
                    let len = r.u8()? as usize;
                    names.push(String::from_utf8(r.bytes(len)?.to_vec()).map_err(|e| {
                        ProtoError::InvalidValue {
                            reason: e.to_string(),
                        }
                    })?);
                }
                Field::BinList(names)
            }
            other => {
                return Err(ProtoError::header(format!(
                    "field {other:?} has no standalone form"
                )))
            }
        };
        Ok(field)
    }

    /// Payload as a 7-byte little-endian record version.
    pub fn as_record_version(&self) -> Result<u64> {
        self.le_integer(7)
    }

    /// Little-endian integer of exactly `width` bytes.
    pub fn le_integer(&self, width: usize) -> Result<u64> {
        if self.payload.len() != width || width > 8 {
            return Err(ProtoError::InvalidValue {
                reason: format!(
                    "field {} expects {width} bytes, got {}",
                    self.field_type,
                    self.payload.len()
                ),
            });
        }
        let mut raw = [0u8; 8];
        raw[..width].copy_from_slice(self.payload);
        Ok(u64::from_le_bytes(raw))
    }
}

fn digest_from(bytes: &[u8]) -> Result<[u8; DIGEST_SIZE]> {
    <[u8; DIGEST_SIZE]>::try_from(bytes).map_err(|_| ProtoError::InvalidValue {
        reason: format!("digest of {} bytes", bytes.len()),
    })
}
