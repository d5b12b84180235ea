//! Single-record command messages.

use crate::encoder::{Encode, Sink};
use crate::error::{ProtoError, Result};
use crate::field::{Field, RawField};
use crate::operation::{Operation, RawOperation};
use crate::protocol::{
    MessageType, ProtoHeader, MSG_REMAINING_HEADER_SIZE, MSG_TOTAL_HEADER_SIZE, PROTO_HEADER_SIZE,
};
use crate::reader::ByteReader;

/// The 22-byte command header that follows the proto header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandHeader {
    /// Read flags.
    pub info1: u8,
    /// Write flags.
    pub info2: u8,
    /// Misc flags.
    pub info3: u8,
    /// Transaction attribute.
    pub info4: u8,
    /// Expected or returned generation.
    pub generation: u32,
    /// Expiration (TTL) in seconds.
    pub expiration: u32,
    /// Server-side timeout in ms; restamped before every send.
    pub server_timeout: u32,
}

impl CommandHeader {
    /// Write the proto header placeholder plus the command header.
    pub fn write<S: Sink>(&self, sink: &mut S, field_count: usize, op_count: usize) -> Result<()> {
        let fields = u16::try_from(field_count).map_err(|_| ProtoError::InvalidValue {
            reason: format!("{field_count} fields"),
        })?;
        let ops = u16::try_from(op_count).map_err(|_| ProtoError::InvalidValue {
            reason: format!("{op_count} operations"),
        })?;
        sink.put_u64(0);
        sink.put_u8(MSG_REMAINING_HEADER_SIZE as u8);
        sink.put_u8(self.info1);
        sink.put_u8(self.info2);
        sink.put_u8(self.info3);
        sink.put_u8(self.info4);
        sink.put_u8(0);
        sink.put_u32(self.generation);
        sink.put_u32(self.expiration);
        sink.put_u32(self.server_timeout);
        sink.put_u16(fields);
        sink.put_u16(ops);
        Ok(())
    }

    /// Read the command header that follows the proto header, returning it
    /// with the declared field and operation counts.
    pub fn read(r: &mut ByteReader<'_>) -> Result<(Self, u16, u16)> {
        let header_len = r.u8()?;
        if header_len as usize != MSG_REMAINING_HEADER_SIZE {
            return Err(ProtoError::header(format!("header length {header_len}")));
        }
        let info1 = r.u8()?;
        let info2 = r.u8()?;
        let info3 = r.u8()?;
        let info4 = r.u8()?;
        r.skip(1)?;
        let generation = r.u32()?;
        let expiration = r.u32()?;
        let server_timeout = r.u32()?;
        let field_count = r.u16()?;
        let op_count = r.u16()?;
        let header = Self {
            info1,
            info2,
            info3,
            info4,
            generation,
            expiration,
            server_timeout,
        };
        Ok((header, field_count, op_count))
    }
}

/// A complete command: header, fields, operations.
///
/// Counts are derived from the vectors, so the declared counts always match
/// what is written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Command header.
    pub header: CommandHeader,
    /// Fields, in wire order.
    pub fields: Vec<Field>,
    /// Operations, in wire order.
    pub ops: Vec<Operation>,
}

impl Message {
    /// Message with the given header and no fields or operations.
    pub fn new(header: CommandHeader) -> Self {
        Self {
            header,
            fields: Vec::new(),
            ops: Vec::new(),
        }
    }

    /// Append a field.
    pub fn field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Append an operation.
    pub fn op(mut self, op: Operation) -> Self {
        self.ops.push(op);
        self
    }

    /// Decode a plain (type 3) message.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let proto = ProtoHeader::decode(bytes)?;
        if proto.msg_type != MessageType::Message {
            return Err(ProtoError::header(format!(
                "expected plain message, got {:?}",
                proto.msg_type
            )));
        }
        let end = PROTO_HEADER_SIZE + proto.length;
        if bytes.len() < end || end < MSG_TOTAL_HEADER_SIZE {
            return Err(ProtoError::Truncated {
                needed: end.max(MSG_TOTAL_HEADER_SIZE),
                available: bytes.len(),
            });
        }
        let mut r = ByteReader::new(&bytes[PROTO_HEADER_SIZE..end]);
        let (header, field_count, op_count) = CommandHeader::read(&mut r)?;

        let fields = (0..field_count)
            .map(|_| RawField::read(&mut r)?.to_field())
            .collect::<Result<Vec<_>>>()?;
        let ops = (0..op_count)
            .map(|_| RawOperation::read(&mut r)?.into_operation())
            .collect::<Result<Vec<_>>>()?;
        if !r.is_empty() {
            return Err(ProtoError::header(format!(
                "{} trailing bytes after operations",
                r.remaining()
            )));
        }

        Ok(Self {
            header,
            fields,
            ops,
        })
    }
}

impl Encode for Message {
    fn encode<S: Sink>(&self, sink: &mut S) -> Result<()> {
        self.header.write(sink, self.fields.len(), self.ops.len())?;
        for field in &self.fields {
            field.encode(sink)?;
        }
        for op in &self.ops {
            op.encode(sink)?;
        }
        Ok(())
    }
}
