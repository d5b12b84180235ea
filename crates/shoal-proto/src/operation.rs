//! Bin operations.
//!
//! ```text
//! [size: u32 = name + value + 4][op: u8][particle: u8][0: u8][name_len: u8][name][value]
//! ```

use crate::encoder::{Encode, Sink};
use crate::error::{ProtoError, Result};
use crate::protocol::{OperationType, MAX_BIN_NAME_LEN, OPERATION_HEADER_SIZE};
use crate::reader::ByteReader;
use crate::value::Value;

/// Reject names the server would refuse. Never truncates.
pub fn check_bin_name(name: &str) -> Result<()> {
    if name.len() > MAX_BIN_NAME_LEN {
        return Err(ProtoError::BinNameTooLong {
            name: name.to_string(),
            len: name.len(),
        });
    }
    Ok(())
}

/// One operation on one bin.
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    /// What to do.
    pub op_type: OperationType,
    /// Target bin; empty for record-level operations.
    pub bin_name: String,
    /// Operand, `Nil` for reads.
    pub value: Value,
}

impl Operation {
    /// Read one bin.
    pub fn get(bin_name: impl Into<String>) -> Self {
        Self::new(OperationType::Read, bin_name, Value::Nil)
    }

    /// Read the record header only.
    pub fn get_header() -> Self {
        Self::new(OperationType::Read, "", Value::Nil)
    }

    /// Write one bin.
    pub fn put(bin_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(OperationType::Write, bin_name, value.into())
    }

    /// Add to a numeric bin.
    pub fn add(bin_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(OperationType::Add, bin_name, value.into())
    }

    /// Append to a string bin.
    pub fn append(bin_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(OperationType::Append, bin_name, value.into())
    }

    /// Prepend to a string bin.
    pub fn prepend(bin_name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(OperationType::Prepend, bin_name, value.into())
    }

    /// Reset the record's time to live.
    pub fn touch() -> Self {
        Self::new(OperationType::Touch, "", Value::Nil)
    }

    /// Delete the record.
    pub fn delete() -> Self {
        Self::new(OperationType::Delete, "", Value::Nil)
    }

    /// Any operation type.
    pub fn new(op_type: OperationType, bin_name: impl Into<String>, value: Value) -> Self {
        Self {
            op_type,
            bin_name: bin_name.into(),
            value,
        }
    }

    /// True if the operation mutates the record.
    pub fn is_write(&self) -> bool {
        self.op_type.is_write()
    }
}

impl Encode for Operation {
    fn encode<S: Sink>(&self, sink: &mut S) -> Result<()> {
        check_bin_name(&self.bin_name)?;
        let name_len = self.bin_name.len();
        sink.put_u32((name_len + self.value.estimate_size() + 4) as u32);
        sink.put_u8(self.op_type as u8);
        sink.put_u8(self.value.particle_type());
        sink.put_u8(0);
        sink.put_u8(name_len as u8);
        sink.put_bytes(self.bin_name.as_bytes());
        self.value.write(sink);
        Ok(())
    }

    fn encoded_size(&self) -> Result<usize> {
        check_bin_name(&self.bin_name)?;
        Ok(OPERATION_HEADER_SIZE + self.bin_name.len() + self.value.estimate_size())
    }
}

/// An operation (or response bin) decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOperation {
    /// Operation type byte.
    pub op_type: u8,
    /// Bin name.
    pub bin_name: String,
    /// Decoded value.
    pub value: Value,
}

impl RawOperation {
    /// Read one operation from `reader`.
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self> {
        let size = reader.u32()? as usize;
        let op_type = reader.u8()?;
        let particle = reader.u8()?;
        reader.skip(1)?;
        let name_len = reader.u8()? as usize;
        if size < name_len + 4 {
            return Err(ProtoError::header(format!(
                "operation size {size} smaller than its name ({name_len})"
            )));
        }
        let name = reader.bytes(name_len)?;
        let value = reader.bytes(size - name_len - 4)?;
        Ok(Self {
            op_type,
            bin_name: String::from_utf8(name.to_vec()).map_err(|e| ProtoError::InvalidValue {
                reason: e.to_string(),
            })?,
            value: Value::decode(particle, value)?,
        })
    }

    /// Convert back into a typed operation.
    pub fn into_operation(self) -> Result<Operation> {
        let op_type = OperationType::from_u8(self.op_type).ok_or_else(|| {
            ProtoError::header(format!("unknown operation type {}", self.op_type))
        })?;
        Ok(Operation::new(op_type, self.bin_name, self.value))
    }
}
