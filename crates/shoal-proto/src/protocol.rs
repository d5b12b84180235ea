//! Wire constants and the 8-byte proto header.
//!
//! Every message on the wire starts with an 8-byte big-endian proto header
//! packing `version:8 | type:8 | length:48`, where `length` counts the bytes
//! that follow the header. Plain command messages then carry a 22-byte
//! command header, `field_count` fields and `op_count` operations:
//!
//! ```text
//! offset  0  proto header (8)
//! offset  8  header length (always 22)
//! offset  9  info1 | 10 info2 | 11 info3 | 12 info4
//! offset 13  result code (responses)
//! offset 14  generation (u32)
//! offset 18  expiration (u32)
//! offset 22  server timeout in ms (u32)
//! offset 26  field count (u16)
//! offset 28  op count (u16)
//! offset 30  fields, then operations
//! ```

use std::fmt;

use crate::error::{ProtoError, Result};

/// Proto header size in bytes.
pub const PROTO_HEADER_SIZE: usize = 8;
/// Proto header plus command header.
pub const MSG_TOTAL_HEADER_SIZE: usize = 30;
/// Command header size (bytes after the proto header).
pub const MSG_REMAINING_HEADER_SIZE: usize = 22;
/// Field header: length (4) + type (1).
pub const FIELD_HEADER_SIZE: usize = 5;
/// Operation header: size (4) + op (1) + particle (1) + reserved (1) + name length (1).
pub const OPERATION_HEADER_SIZE: usize = 8;
/// Key digest size.
pub const DIGEST_SIZE: usize = 20;
/// Longest bin or operation name the server accepts.
pub const MAX_BIN_NAME_LEN: usize = 15;
/// Messages at or below this size are never compressed.
pub const COMPRESS_THRESHOLD: usize = 128;
/// Proto header plus the original-length field of a compressed message.
pub const COMPRESSED_HEADER_SIZE: usize = 16;
/// Hard cap on an uncompressed message, in either direction.
pub const MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Protocol version carried in every proto header.
pub const PROTO_VERSION: u8 = 2;

/// Offset of the server-side timeout inside a command message.
pub const SERVER_TIMEOUT_OFFSET: usize = 22;

// info1
/// Read the record.
pub const INFO1_READ: u8 = 1 << 0;
/// Read all bins.
pub const INFO1_GET_ALL: u8 = 1 << 1;
/// Short query.
pub const INFO1_SHORT_QUERY: u8 = 1 << 2;
/// Batch request.
pub const INFO1_BATCH: u8 = 1 << 3;
/// Do not return bin data.
pub const INFO1_NOBINDATA: u8 = 1 << 5;
/// Involve all replicas in AP reads.
pub const INFO1_READ_MODE_AP_ALL: u8 = 1 << 6;
/// Ask the server to compress its response.
pub const INFO1_COMPRESS_RESPONSE: u8 = 1 << 7;

// info2
/// Write the record.
pub const INFO2_WRITE: u8 = 1 << 0;
/// Delete the record.
pub const INFO2_DELETE: u8 = 1 << 1;
/// Apply only if generation matches.
pub const INFO2_GENERATION: u8 = 1 << 2;
/// Apply only if new generation is greater.
pub const INFO2_GENERATION_GT: u8 = 1 << 3;
/// Leave a tombstone on delete.
pub const INFO2_DURABLE_DELETE: u8 = 1 << 4;
/// Create only, fail if the record exists.
pub const INFO2_CREATE_ONLY: u8 = 1 << 5;
/// Return a result for every operation.
pub const INFO2_RESPOND_ALL_OPS: u8 = 1 << 7;

// info3
/// Last record of a streamed response.
pub const INFO3_LAST: u8 = 1 << 0;
/// Commit on master only.
pub const INFO3_COMMIT_MASTER: u8 = 1 << 1;
/// Partition is done (scan/query).
pub const INFO3_PARTITION_DONE: u8 = 1 << 2;
/// Update only, fail if the record does not exist.
pub const INFO3_UPDATE_ONLY: u8 = 1 << 3;
/// Create or replace all bins.
pub const INFO3_CREATE_OR_REPLACE: u8 = 1 << 4;
/// Replace only.
pub const INFO3_REPLACE_ONLY: u8 = 1 << 5;
/// Strong-consistency read type bit.
pub const INFO3_SC_READ_TYPE: u8 = 1 << 6;
/// Strong-consistency relaxed read bit.
pub const INFO3_SC_READ_RELAX: u8 = 1 << 7;

// info4 (transaction attribute)
/// Verify a transaction read.
pub const INFO4_TXN_VERIFY_READ: u8 = 1 << 0;
/// Roll a transaction forward.
pub const INFO4_TXN_ROLL_FORWARD: u8 = 1 << 1;
/// Roll a transaction back.
pub const INFO4_TXN_ROLL_BACK: u8 = 1 << 2;
/// Only lock, do not apply.
pub const INFO4_TXN_ON_LOCKING_ONLY: u8 = 1 << 4;

// batch entry flags
/// Entry repeats the previous full entry.
pub const BATCH_MSG_REPEAT: u8 = 0x01;
/// Entry carries info1..info3.
pub const BATCH_MSG_INFO: u8 = 0x02;
/// Entry carries a generation.
pub const BATCH_MSG_GEN: u8 = 0x04;
/// Entry carries an expiration.
pub const BATCH_MSG_TTL: u8 = 0x08;
/// Entry carries info4.
pub const BATCH_MSG_INFO4: u8 = 0x10;

/// Proto message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Info protocol (reserved, unused by commands).
    Info = 1,
    /// Plain command message.
    Message = 3,
    /// Zlib-compressed command message.
    Compressed = 4,
}

impl MessageType {
    /// Decode from the wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Info),
            3 => Some(MessageType::Message),
            4 => Some(MessageType::Compressed),
            _ => None,
        }
    }
}

/// The 8-byte proto header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtoHeader {
    /// Protocol version.
    pub version: u8,
    /// Message type.
    pub msg_type: MessageType,
    /// Bytes following the header.
    pub length: usize,
}

impl ProtoHeader {
    /// Header for a message of the given type and body length.
    pub fn new(msg_type: MessageType, length: usize) -> Self {
        Self {
            version: PROTO_VERSION,
            msg_type,
            length,
        }
    }

    /// Pack into the 64-bit wire word.
    pub fn to_u64(&self) -> u64 {
        (self.length as u64 & 0x0000_FFFF_FFFF_FFFF)
            | ((self.version as u64) << 56)
            | ((self.msg_type as u64) << 48)
    }

    /// Big-endian wire bytes.
    pub fn encode(&self) -> [u8; PROTO_HEADER_SIZE] {
        self.to_u64().to_be_bytes()
    }

    /// Decode and validate wire bytes.
    ///
    /// Rejects unknown versions and types and lengths above [`MAX_MESSAGE_SIZE`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PROTO_HEADER_SIZE {
            return Err(ProtoError::Truncated {
                needed: PROTO_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let mut raw = [0u8; PROTO_HEADER_SIZE];
        raw.copy_from_slice(&bytes[..PROTO_HEADER_SIZE]);
        let word = u64::from_be_bytes(raw);
        let version = (word >> 56) as u8;
        if version != PROTO_VERSION {
            return Err(ProtoError::header(format!(
                "protocol version {version}, expected {PROTO_VERSION}"
            )));
        }
        let type_byte = ((word >> 48) & 0xFF) as u8;
        let msg_type = MessageType::from_u8(type_byte)
            .ok_or_else(|| ProtoError::header(format!("unknown message type {type_byte}")))?;
        let length = (word & 0x0000_FFFF_FFFF_FFFF) as usize;
        if length > MAX_MESSAGE_SIZE {
            return Err(ProtoError::MessageTooLarge {
                size: length,
                max: MAX_MESSAGE_SIZE,
            });
        }
        Ok(Self {
            version,
            msg_type,
            length,
        })
    }
}

/// Field type discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    /// Namespace name.
    Namespace = 0,
    /// Set name.
    Set = 1,
    /// User key.
    Key = 2,
    /// Record version (transactions).
    RecordVersion = 3,
    /// Key digest.
    DigestRipe = 4,
    /// Transaction id.
    TxnId = 5,
    /// Transaction deadline.
    TxnDeadline = 6,
    /// Scan/query task id.
    TaskId = 7,
    /// Server-side socket timeout.
    SocketTimeout = 9,
    /// Records-per-second throttle.
    RecordsPerSecond = 10,
    /// Partition id array.
    PartitionIds = 11,
    /// Digest array.
    DigestArray = 12,
    /// Maximum records to return.
    MaxRecords = 13,
    /// Secondary index name.
    IndexName = 21,
    /// Secondary index range.
    IndexRange = 22,
    /// Secondary index context.
    IndexContext = 23,
    /// Secondary index collection type.
    IndexType = 26,
    /// UDF package.
    UdfPackage = 30,
    /// UDF function.
    UdfFunction = 31,
    /// UDF argument list.
    UdfArgs = 32,
    /// UDF operation.
    UdfOp = 33,
    /// Bin name list.
    BinList = 40,
    /// Batch index block.
    BatchIndex = 41,
    /// Batch index block with set names.
    BatchIndexWithSet = 42,
    /// Filter expression.
    FilterExp = 43,
}

impl FieldType {
    /// Decode from the wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        use FieldType::*;
        Some(match v {
            0 => Namespace,
            1 => Set,
            2 => Key,
            3 => RecordVersion,
            4 => DigestRipe,
            5 => TxnId,
            6 => TxnDeadline,
            7 => TaskId,
            9 => SocketTimeout,
            10 => RecordsPerSecond,
            11 => PartitionIds,
            12 => DigestArray,
            13 => MaxRecords,
            21 => IndexName,
            22 => IndexRange,
            23 => IndexContext,
            26 => IndexType,
            30 => UdfPackage,
            31 => UdfFunction,
            32 => UdfArgs,
            33 => UdfOp,
            40 => BinList,
            41 => BatchIndex,
            42 => BatchIndexWithSet,
            43 => FilterExp,
            _ => return None,
        })
    }
}

/// Operation type discriminants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationType {
    /// Read a bin.
    Read = 1,
    /// Write a bin.
    Write = 2,
    /// Collection read.
    CdtRead = 3,
    /// Collection modify.
    CdtModify = 4,
    /// Integer/float add.
    Add = 5,
    /// Expression read.
    ExpRead = 7,
    /// Expression modify.
    ExpModify = 8,
    /// String append.
    Append = 9,
    /// String prepend.
    Prepend = 10,
    /// Reset TTL.
    Touch = 11,
    /// Bitwise read.
    BitRead = 12,
    /// Bitwise modify.
    BitModify = 13,
    /// Delete the record.
    Delete = 14,
    /// HyperLogLog read.
    HllRead = 15,
    /// HyperLogLog modify.
    HllModify = 16,
}

impl OperationType {
    /// True for operations that mutate the record.
    pub fn is_write(self) -> bool {
        !matches!(
            self,
            OperationType::Read
                | OperationType::CdtRead
                | OperationType::ExpRead
                | OperationType::BitRead
                | OperationType::HllRead
        )
    }

    /// Lowercase name for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            OperationType::Read => "read",
            OperationType::Write => "write",
            OperationType::CdtRead => "cdt_read",
            OperationType::CdtModify => "cdt_modify",
            OperationType::Add => "add",
            OperationType::ExpRead => "exp_read",
            OperationType::ExpModify => "exp_modify",
            OperationType::Append => "append",
            OperationType::Prepend => "prepend",
            OperationType::Touch => "touch",
            OperationType::BitRead => "bit_read",
            OperationType::BitModify => "bit_modify",
            OperationType::Delete => "delete",
            OperationType::HllRead => "hll_read",
            OperationType::HllModify => "hll_modify",
        }
    }

    /// Decode from the wire byte.
    pub fn from_u8(v: u8) -> Option<Self> {
        use OperationType::*;
        Some(match v {
            1 => Read,
            2 => Write,
            3 => CdtRead,
            4 => CdtModify,
            5 => Add,
            7 => ExpRead,
            8 => ExpModify,
            9 => Append,
            10 => Prepend,
            11 => Touch,
            12 => BitRead,
            13 => BitModify,
            14 => Delete,
            15 => HllRead,
            16 => HllModify,
            _ => return None,
        })
    }
}

/// Server result code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResultCode(pub u8);

impl ResultCode {
    /// Success.
    pub const OK: ResultCode = ResultCode(0);
    /// Generic server error.
    pub const SERVER_ERROR: ResultCode = ResultCode(1);
    /// Record does not exist.
    pub const KEY_NOT_FOUND: ResultCode = ResultCode(2);
    /// Generation check failed.
    pub const GENERATION_ERROR: ResultCode = ResultCode(3);
    /// Bad request parameter.
    pub const PARAMETER_ERROR: ResultCode = ResultCode(4);
    /// Record already exists.
    pub const KEY_EXISTS: ResultCode = ResultCode(5);
    /// Bin already exists.
    pub const BIN_EXISTS: ResultCode = ResultCode(6);
    /// Cluster changed during the request.
    pub const CLUSTER_KEY_MISMATCH: ResultCode = ResultCode(7);
    /// Server out of memory.
    pub const SERVER_MEM_ERROR: ResultCode = ResultCode(8);
    /// Server-side timeout.
    pub const TIMEOUT: ResultCode = ResultCode(9);
    /// Operation forbidden by configuration.
    pub const ALWAYS_FORBIDDEN: ResultCode = ResultCode(10);
    /// Partition not available.
    pub const PARTITION_UNAVAILABLE: ResultCode = ResultCode(11);
    /// Bin type mismatch.
    pub const BIN_TYPE_ERROR: ResultCode = ResultCode(12);
    /// Record too big.
    pub const RECORD_TOO_BIG: ResultCode = ResultCode(13);
    /// Hot key.
    pub const KEY_BUSY: ResultCode = ResultCode(14);
    /// Scan aborted.
    pub const SCAN_ABORT: ResultCode = ResultCode(15);
    /// Feature not supported.
    pub const UNSUPPORTED_FEATURE: ResultCode = ResultCode(16);
    /// Bin not found.
    pub const BIN_NOT_FOUND: ResultCode = ResultCode(17);
    /// Device overloaded.
    pub const DEVICE_OVERLOAD: ResultCode = ResultCode(18);
    /// Key mismatch.
    pub const KEY_MISMATCH: ResultCode = ResultCode(19);
    /// Namespace unknown.
    pub const INVALID_NAMESPACE: ResultCode = ResultCode(20);
    /// Bin name too long (server side).
    pub const BIN_NAME_TOO_LONG: ResultCode = ResultCode(21);
    /// Operation forbidden on this record.
    pub const FAIL_FORBIDDEN: ResultCode = ResultCode(22);
    /// Record filtered out by expression.
    pub const FILTERED_OUT: ResultCode = ResultCode(27);
    /// Lost a transaction conflict.
    pub const LOST_CONFLICT: ResultCode = ResultCode(28);
    /// Transaction verify failed.
    pub const TXN_VERSION_MISMATCH: ResultCode = ResultCode(120);
    /// Query ended.
    pub const QUERY_END: ResultCode = ResultCode(50);
    /// Query aborted.
    pub const QUERY_ABORTED: ResultCode = ResultCode(210);
    /// Query timed out on the server.
    pub const QUERY_TIMEOUT: ResultCode = ResultCode(213);

    /// Raw code.
    pub fn code(self) -> u8 {
        self.0
    }

    /// True for codes a batch records per key instead of failing the command.
    pub fn is_benign_for_batch(self) -> bool {
        self == ResultCode::KEY_NOT_FOUND || self == ResultCode::FILTERED_OUT
    }

    /// Symbolic name, or `"UNKNOWN"`.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "SERVER_ERROR",
            2 => "KEY_NOT_FOUND",
            3 => "GENERATION_ERROR",
            4 => "PARAMETER_ERROR",
            5 => "KEY_EXISTS",
            6 => "BIN_EXISTS",
            7 => "CLUSTER_KEY_MISMATCH",
            8 => "SERVER_MEM_ERROR",
            9 => "TIMEOUT",
            10 => "ALWAYS_FORBIDDEN",
            11 => "PARTITION_UNAVAILABLE",
            12 => "BIN_TYPE_ERROR",
            13 => "RECORD_TOO_BIG",
            14 => "KEY_BUSY",
            15 => "SCAN_ABORT",
            16 => "UNSUPPORTED_FEATURE",
            17 => "BIN_NOT_FOUND",
            18 => "DEVICE_OVERLOAD",
            19 => "KEY_MISMATCH",
            20 => "INVALID_NAMESPACE",
            21 => "BIN_NAME_TOO_LONG",
            22 => "FAIL_FORBIDDEN",
            27 => "FILTERED_OUT",
            28 => "LOST_CONFLICT",
            50 => "QUERY_END",
            120 => "TXN_VERSION_MISMATCH",
            210 => "QUERY_ABORTED",
            213 => "QUERY_TIMEOUT",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.0)
    }
}
