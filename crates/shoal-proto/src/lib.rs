#![warn(missing_docs)]

//! Shoal wire protocol: pooled buffers, two-pass message encoder, batch repeat compression, zlib pass
//!
//! This crate turns logical commands into the exact bytes a Shoal server
//! expects and turns server responses back into records. It does no I/O;
//! the execution engine in `shoal-client` drives it per attempt.

pub mod batch;
pub mod buffer;
pub mod compress;
pub mod encoder;
pub mod error;
pub mod field;
pub mod key;
pub mod message;
pub mod operation;
pub mod protocol;
pub mod reader;
pub mod response;
pub mod value;

pub use batch::{decode_batch_request, BatchAttr, BatchEntry, BatchFlags, BatchMessage, BatchTxn, DecodedBatch, DecodedEntry};
pub use buffer::{BufferPool, BufferPoolConfig, BufferPoolStats, MessageBuffer, PooledBuffer};
pub use compress::{compress_message, decompress_body, decompress_message};
pub use encoder::{encode_into, Encode, Sink, SizeCounter, SliceWriter, VecSink};
pub use error::{ProtoError, Result};
pub use field::{Field, IndexRange, RawField};
pub use key::Key;
pub use message::{CommandHeader, Message};
pub use operation::Operation;
pub use protocol::{FieldType, MessageType, OperationType, ProtoHeader, ResultCode};
pub use response::{single_record_response, RecordHeader, ResponseBuilder, ResponseParser, ResponseRecord};
pub use value::Value;
