//! Response records: parsing on the client side, building on the server side.
//!
//! A response body is a sequence of records, each a 22-byte record header
//! followed by its fields and bins:
//!
//! ```text
//! offset  0  header length (22)
//! offset  1  info1 | 2 info2 | 3 info3 | 4 info4
//! offset  5  result code
//! offset  6  generation (u32)
//! offset 10  expiration (u32)
//! offset 14  batch index (u32)
//! offset 18  field count (u16)
//! offset 20  op count (u16)
//! ```
//!
//! Single-record commands get exactly one record. Streaming commands (batch,
//! scan, query) get any number of messages and stop at a record flagged
//! [`INFO3_LAST`].

use crate::compress::compress_message;
use crate::encoder::{Encode, Sink, VecSink};
use crate::error::{ProtoError, Result};
use crate::field::{Field, RawField};
use crate::operation::{Operation, RawOperation};
use crate::protocol::{
    FieldType, MessageType, OperationType, ProtoHeader, ResultCode, DIGEST_SIZE, INFO3_LAST,
    INFO3_PARTITION_DONE, MSG_REMAINING_HEADER_SIZE, PROTO_HEADER_SIZE,
};
use crate::reader::ByteReader;
use crate::value::Value;

/// Header of one response record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Read flags echoed by the server.
    pub info1: u8,
    /// Write flags.
    pub info2: u8,
    /// Misc flags, including [`INFO3_LAST`].
    pub info3: u8,
    /// Transaction flags.
    pub info4: u8,
    /// Outcome for this record.
    pub result_code: ResultCode,
    /// Record generation; the partition id on partition-done markers.
    pub generation: u32,
    /// Record expiration.
    pub expiration: u32,
    /// Position of the key in the batch request.
    pub batch_index: u32,
    /// Fields that follow.
    pub field_count: u16,
    /// Bins that follow.
    pub op_count: u16,
}

impl RecordHeader {
    /// Encoded size.
    pub const SIZE: usize = MSG_REMAINING_HEADER_SIZE;

    /// Parse from `r`.
    pub fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let header_len = r.u8()?;
        if header_len as usize != Self::SIZE {
            return Err(ProtoError::header(format!(
                "record header length {header_len}"
            )));
        }
        Ok(Self {
            info1: r.u8()?,
            info2: r.u8()?,
            info3: r.u8()?,
            info4: r.u8()?,
            result_code: ResultCode(r.u8()?),
            generation: r.u32()?,
            expiration: r.u32()?,
            batch_index: r.u32()?,
            field_count: r.u16()?,
            op_count: r.u16()?,
        })
    }

    /// End-of-stream marker.
    pub fn is_last(&self) -> bool {
        self.info3 & INFO3_LAST != 0
    }

    /// Scan/query partition completion marker.
    pub fn is_partition_done(&self) -> bool {
        self.info3 & INFO3_PARTITION_DONE != 0
    }

    fn write<S: Sink>(&self, sink: &mut S) {
        sink.put_u8(Self::SIZE as u8);
        sink.put_u8(self.info1);
        sink.put_u8(self.info2);
        sink.put_u8(self.info3);
        sink.put_u8(self.info4);
        sink.put_u8(self.result_code.code());
        sink.put_u32(self.generation);
        sink.put_u32(self.expiration);
        sink.put_u32(self.batch_index);
        sink.put_u16(self.field_count);
        sink.put_u16(self.op_count);
    }
}

/// One record from a response.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRecord {
    /// Record header.
    pub header: RecordHeader,
    /// Digest field.
    pub digest: Option<[u8; DIGEST_SIZE]>,
    /// Namespace field.
    pub namespace: Option<String>,
    /// Set field.
    pub set_name: Option<String>,
    /// User key field.
    pub user_key: Option<Value>,
    /// Record version field (transactions).
    pub version: Option<u64>,
    /// Bins in server order.
    pub bins: Vec<(String, Value)>,
}

impl ResponseRecord {
    /// Record with the given result code and nothing else.
    pub fn new(result_code: ResultCode) -> Self {
        Self {
            header: RecordHeader {
                info1: 0,
                info2: 0,
                info3: 0,
                info4: 0,
                result_code,
                generation: 0,
                expiration: 0,
                batch_index: 0,
                field_count: 0,
                op_count: 0,
            },
            digest: None,
            namespace: None,
            set_name: None,
            user_key: None,
            version: None,
            bins: Vec::new(),
        }
    }

    /// Successful record carrying `bins`.
    pub fn ok(bins: Vec<(String, Value)>) -> Self {
        Self {
            bins,
            ..Self::new(ResultCode::OK)
        }
    }

    /// Result code.
    pub fn result_code(&self) -> ResultCode {
        self.header.result_code
    }

    /// First bin named `name`.
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    fn fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if let Some(d) = self.digest {
            fields.push(Field::Digest(d));
        }
        if let Some(ns) = &self.namespace {
            fields.push(Field::Namespace(ns.clone()));
        }
        if let Some(set) = &self.set_name {
            fields.push(Field::Set(set.clone()));
        }
        if let Some(k) = &self.user_key {
            fields.push(Field::UserKey(k.clone()));
        }
        if let Some(v) = self.version {
            fields.push(Field::RecordVersion(v));
        }
        fields
    }
}

impl Encode for ResponseRecord {
    fn encode<S: Sink>(&self, sink: &mut S) -> Result<()> {
        let fields = self.fields();
        let header = RecordHeader {
            field_count: fields.len() as u16,
            op_count: self.bins.len() as u16,
            ..self.header
        };
        header.write(sink);
        for field in &fields {
            field.encode(sink)?;
        }
        for (name, value) in &self.bins {
            Operation::new(OperationType::Read, name.clone(), value.clone()).encode(sink)?;
        }
        Ok(())
    }
}

/// Iterator over the records of one response body.
#[derive(Debug)]
pub struct ResponseParser<'a> {
    r: ByteReader<'a>,
    failed: bool,
}

impl<'a> ResponseParser<'a> {
    /// Parser over a body (the bytes after the proto header).
    pub fn new(body: &'a [u8]) -> Self {
        Self {
            r: ByteReader::new(body),
            failed: false,
        }
    }

    /// Parser over a complete plain message.
    pub fn from_message(message: &'a [u8]) -> Result<Self> {
        let header = ProtoHeader::decode(message)?;
        if header.msg_type != MessageType::Message {
            return Err(ProtoError::header("response must be decompressed first"));
        }
        let end = PROTO_HEADER_SIZE + header.length;
        if message.len() < end {
            return Err(ProtoError::Truncated {
                needed: end,
                available: message.len(),
            });
        }
        Ok(Self::new(&message[PROTO_HEADER_SIZE..end]))
    }

    /// Read the next record, or `None` at the end of the body.
    pub fn next_record(&mut self) -> Result<Option<ResponseRecord>> {
        if self.r.is_empty() {
            return Ok(None);
        }
        let header = RecordHeader::parse(&mut self.r)?;
        let mut record = ResponseRecord {
            header,
            ..ResponseRecord::new(header.result_code)
        };
        for _ in 0..header.field_count {
            let raw = RawField::read(&mut self.r)?;
            match FieldType::from_u8(raw.field_type) {
                Some(FieldType::DigestRipe) => {
                    if let Field::Digest(d) = raw.to_field()? {
                        record.digest = Some(d);
                    }
                }
                Some(FieldType::Namespace) => record.namespace = Some(raw.as_str()?),
                Some(FieldType::Set) => record.set_name = Some(raw.as_str()?),
                Some(FieldType::Key) => {
                    if let Field::UserKey(k) = raw.to_field()? {
                        record.user_key = Some(k);
                    }
                }
                Some(FieldType::RecordVersion) => record.version = Some(raw.as_record_version()?),
                _ => {}
            }
        }
        record.bins.reserve(header.op_count as usize);
        for _ in 0..header.op_count {
            let op = RawOperation::read(&mut self.r)?;
            record.bins.push((op.bin_name, op.value));
        }
        Ok(Some(record))
    }
}

impl Iterator for ResponseParser<'_> {
    type Item = Result<ResponseRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Builds response messages from records.
#[derive(Debug)]
pub struct ResponseBuilder {
    sink: VecSink,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBuilder {
    /// Empty message.
    pub fn new() -> Self {
        let mut sink = VecSink::new();
        sink.put_u64(0);
        Self { sink }
    }

    /// Append a record.
    pub fn record(&mut self, record: &ResponseRecord) -> Result<&mut Self> {
        record.encode(&mut self.sink)?;
        Ok(self)
    }

    /// Append the end-of-stream marker.
    pub fn last(&mut self, result_code: ResultCode) -> &mut Self {
        let mut marker = ResponseRecord::new(result_code);
        marker.header.info3 = INFO3_LAST;
        marker.header.write(&mut self.sink);
        self
    }

    /// Append a partition-done marker.
    pub fn partition_done(&mut self, partition_id: u16, result_code: ResultCode) -> &mut Self {
        let mut marker = ResponseRecord::new(result_code);
        marker.header.info3 = INFO3_PARTITION_DONE;
        marker.header.generation = u32::from(partition_id);
        marker.header.write(&mut self.sink);
        self
    }

    /// Plain message bytes.
    pub fn finish(self) -> Vec<u8> {
        let mut out = self.sink.into_inner();
        let header = ProtoHeader::new(MessageType::Message, out.len() - PROTO_HEADER_SIZE);
        out[..PROTO_HEADER_SIZE].copy_from_slice(&header.encode());
        out
    }

    /// Type-4 message bytes.
    pub fn finish_compressed(self) -> Result<Vec<u8>> {
        compress_message(&self.finish())
    }
}

/// One-record response message.
pub fn single_record_response(record: &ResponseRecord) -> Result<Vec<u8>> {
    let mut builder = ResponseBuilder::new();
    builder.record(record)?;
    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compress::decompress_message;

    #[test]
    fn test_single_record_roundtrip() {
        let mut record = ResponseRecord::ok(vec![
            ("a".to_string(), Value::Int(1)),
            ("b".to_string(), Value::from("x")),
        ]);
        record.header.generation = 4;
        record.header.expiration = 100;
        let bytes = single_record_response(&record).unwrap();

        let mut parser = ResponseParser::from_message(&bytes).unwrap();
        let parsed = parser.next_record().unwrap().unwrap();
        assert_eq!(parsed.result_code(), ResultCode::OK);
        assert_eq!(parsed.header.generation, 4);
        assert_eq!(parsed.header.op_count, 2);
        assert_eq!(parsed.bin("b"), Some(&Value::from("x")));
        assert!(parser.next_record().unwrap().is_none());
    }

    #[test]
    fn test_header_offsets() {
        let mut record = ResponseRecord::new(ResultCode::KEY_NOT_FOUND);
        record.header.batch_index = 0x0102_0304;
        let bytes = single_record_response(&record).unwrap();
        let body = &bytes[PROTO_HEADER_SIZE..];
        assert_eq!(body[0], 22);
        assert_eq!(body[5], ResultCode::KEY_NOT_FOUND.code());
        assert_eq!(&body[14..18], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_stream_with_markers() {
        let mut a = ResponseRecord::ok(vec![("n".into(), Value::Int(1))]);
        a.digest = Some([7; DIGEST_SIZE]);
        a.namespace = Some("test".into());
        a.version = Some(55);
        let mut builder = ResponseBuilder::new();
        builder.record(&a).unwrap();
        builder.partition_done(12, ResultCode::OK);
        builder.last(ResultCode::OK);
        let bytes = builder.finish();

        let records: Vec<_> = ResponseParser::from_message(&bytes)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].digest, Some([7; DIGEST_SIZE]));
        assert_eq!(records[0].version, Some(55));
        assert!(records[1].header.is_partition_done());
        assert_eq!(records[1].header.generation, 12);
        assert!(records[2].header.is_last());
    }

    #[test]
    fn test_compressed_response() {
        let record = ResponseRecord::ok(vec![("blob".into(), Value::from(vec![0u8; 4096]))]);
        let mut builder = ResponseBuilder::new();
        builder.record(&record).unwrap();
        let wire = builder.finish_compressed().unwrap();
        let plain = decompress_message(&wire).unwrap();
        let parsed = ResponseParser::from_message(&plain)
            .unwrap()
            .next_record()
            .unwrap()
            .unwrap();
        assert_eq!(parsed, ResponseRecord {
            header: RecordHeader {
                op_count: 1,
                ..record.header
            },
            ..record
        });
    }

    #[test]
    fn test_truncated_body_stops_iteration() {
        let record = ResponseRecord::ok(vec![("a".into(), Value::Int(1))]);
        let bytes = single_record_response(&record).unwrap();
        let body = &bytes[PROTO_HEADER_SIZE..bytes.len() - 3];
        let mut parser = ResponseParser::new(body);
        assert!(matches!(parser.next(), Some(Err(ProtoError::Truncated { .. }))));
        assert!(parser.next().is_none());
    }
}
