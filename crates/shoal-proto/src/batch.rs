//! Multi-key batch requests with repeat compression.
//!
//! A batch message has a normal command header, an optional filter field and
//! one `BatchIndex` field holding every entry:
//!
//! ```text
//! [count: u32][flags: u8]
//! per entry: [index: u32][digest: 20]
//!            then either [REPEAT]
//!            or [entry flags][info1][info2][info3][info4?][gen: u16?][ttl: u32?]
//!               [field count: u16][op count: u16] fields.. ops..
//! ```
//!
//! An entry that matches the last fully written entry is sent as the single
//! repeat byte. Matching is structural equality on everything the full form
//! would carry apart from the digest, so a merge is never wrong; it may be
//! missed when callers do not group similar keys together. Entries are never
//! reordered because the server answers by index.

use bytes::Bytes;

use crate::encoder::{Encode, Sink};
use crate::error::{ProtoError, Result};
use crate::field::{Field, RawField};
use crate::key::Key;
use crate::message::CommandHeader;
use crate::operation::{Operation, RawOperation};
use crate::protocol::*;
use crate::reader::ByteReader;
use crate::value::Value;

/// Per-batch flags byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchFlags {
    /// Let the server answer in-memory records inline.
    pub allow_inline: bool,
    /// Let the server answer SSD records inline.
    pub allow_inline_ssd: bool,
    /// Return a result for every key, found or not.
    pub respond_all_keys: bool,
}

impl BatchFlags {
    /// Wire byte.
    pub fn bits(&self) -> u8 {
        let mut flags = 0;
        if self.allow_inline {
            flags |= 0x01;
        }
        if self.allow_inline_ssd {
            flags |= 0x02;
        }
        if self.respond_all_keys {
            flags |= 0x04;
        }
        flags
    }

    /// Parse the wire byte.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            allow_inline: bits & 0x01 != 0,
            allow_inline_ssd: bits & 0x02 != 0,
            respond_all_keys: bits & 0x04 != 0,
        }
    }
}

/// Attributes a batch entry resolves to from its policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchAttr {
    /// Read flags.
    pub info1: u8,
    /// Write flags.
    pub info2: u8,
    /// Misc flags.
    pub info3: u8,
    /// Transaction flags.
    pub info4: u8,
    /// Expected generation (sent as 16 bits).
    pub generation: u16,
    /// Expiration.
    pub expiration: u32,
    /// Entry may carry write operations.
    pub has_write: bool,
    /// Send the user key along with the digest.
    pub send_key: bool,
}

impl BatchAttr {
    /// Read every bin.
    pub fn read_all() -> Self {
        Self {
            info1: INFO1_READ | INFO1_GET_ALL,
            ..Default::default()
        }
    }

    /// Read the bins named by the entry's operations.
    pub fn read_bins() -> Self {
        Self {
            info1: INFO1_READ,
            ..Default::default()
        }
    }

    /// Read metadata only.
    pub fn read_header() -> Self {
        Self {
            info1: INFO1_READ | INFO1_NOBINDATA,
            ..Default::default()
        }
    }

    /// Apply the entry's write operations.
    pub fn write(generation: Option<u16>, expiration: u32) -> Self {
        let mut info2 = INFO2_WRITE | INFO2_RESPOND_ALL_OPS;
        if generation.is_some() {
            info2 |= INFO2_GENERATION;
        }
        Self {
            info2,
            generation: generation.unwrap_or(0),
            expiration,
            has_write: true,
            ..Default::default()
        }
    }

    /// Delete the record.
    pub fn delete() -> Self {
        Self {
            info2: INFO2_WRITE | INFO2_RESPOND_ALL_OPS | INFO2_DELETE,
            has_write: true,
            ..Default::default()
        }
    }

    /// Verify a transaction read still holds.
    pub fn txn_verify() -> Self {
        Self {
            info1: INFO1_READ | INFO1_NOBINDATA,
            info3: INFO3_SC_READ_TYPE,
            info4: INFO4_TXN_VERIFY_READ,
            ..Default::default()
        }
    }

    /// Roll a transaction's write forward or back.
    pub fn txn_roll(forward: bool) -> Self {
        Self {
            info2: INFO2_WRITE | INFO2_DURABLE_DELETE,
            info4: if forward {
                INFO4_TXN_ROLL_FORWARD
            } else {
                INFO4_TXN_ROLL_BACK
            },
            has_write: true,
            ..Default::default()
        }
    }

    /// Set `send_key`.
    pub fn with_send_key(mut self, send_key: bool) -> Self {
        self.send_key = send_key;
        self
    }
}

/// One key in a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchEntry {
    /// Position in the caller's key list; the server echoes it back.
    pub index: u32,
    /// Record key.
    pub key: Key,
    /// Resolved attributes.
    pub attr: BatchAttr,
    /// Operations.
    pub ops: Vec<Operation>,
    /// Entry-level filter expression.
    pub filter: Option<Bytes>,
    /// Expected record version (transactions).
    pub version: Option<u64>,
}

impl BatchEntry {
    /// Entry with no operations, filter or version.
    pub fn new(index: u32, key: Key, attr: BatchAttr) -> Self {
        Self {
            index,
            key,
            attr,
            ops: Vec::new(),
            filter: None,
            version: None,
        }
    }

    /// Attach operations.
    pub fn with_ops(mut self, ops: Vec<Operation>) -> Self {
        self.ops = ops;
        self
    }

    /// Whether this entry may be sent as a repeat of `prev`.
    pub fn can_repeat(&self, prev: &BatchEntry) -> bool {
        !self.attr.send_key
            && self.key.namespace == prev.key.namespace
            && self.key.set_name == prev.key.set_name
            && self.version == prev.version
            && self.attr == prev.attr
            && self.filter == prev.filter
            && self.ops == prev.ops
    }

    fn user_key(&self) -> Option<&Value> {
        if self.attr.send_key {
            self.key.user_key.as_ref()
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.attr.has_write {
            if let Some(op) = self.ops.iter().find(|op| op.is_write()) {
                return Err(ProtoError::WriteInReadContext {
                    op: op.op_type.name(),
                });
            }
        }
        Ok(())
    }

    fn write_full<S: Sink>(&self, sink: &mut S, txn: Option<&BatchTxn>) -> Result<()> {
        let attr = &self.attr;
        let has_info4 = txn.is_some() || attr.info4 != 0;

        let mut flags = BATCH_MSG_INFO | BATCH_MSG_TTL;
        if has_info4 {
            flags |= BATCH_MSG_INFO4;
        }
        if attr.has_write {
            flags |= BATCH_MSG_GEN;
        }
        sink.put_u8(flags);
        sink.put_u8(attr.info1);
        sink.put_u8(attr.info2);
        sink.put_u8(attr.info3);
        if has_info4 {
            sink.put_u8(attr.info4);
        }
        if attr.has_write {
            sink.put_u16(attr.generation);
        }
        sink.put_u32(attr.expiration);

        let mut fields = vec![
            Field::Namespace(self.key.namespace.clone()),
            Field::Set(self.key.set_name.clone()),
        ];
        if let Some(txn) = txn {
            fields.push(Field::TxnId(txn.id));
        }
        if let Some(version) = self.version {
            fields.push(Field::RecordVersion(version));
        }
        if let Some(txn) = txn {
            if attr.has_write && txn.deadline != 0 {
                fields.push(Field::TxnDeadline(txn.deadline));
            }
        }
        if let Some(filter) = &self.filter {
            fields.push(Field::FilterExp(filter.clone()));
        }
        if let Some(user_key) = self.user_key() {
            fields.push(Field::UserKey(user_key.clone()));
        }

        sink.put_u16(fields.len() as u16);
        sink.put_u16(self.ops.len() as u16);
        for field in &fields {
            field.encode(sink)?;
        }
        for op in &self.ops {
            op.encode(sink)?;
        }
        Ok(())
    }
}

/// Transaction context shared by every entry of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchTxn {
    /// Transaction id.
    pub id: u64,
    /// Server-assigned deadline, 0 until the first write.
    pub deadline: u32,
}

/// A batch request for one node.
#[derive(Debug, Clone)]
pub struct BatchMessage<'a> {
    /// Extra info1 bits for the outer header (e.g. compress-response).
    pub info1: u8,
    /// Per-batch flags.
    pub flags: BatchFlags,
    /// Batch-wide filter expression.
    pub filter: Option<Bytes>,
    /// Transaction, if the batch runs inside one.
    pub txn: Option<BatchTxn>,
    /// Entries in send order.
    pub entries: Vec<&'a BatchEntry>,
}

impl<'a> BatchMessage<'a> {
    /// Batch over `entries` with default flags.
    pub fn new(entries: Vec<&'a BatchEntry>) -> Self {
        Self {
            info1: 0,
            flags: BatchFlags::default(),
            filter: None,
            txn: None,
            entries,
        }
    }

    /// Number of entries that will go out as repeats.
    pub fn repeat_count(&self) -> usize {
        let mut last_full: Option<&BatchEntry> = None;
        let mut repeats = 0;
        for entry in &self.entries {
            match last_full {
                Some(prev) if entry.can_repeat(prev) => repeats += 1,
                _ => last_full = Some(entry),
            }
        }
        repeats
    }
}

impl Encode for BatchMessage<'_> {
    fn encode<S: Sink>(&self, sink: &mut S) -> Result<()> {
        let header = CommandHeader {
            info1: INFO1_BATCH | self.info1,
            ..Default::default()
        };
        let field_count = 1 + usize::from(self.filter.is_some());
        header.write(sink, field_count, 0)?;

        if let Some(filter) = &self.filter {
            Field::FilterExp(filter.clone()).encode(sink)?;
        }

        let size_at = sink.offset();
        sink.put_u32(0);
        sink.put_u8(FieldType::BatchIndex as u8);
        sink.put_u32(self.entries.len() as u32);
        sink.put_u8(self.flags.bits());

        let mut last_full: Option<&BatchEntry> = None;
        for entry in &self.entries {
            entry.validate()?;
            sink.put_u32(entry.index);
            sink.put_bytes(&entry.key.digest);
            match last_full {
                Some(prev) if entry.can_repeat(prev) => sink.put_u8(BATCH_MSG_REPEAT),
                _ => {
                    entry.write_full(sink, self.txn.as_ref())?;
                    last_full = Some(entry);
                }
            }
        }

        let field_len = sink.offset() - size_at - 4;
        sink.patch_u32(size_at, field_len as u32);
        Ok(())
    }
}

/// One entry reconstructed from a batch request.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEntry {
    /// Index as sent.
    pub index: u32,
    /// Digest as sent.
    pub digest: [u8; DIGEST_SIZE],
    /// True if the entry was sent as a repeat.
    pub repeated: bool,
    /// Namespace.
    pub namespace: String,
    /// Set name.
    pub set_name: String,
    /// Attributes; `send_key` is true when a user key was present.
    pub attr: BatchAttr,
    /// Transaction id field.
    pub txn_id: Option<u64>,
    /// Record version field.
    pub version: Option<u64>,
    /// Transaction deadline field.
    pub txn_deadline: Option<u32>,
    /// Entry-level filter.
    pub filter: Option<Bytes>,
    /// User key field.
    pub user_key: Option<Value>,
    /// Operations.
    pub ops: Vec<Operation>,
}

/// A batch request reconstructed from the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBatch {
    /// Outer command header.
    pub header: CommandHeader,
    /// Per-batch flags.
    pub flags: BatchFlags,
    /// Batch-wide filter.
    pub filter: Option<Bytes>,
    /// Entries in wire order, repeats resolved.
    pub entries: Vec<DecodedEntry>,
}

/// Decode a plain batch request, resolving repeats against the last full entry.
pub fn decode_batch_request(bytes: &[u8]) -> Result<DecodedBatch> {
    let proto = ProtoHeader::decode(bytes)?;
    let end = PROTO_HEADER_SIZE + proto.length;
    if proto.msg_type != MessageType::Message {
        return Err(ProtoError::header("batch request must be uncompressed"));
    }
    if bytes.len() < end {
        return Err(ProtoError::Truncated {
            needed: end,
            available: bytes.len(),
        });
    }
    let mut r = ByteReader::new(&bytes[PROTO_HEADER_SIZE..end]);
    let (header, field_count, _) = CommandHeader::read(&mut r)?;
    if header.info1 & INFO1_BATCH == 0 {
        return Err(ProtoError::header("batch bit not set"));
    }

    let mut filter = None;
    let mut index_field = None;
    for _ in 0..field_count {
        let raw = RawField::read(&mut r)?;
        if raw.field_type == FieldType::FilterExp as u8 {
            filter = Some(Bytes::copy_from_slice(raw.payload));
        } else if raw.field_type == FieldType::BatchIndex as u8 {
            index_field = Some(raw.payload);
        }
    }
    let payload = index_field.ok_or_else(|| ProtoError::header("missing batch index field"))?;

    let mut r = ByteReader::new(payload);
    let count = r.u32()?;
    let flags = BatchFlags::from_bits(r.u8()?);
    // Every entry takes at least an index, a digest and a flags byte.
    let fits = r.remaining() / (4 + DIGEST_SIZE + 1);
    let mut entries: Vec<DecodedEntry> = Vec::with_capacity((count as usize).min(fits));
    let mut last_full: Option<DecodedEntry> = None;

    for _ in 0..count {
        let index = r.u32()?;
        let mut digest = [0u8; DIGEST_SIZE];
        digest.copy_from_slice(r.bytes(DIGEST_SIZE)?);
        let entry_flags = r.u8()?;

        let entry = if entry_flags & BATCH_MSG_REPEAT != 0 {
            let prev = last_full
                .as_ref()
                .ok_or_else(|| ProtoError::header("repeat without a previous entry"))?;
            DecodedEntry {
                index,
                digest,
                repeated: true,
                ..prev.clone()
            }
        } else {
            let full = decode_full_entry(&mut r, index, digest, entry_flags)?;
            last_full = Some(full.clone());
            full
        };
        entries.push(entry);
    }
    if !r.is_empty() {
        return Err(ProtoError::header("trailing bytes in batch index field"));
    }

    Ok(DecodedBatch {
        header,
        flags,
        filter,
        entries,
    })
}

fn decode_full_entry(
    r: &mut ByteReader<'_>,
    index: u32,
    digest: [u8; DIGEST_SIZE],
    flags: u8,
) -> Result<DecodedEntry> {
    let mut attr = BatchAttr::default();
    if flags & BATCH_MSG_INFO != 0 {
        attr.info1 = r.u8()?;
        attr.info2 = r.u8()?;
        attr.info3 = r.u8()?;
    }
    if flags & BATCH_MSG_INFO4 != 0 {
        attr.info4 = r.u8()?;
    }
    if flags & BATCH_MSG_GEN != 0 {
        attr.generation = r.u16()?;
        attr.has_write = true;
    }
    if flags & BATCH_MSG_TTL != 0 {
        attr.expiration = r.u32()?;
    }
    let field_count = r.u16()?;
    let op_count = r.u16()?;

    let mut entry = DecodedEntry {
        index,
        digest,
        repeated: false,
        namespace: String::new(),
        set_name: String::new(),
        attr,
        txn_id: None,
        version: None,
        txn_deadline: None,
        filter: None,
        user_key: None,
        ops: Vec::with_capacity((op_count as usize).min(r.remaining() / OPERATION_HEADER_SIZE)),
    };
    for _ in 0..field_count {
        match RawField::read(r)?.to_field()? {
            Field::Namespace(ns) => entry.namespace = ns,
            Field::Set(set) => entry.set_name = set,
            Field::TxnId(id) => entry.txn_id = Some(id),
            Field::RecordVersion(v) => entry.version = Some(v),
            Field::TxnDeadline(d) => entry.txn_deadline = Some(d),
            Field::FilterExp(f) => entry.filter = Some(f),
            Field::UserKey(k) => {
                entry.user_key = Some(k);
                entry.attr.send_key = true;
            }
            other => {
                return Err(ProtoError::header(format!(
                    "unexpected field {:?} in batch entry",
                    other.field_type()
                )))
            }
        }
    }
    for _ in 0..op_count {
        entry.ops.push(RawOperation::read(r)?.into_operation()?);
    }
    Ok(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferPool, MessageBuffer};
    use crate::encoder::{encode_into, SliceWriter};

    fn key(ns: &str, set: &str, i: i64) -> Key {
        Key::new(ns, set, i).unwrap()
    }

    fn encode(msg: &BatchMessage<'_>) -> Vec<u8> {
        let mut buf = MessageBuffer::new(BufferPool::with_defaults());
        encode_into(msg, &mut buf, false).unwrap();
        buf.wire().to_vec()
    }

    #[test]
    fn test_same_shape_entries_repeat() {
        let entries: Vec<_> = (0..4)
            .map(|i| BatchEntry::new(i, key("test", "demo", i as i64), BatchAttr::read_all()))
            .collect();
        let msg = BatchMessage::new(entries.iter().collect());
        assert_eq!(msg.repeat_count(), 3);

        // header 30 + index field header 5 + count 4 + flags 1
        // first entry: 24 + flags/info 4 + ttl 4 + counts 4 + ns 9 + set 9 = 54
        // repeats: 24 + 1 each
        assert_eq!(msg.encoded_size().unwrap(), 30 + 5 + 5 + 54 + 3 * 25);

        let decoded = decode_batch_request(&encode(&msg)).unwrap();
        assert_eq!(decoded.entries.len(), 4);
        assert!(!decoded.entries[0].repeated);
        assert!(decoded.entries[1..].iter().all(|e| e.repeated));
        for (d, e) in decoded.entries.iter().zip(&entries) {
            assert_eq!(d.index, e.index);
            assert_eq!(d.digest, e.key.digest);
            assert_eq!(d.namespace, "test");
            assert_eq!(d.set_name, "demo");
            assert_eq!(d.attr, e.attr);
        }
    }

    #[test]
    fn test_alternating_sets_never_repeat() {
        let entries: Vec<_> = (0..6)
            .map(|i| {
                let set = if i % 2 == 0 { "a" } else { "b" };
                BatchEntry::new(i, key("test", set, i as i64), BatchAttr::read_all())
            })
            .collect();
        let msg = BatchMessage::new(entries.iter().collect());
        assert_eq!(msg.repeat_count(), 0);
        let decoded = decode_batch_request(&encode(&msg)).unwrap();
        for (d, e) in decoded.entries.iter().zip(&entries) {
            assert_eq!(d.set_name, e.key.set_name);
            assert!(!d.repeated);
        }
    }

    #[test]
    fn test_repeat_chains_off_last_full_entry() {
        let a = BatchEntry::new(0, key("test", "a", 0), BatchAttr::read_all());
        let b = BatchEntry::new(1, key("test", "a", 1), BatchAttr::read_all());
        let c = BatchEntry::new(2, key("test", "b", 2), BatchAttr::read_all());
        let d = BatchEntry::new(3, key("test", "b", 3), BatchAttr::read_all());
        let msg = BatchMessage::new(vec![&a, &b, &c, &d]);
        let decoded = decode_batch_request(&encode(&msg)).unwrap();
        let repeated: Vec<bool> = decoded.entries.iter().map(|e| e.repeated).collect();
        assert_eq!(repeated, vec![false, true, false, true]);
        assert_eq!(decoded.entries[3].set_name, "b");
    }

    #[test]
    fn test_versions_block_repeat() {
        let mut a = BatchEntry::new(0, key("test", "demo", 0), BatchAttr::txn_verify());
        let mut b = BatchEntry::new(1, key("test", "demo", 1), BatchAttr::txn_verify());
        a.version = Some(10);
        b.version = Some(11);
        assert!(!b.can_repeat(&a));
        b.version = Some(10);
        assert!(b.can_repeat(&a));
    }

    #[test]
    fn test_send_key_blocks_repeat() {
        let attr = BatchAttr::read_all().with_send_key(true);
        let a = BatchEntry::new(0, key("test", "demo", 0), attr);
        let b = BatchEntry::new(1, key("test", "demo", 1), attr);
        assert!(!b.can_repeat(&a));

        let msg = BatchMessage::new(vec![&a, &b]);
        let decoded = decode_batch_request(&encode(&msg)).unwrap();
        assert_eq!(decoded.entries[1].user_key, Some(Value::Int(1)));
    }

    #[test]
    fn test_write_in_read_entry_rejected() {
        let entry = BatchEntry::new(0, key("test", "demo", 0), BatchAttr::read_bins())
            .with_ops(vec![Operation::put("a", 1i64)]);
        let msg = BatchMessage::new(vec![&entry]);
        assert!(matches!(
            msg.encoded_size(),
            Err(ProtoError::WriteInReadContext { op: "write" })
        ));
    }

    #[test]
    fn test_write_entry_layout() {
        let entry = BatchEntry::new(7, key("test", "demo", 1), BatchAttr::write(Some(3), 60))
            .with_ops(vec![Operation::put("a", 1i64)]);
        let msg = BatchMessage {
            txn: Some(BatchTxn {
                id: 99,
                deadline: 5,
            }),
            ..BatchMessage::new(vec![&entry])
        };
        let decoded = decode_batch_request(&encode(&msg)).unwrap();
        let d = &decoded.entries[0];
        assert_eq!(d.index, 7);
        assert!(d.attr.has_write);
        assert_eq!(d.attr.generation, 3);
        assert_eq!(d.attr.expiration, 60);
        assert_eq!(d.txn_id, Some(99));
        assert_eq!(d.txn_deadline, Some(5));
        assert_eq!(d.ops, entry.ops);
    }

    #[test]
    fn test_oversized_count_is_truncated() {
        let entries = [BatchEntry::new(0, key("test", "demo", 1), BatchAttr::read_all())];
        let mut wire = encode(&BatchMessage::new(entries.iter().collect()));
        // count follows the header and the index field header
        let at = MSG_TOTAL_HEADER_SIZE + 5;
        wire[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            decode_batch_request(&wire),
            Err(ProtoError::Truncated { .. })
        ));
    }

    #[test]
    fn test_oversized_op_count_is_truncated() {
        let entries = [BatchEntry::new(0, key("test", "demo", 1), BatchAttr::read_all())];
        let mut wire = encode(&BatchMessage::new(entries.iter().collect()));
        // index field header 5, count 4, flags 1, index 4, digest 20,
        // entry flags 1, info 3, ttl 4, field count 2
        let at = MSG_TOTAL_HEADER_SIZE + 5 + 5 + 4 + DIGEST_SIZE + 1 + 3 + 4 + 2;
        wire[at..at + 2].copy_from_slice(&u16::MAX.to_be_bytes());

        assert!(decode_batch_request(&wire).is_err());
    }

    #[test]
    fn test_field_size_patched() {
        let entries: Vec<_> = (0..3)
            .map(|i| BatchEntry::new(i, key("test", "demo", i as i64), BatchAttr::read_header()))
            .collect();
        let msg = BatchMessage {
            filter: Some(Bytes::from_static(&[1, 2, 3])),
            ..BatchMessage::new(entries.iter().collect())
        };
        let size = msg.encoded_size().unwrap();
        let mut raw = vec![0u8; size];
        let mut writer = SliceWriter::new(&mut raw);
        msg.encode(&mut writer).unwrap();
        writer.finish(size).unwrap();

        // outer filter field is 5 + 3 bytes
        let at = MSG_TOTAL_HEADER_SIZE + 8;
        let declared = u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        assert_eq!(declared as usize, size - at - 4);
        assert_eq!(raw[at + 4], FieldType::BatchIndex as u8);
    }
}
