//! Property-based tests for shoal-proto using proptest.
//!
//! These cover the encoder's sizing invariant, batch repeat-compression
//! losslessness and the compression threshold.

use bytes::Bytes;
use proptest::prelude::*;
use shoal_proto::{
    compress::decompress_message,
    decode_batch_request, encode_into,
    protocol::{INFO2_WRITE, MAX_MESSAGE_SIZE, PROTO_HEADER_SIZE},
    BatchAttr, BatchEntry, BatchMessage, BufferPool, CommandHeader, Encode, Field, Key, Message,
    MessageBuffer, MessageType, Operation, ProtoError, ProtoHeader, Value,
};

fn any_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Nil),
        any::<i64>().prop_map(Value::Int),
        any::<bool>().prop_map(Value::Bool),
        "[a-z]{0,40}".prop_map(Value::String),
        proptest::collection::vec(any::<u8>(), 0..300).prop_map(Value::from),
    ]
}

fn any_bin_name() -> impl Strategy<Value = String> {
    "[a-z]{0,15}"
}

fn any_op() -> impl Strategy<Value = Operation> {
    prop_oneof![
        any_bin_name().prop_map(Operation::get),
        (any_bin_name(), any_value()).prop_map(|(n, v)| Operation::put(n, v)),
        (any_bin_name(), any::<i64>()).prop_map(|(n, v)| Operation::add(n, v)),
        Just(Operation::touch()),
    ]
}

fn any_field() -> impl Strategy<Value = Field> {
    prop_oneof![
        "[a-z]{1,31}".prop_map(Field::Namespace),
        "[a-z]{0,63}".prop_map(Field::Set),
        any::<[u8; 20]>().prop_map(Field::Digest),
        any::<i64>().prop_map(|k| Field::UserKey(Value::Int(k))),
        proptest::collection::vec(any::<u8>(), 0..200)
            .prop_map(|b| Field::FilterExp(Bytes::from(b))),
        (0u64..(1 << 56)).prop_map(Field::RecordVersion),
        any::<u64>().prop_map(Field::TxnId),
        any::<u32>().prop_map(Field::TxnDeadline),
        proptest::collection::vec(0u16..4096, 0..64).prop_map(Field::PartitionIds),
    ]
}

fn any_message() -> impl Strategy<Value = Message> {
    (
        any::<u8>(),
        any::<u8>(),
        any::<u32>(),
        proptest::collection::vec(any_field(), 0..8),
        proptest::collection::vec(any_op(), 0..12),
    )
        .prop_map(|(info1, info2, generation, fields, ops)| Message {
            header: CommandHeader {
                info1,
                info2,
                generation,
                ..Default::default()
            },
            fields,
            ops,
        })
}

fn read_entry(index: u32, ns: &str, set: &str) -> BatchEntry {
    let key = Key::new(ns, set, index as i64).unwrap();
    BatchEntry::new(index, key, BatchAttr::read_all())
}

proptest! {
    /// The write pass always fills exactly the estimated size and the proto
    /// header declares everything after itself.
    #[test]
    fn test_message_write_matches_estimate(msg in any_message()) {
        let estimated = msg.encoded_size().unwrap();
        let mut buf = MessageBuffer::new(BufferPool::with_defaults());
        let written = encode_into(&msg, &mut buf, false).unwrap();
        prop_assert_eq!(written, estimated);
        prop_assert_eq!(buf.wire().len(), estimated);
        let header = ProtoHeader::decode(buf.wire()).unwrap();
        prop_assert_eq!(header.length, estimated - PROTO_HEADER_SIZE);
        prop_assert_eq!(Message::decode(buf.wire()).unwrap(), msg);
    }

    /// Repeat-compressed batches decode to the same per-key routing and
    /// attributes as a batch with no repeats at all.
    #[test]
    fn test_batch_repeat_lossless(
        shapes in proptest::collection::vec((0usize..2, 0usize..3, any::<bool>()), 1..60)
    ) {
        let namespaces = ["test", "bar"];
        let sets = ["a", "b", ""];
        let entries: Vec<BatchEntry> = shapes
            .iter()
            .enumerate()
            .map(|(i, (ns, set, header_only))| {
                let mut entry = read_entry(i as u32, namespaces[*ns], sets[*set]);
                if *header_only {
                    entry.attr = BatchAttr::read_header();
                }
                entry
            })
            .collect();

        let compressed = BatchMessage::new(entries.iter().collect());
        let mut buf = MessageBuffer::new(BufferPool::with_defaults());
        encode_into(&compressed, &mut buf, false).unwrap();
        let decoded = decode_batch_request(buf.wire()).unwrap();

        // Reference: one message per entry, so nothing can repeat.
        for (entry, got) in entries.iter().zip(&decoded.entries) {
            let single = BatchMessage::new(vec![entry]);
            let mut buf = MessageBuffer::new(BufferPool::with_defaults());
            encode_into(&single, &mut buf, false).unwrap();
            let reference = decode_batch_request(buf.wire()).unwrap();
            let want = &reference.entries[0];
            prop_assert_eq!(got.index, want.index);
            prop_assert_eq!(got.digest, want.digest);
            prop_assert_eq!(&got.namespace, &want.namespace);
            prop_assert_eq!(&got.set_name, &want.set_name);
            prop_assert_eq!(got.attr, want.attr);
            prop_assert_eq!(&got.ops, &want.ops);
        }
        prop_assert_eq!(decoded.entries.len(), entries.len());
    }

    /// Any compressible message above the threshold inflates back to itself.
    #[test]
    fn test_compression_exact_inflate(fill in any::<u8>(), len in 129usize..20_000) {
        let msg = Message::new(CommandHeader::default())
            .field(Field::FilterExp(Bytes::from(vec![fill; len])));
        let mut buf = MessageBuffer::new(BufferPool::with_defaults());
        encode_into(&msg, &mut buf, true).unwrap();
        let original = buf.message().to_vec();
        prop_assert!(buf.compress().unwrap());
        prop_assert_eq!(decompress_message(buf.wire()).unwrap(), original);
    }
}

#[test]
fn test_alternating_pairs_roundtrip() {
    let entries: Vec<BatchEntry> = (0..20)
        .map(|i| {
            if i % 2 == 0 {
                read_entry(i, "test", "a")
            } else {
                read_entry(i, "bar", "b")
            }
        })
        .collect();
    let msg = BatchMessage::new(entries.iter().collect());
    assert_eq!(msg.repeat_count(), 0);

    let mut buf = MessageBuffer::new(BufferPool::with_defaults());
    encode_into(&msg, &mut buf, false).unwrap();
    let decoded = decode_batch_request(buf.wire()).unwrap();
    for (e, d) in entries.iter().zip(&decoded.entries) {
        assert_eq!(d.namespace, e.key.namespace);
        assert_eq!(d.set_name, e.key.set_name);
    }
}

#[test]
fn test_bin_name_boundary_before_mutation() {
    let pool = BufferPool::with_defaults();
    let mut buf = MessageBuffer::new(pool.clone());

    let ok = Message::new(CommandHeader::default()).op(Operation::put("a".repeat(15), 1i64));
    assert!(encode_into(&ok, &mut buf, false).is_ok());
    let before = buf.wire().to_vec();

    let bad = Message::new(CommandHeader::default()).op(Operation::put("a".repeat(16), 1i64));
    assert!(matches!(
        encode_into(&bad, &mut buf, false),
        Err(ProtoError::BinNameTooLong { len: 16, .. })
    ));
    assert_eq!(buf.wire(), &before[..]);
}

#[test]
fn test_compression_threshold() {
    // 30 header + 5 field header = 35 bytes of overhead
    let sized = |total: usize| {
        Message::new(CommandHeader::default()).field(Field::FilterExp(Bytes::from(vec![0u8; total - 35])))
    };

    let mut buf = MessageBuffer::new(BufferPool::with_defaults());
    assert_eq!(encode_into(&sized(127), &mut buf, true).unwrap(), 127);
    assert!(!buf.compress().unwrap());
    assert_eq!(buf.wire()[1], MessageType::Message as u8);

    let mut buf = MessageBuffer::new(BufferPool::with_defaults());
    assert_eq!(encode_into(&sized(129), &mut buf, true).unwrap(), 129);
    let original = buf.message().to_vec();
    assert!(buf.compress().unwrap());
    let header = ProtoHeader::decode(buf.wire()).unwrap();
    assert_eq!(header.msg_type, MessageType::Compressed);
    assert_eq!(&buf.wire()[8..16], &129u64.to_be_bytes());
    assert_eq!(decompress_message(buf.wire()).unwrap(), original);
}

#[test]
fn test_oversized_message_rejected() {
    let msg = Message::new(CommandHeader {
        info2: INFO2_WRITE,
        ..Default::default()
    })
    .op(Operation::put("big", vec![0u8; MAX_MESSAGE_SIZE]));
    let mut buf = MessageBuffer::new(BufferPool::with_defaults());
    assert!(matches!(
        encode_into(&msg, &mut buf, false),
        Err(ProtoError::MessageTooLarge { .. })
    ));
}
