//! Two-pass message encoding.
//!
//! Encodable structures implement a single [`Encode::encode`] that drives a
//! [`Sink`]. Running it against a [`SizeCounter`] is the estimate pass;
//! running it against a [`SliceWriter`] over an exactly-sized buffer is the
//! write pass. Because both passes walk the same code, they cannot drift, and
//! [`encode_into`] still refuses to finish if the byte counts disagree.

use crate::buffer::MessageBuffer;
use crate::error::{ProtoError, Result};
use crate::protocol::{MessageType, ProtoHeader, MAX_MESSAGE_SIZE, PROTO_HEADER_SIZE};

/// Byte sink shared by the estimate and write passes.
pub trait Sink {
    /// Bytes produced so far.
    fn offset(&self) -> usize;

    /// Append raw bytes.
    fn put_bytes(&mut self, bytes: &[u8]);

    /// Overwrite four bytes at an earlier offset (big-endian).
    fn patch_u32(&mut self, at: usize, value: u32);

    /// Append one byte.
    fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    /// Append a big-endian `u16`.
    fn put_u16(&mut self, value: u16) {
        self.put_bytes(&value.to_be_bytes());
    }

    /// Append a big-endian `u32`.
    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    /// Append a big-endian `u64`.
    fn put_u64(&mut self, value: u64) {
        self.put_bytes(&value.to_be_bytes());
    }
}

/// Estimate pass: counts bytes, writes nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct SizeCounter {
    offset: usize,
}

impl SizeCounter {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sink for SizeCounter {
    fn offset(&self) -> usize {
        self.offset
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.offset += bytes.len();
    }

    fn patch_u32(&mut self, _at: usize, _value: u32) {}
}

/// Write pass: fills a fixed slice, flagging any attempt to run past its end.
#[derive(Debug)]
pub struct SliceWriter<'a> {
    buf: &'a mut [u8],
    offset: usize,
    overflowed: bool,
}

impl<'a> SliceWriter<'a> {
    /// Writer over `buf`, starting at offset zero.
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            overflowed: false,
        }
    }

    /// Finish the pass, returning the byte count.
    ///
    /// Fails with [`ProtoError::SizeMismatch`] if the pass overran the slice or
    /// did not fill exactly `expected` bytes.
    pub fn finish(self, expected: usize) -> Result<usize> {
        if self.overflowed || self.offset != expected {
            return Err(ProtoError::SizeMismatch {
                estimated: expected,
                written: self.offset,
            });
        }
        Ok(self.offset)
    }
}

impl Sink for SliceWriter<'_> {
    fn offset(&self) -> usize {
        self.offset
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.offset + bytes.len();
        match self.buf.get_mut(self.offset..end) {
            Some(dst) => dst.copy_from_slice(bytes),
            None => self.overflowed = true,
        }
        self.offset = end;
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        match self.buf.get_mut(at..at + 4) {
            Some(dst) => dst.copy_from_slice(&value.to_be_bytes()),
            None => self.overflowed = true,
        }
    }
}

/// Growable sink used where exact pre-sizing is not required (response building).
#[derive(Debug, Default)]
pub struct VecSink {
    buf: Vec<u8>,
}

impl VecSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bytes written so far.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Borrow the bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl Sink for VecSink {
    fn offset(&self) -> usize {
        self.buf.len()
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        if let Some(dst) = self.buf.get_mut(at..at + 4) {
            dst.copy_from_slice(&value.to_be_bytes());
        }
    }
}

/// A structure that can be laid out on the wire.
pub trait Encode {
    /// Drive `sink` through this structure's bytes.
    fn encode<S: Sink>(&self, sink: &mut S) -> Result<()>;

    /// Estimate pass.
    fn encoded_size(&self) -> Result<usize> {
        let mut counter = SizeCounter::new();
        self.encode(&mut counter)?;
        Ok(counter.offset())
    }
}

/// Encode a complete message into `buf` using the two-pass protocol.
///
/// The message must start with an 8-byte proto header placeholder; its length
/// field is patched here once the write pass has produced the final offset.
/// When `compress` is set the buffer also reserves the compression region.
/// Returns the message length.
pub fn encode_into<E: Encode>(msg: &E, buf: &mut MessageBuffer, compress: bool) -> Result<usize> {
    let estimated = msg.encoded_size()?;
    if estimated > MAX_MESSAGE_SIZE {
        return Err(ProtoError::MessageTooLarge {
            size: estimated,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if estimated < PROTO_HEADER_SIZE {
        return Err(ProtoError::header("message shorter than its proto header"));
    }

    let region = buf.prepare(estimated, compress)?;
    let mut writer = SliceWriter::new(region);
    msg.encode(&mut writer)?;
    let written = writer.finish(estimated)?;

    let header = ProtoHeader::new(MessageType::Message, written - PROTO_HEADER_SIZE);
    buf.message_mut()[..PROTO_HEADER_SIZE].copy_from_slice(&header.encode());
    Ok(written)
}
