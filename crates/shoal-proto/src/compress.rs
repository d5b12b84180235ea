//! Zlib compression pass over an encoded message.
//!
//! A compressed message on the wire is
//!
//! ```text
//! [proto header: type 4, length = compressed + 8][original length: u64 BE][zlib stream]
//! ```
//!
//! where the original length and the zlib stream both cover the complete
//! uncompressed message, proto header included.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::trace;

use crate::buffer::{MessageBuffer, Wire};
use crate::error::{ProtoError, Result};
use crate::protocol::{
    MessageType, ProtoHeader, COMPRESSED_HEADER_SIZE, COMPRESS_THRESHOLD, MAX_MESSAGE_SIZE,
    PROTO_HEADER_SIZE,
};

/// Input is handed to the deflater in slices of at most this many bytes.
pub const DEFLATE_CHUNK_SIZE: usize = 64 * 1024;

/// Writes into a fixed region and spills whatever does not fit.
struct RegionWriter<'a> {
    region: &'a mut [u8],
    pos: usize,
    spill: Vec<u8>,
}

impl<'a> RegionWriter<'a> {
    fn new(region: &'a mut [u8]) -> Self {
        Self {
            region,
            pos: 0,
            spill: Vec::new(),
        }
    }

    fn len(&self) -> usize {
        self.pos + self.spill.len()
    }
}

impl Write for RegionWriter<'_> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.spill.is_empty() {
            let room = self.region.len() - self.pos;
            let n = room.min(data.len());
            self.region[self.pos..self.pos + n].copy_from_slice(&data[..n]);
            self.pos += n;
            self.spill.extend_from_slice(&data[n..]);
        } else {
            self.spill.extend_from_slice(data);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn compressed_header(compressed_len: usize, original_len: usize) -> [u8; COMPRESSED_HEADER_SIZE] {
    let mut header = [0u8; COMPRESSED_HEADER_SIZE];
    let proto = ProtoHeader::new(
        MessageType::Compressed,
        compressed_len + (COMPRESSED_HEADER_SIZE - PROTO_HEADER_SIZE),
    );
    header[..PROTO_HEADER_SIZE].copy_from_slice(&proto.encode());
    header[PROTO_HEADER_SIZE..].copy_from_slice(&(original_len as u64).to_be_bytes());
    header
}

impl MessageBuffer {
    /// Deflate the prepared message into the reserved compression region.
    ///
    /// Returns `Ok(false)` and leaves the wire view untouched when no region
    /// was reserved or the message does not exceed the threshold. If the
    /// deflated stream outgrows the region, a buffer of exactly the needed
    /// size is acquired and the padded one goes back to the pool.
    pub fn compress(&mut self) -> Result<bool> {
        if self.is_compressed() {
            return Ok(true);
        }
        if !self.reserved || self.msg_len <= COMPRESS_THRESHOLD || self.wire != Wire::Message {
            return Ok(false);
        }
        let (msg_start, msg_len) = (self.msg_start, self.msg_len);
        let buf = self
            .buf
            .as_mut()
            .ok_or_else(|| ProtoError::Compression("no prepared message".to_string()))?;

        let (region, rest) = buf.split_at_mut(msg_start);
        let message = &rest[..msg_len];
        let (header_slot, body_slot) = region.split_at_mut(COMPRESSED_HEADER_SIZE);

        let mut encoder = ZlibEncoder::new(RegionWriter::new(body_slot), Compression::default());
        for chunk in message.chunks(DEFLATE_CHUNK_SIZE) {
            encoder
                .write_all(chunk)
                .map_err(|e| ProtoError::Compression(e.to_string()))?;
        }
        let writer = encoder
            .finish()
            .map_err(|e| ProtoError::Compression(e.to_string()))?;

        let compressed_len = writer.len();
        let header = compressed_header(compressed_len, msg_len);
        let total = COMPRESSED_HEADER_SIZE + compressed_len;

        if writer.spill.is_empty() {
            header_slot.copy_from_slice(&header);
            trace!(original = msg_len, compressed = total, "compressed in place");
            self.wire = Wire::Compressed { len: total };
            return Ok(true);
        }

        let RegionWriter { pos, spill, .. } = writer;
        let mut fresh = self.pool.acquire(total)?;
        fresh[..COMPRESSED_HEADER_SIZE].copy_from_slice(&header);
        fresh[COMPRESSED_HEADER_SIZE..COMPRESSED_HEADER_SIZE + pos]
            .copy_from_slice(&body_slot[..pos]);
        fresh[COMPRESSED_HEADER_SIZE + pos..total].copy_from_slice(&spill);

        trace!(
            original = msg_len,
            compressed = total,
            "compressed output outgrew region"
        );
        self.buf = Some(fresh);
        self.msg_start = 0;
        self.msg_len = 0;
        self.wire = Wire::Spilled { len: total };
        Ok(true)
    }
}

/// Compress a complete message into a new type-4 message.
///
/// Used where no pooled buffer is involved, such as building server
/// responses.
pub fn compress_message(message: &[u8]) -> Result<Vec<u8>> {
    let mut out = vec![0u8; COMPRESSED_HEADER_SIZE];
    let mut encoder = ZlibEncoder::new(out, Compression::default());
    for chunk in message.chunks(DEFLATE_CHUNK_SIZE) {
        encoder
            .write_all(chunk)
            .map_err(|e| ProtoError::Compression(e.to_string()))?;
    }
    out = encoder
        .finish()
        .map_err(|e| ProtoError::Compression(e.to_string()))?;
    let header = compressed_header(out.len() - COMPRESSED_HEADER_SIZE, message.len());
    out[..COMPRESSED_HEADER_SIZE].copy_from_slice(&header);
    Ok(out)
}

/// Inflate a zlib stream that must produce exactly `original_len` bytes.
pub fn inflate_body(stream: &[u8], original_len: usize) -> Result<Vec<u8>> {
    if original_len > MAX_MESSAGE_SIZE + PROTO_HEADER_SIZE {
        return Err(ProtoError::MessageTooLarge {
            size: original_len,
            max: MAX_MESSAGE_SIZE + PROTO_HEADER_SIZE,
        });
    }
    let mut out = Vec::with_capacity(original_len);
    ZlibDecoder::new(stream)
        .take(original_len as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtoError::Compression(e.to_string()))?;
    if out.len() != original_len {
        return Err(ProtoError::Compression(format!(
            "inflated {} bytes, header declared {original_len}",
            out.len()
        )));
    }
    Ok(out)
}

/// Decode the body of a type-4 message (everything after its proto header).
pub fn decompress_body(body: &[u8]) -> Result<Vec<u8>> {
    let declared = COMPRESSED_HEADER_SIZE - PROTO_HEADER_SIZE;
    if body.len() < declared {
        return Err(ProtoError::Truncated {
            needed: declared,
            available: body.len(),
        });
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&body[..declared]);
    let original_len = u64::from_be_bytes(raw) as usize;
    inflate_body(&body[declared..], original_len)
}

/// Decode a complete compressed message back to the original bytes.
pub fn decompress_message(wire: &[u8]) -> Result<Vec<u8>> {
    let header = ProtoHeader::decode(wire)?;
    if header.msg_type != MessageType::Compressed {
        return Err(ProtoError::header("not a compressed message"));
    }
    let end = PROTO_HEADER_SIZE + header.length;
    if wire.len() < end {
        return Err(ProtoError::Truncated {
            needed: end,
            available: wire.len(),
        });
    }
    decompress_body(&wire[PROTO_HEADER_SIZE..end])
}
