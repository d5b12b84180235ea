//! Tiered buffer pool and the padded message buffer.
//!
//! The pool hands out byte buffers rounded up to power-of-two size classes and
//! recycles them when they are dropped, so commands do not allocate on the hot
//! path. Recycled buffers are not zeroed: a holder may only read bytes it
//! wrote itself.
//!
//! [`MessageBuffer`] owns one pooled allocation per command and exposes two
//! views over it by offset: the logical message, and (when compression is
//! reserved) a compression region placed in front of the message so the
//! compression pass can write its output without a second allocation.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProtoError, Result};
use crate::protocol::{
    COMPRESSED_HEADER_SIZE, COMPRESS_THRESHOLD, MAX_MESSAGE_SIZE, SERVER_TIMEOUT_OFFSET,
};

/// 4KB buffer size.
pub const BUFFER_4K: usize = 4 * 1024;
/// 64KB buffer size.
pub const BUFFER_64K: usize = 64 * 1024;
/// 1MB buffer size.
pub const BUFFER_1M: usize = 1024 * 1024;
/// 32MB buffer size.
pub const BUFFER_32M: usize = 32 * 1024 * 1024;

/// Largest allocation the pool will make: a maximal message plus its
/// compression region.
pub const MAX_BUFFER_SIZE: usize = 2 * MAX_MESSAGE_SIZE + COMPRESSED_HEADER_SIZE;

/// Configuration for the buffer pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferPoolConfig {
    /// Smallest size class in bytes (rounded up to a power of two).
    pub min_class: usize,
    /// Largest pooled size class; bigger requests get exact, unpooled buffers.
    pub max_class: usize,
    /// Idle buffers kept per class; extra releases are freed.
    pub max_idle_per_class: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            min_class: BUFFER_4K,
            max_class: BUFFER_32M,
            max_idle_per_class: 32,
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    /// Fresh allocations made by the pool.
    pub allocated: usize,
    /// Acquisitions served from a free list.
    pub reused: usize,
    /// Buffers currently checked out.
    pub in_use: usize,
    /// Buffers sitting in free lists.
    pub idle: usize,
    /// Requests above the largest class.
    pub oversize: usize,
}

struct SizeClass {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

/// A thread-safe pool of reusable byte buffers bucketed by size class.
pub struct BufferPool {
    config: BufferPoolConfig,
    classes: Vec<SizeClass>,
    allocated: AtomicUsize,
    reused: AtomicUsize,
    in_use: AtomicUsize,
    oversize: AtomicUsize,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("config", &self.config)
            .field("classes", &self.classes.len())
            .finish()
    }
}

impl BufferPool {
    /// Create a pool with the given configuration.
    pub fn new(config: BufferPoolConfig) -> Arc<Self> {
        let min = config.min_class.max(64).next_power_of_two();
        let max = config.max_class.max(min).next_power_of_two();
        let mut classes = Vec::new();
        let mut size = min;
        while size <= max {
            classes.push(SizeClass {
                size,
                free: Mutex::new(Vec::new()),
            });
            size *= 2;
        }
        Arc::new(Self {
            config: BufferPoolConfig {
                min_class: min,
                max_class: max,
                max_idle_per_class: config.max_idle_per_class,
            },
            classes,
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            oversize: AtomicUsize::new(0),
        })
    }

    /// Pool with default configuration.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(BufferPoolConfig::default())
    }

    /// Effective configuration after rounding.
    pub fn config(&self) -> &BufferPoolConfig {
        &self.config
    }

    /// Capacity a request of `min_size` bytes will receive.
    pub fn class_size(&self, min_size: usize) -> usize {
        self.class_index(min_size)
            .map(|i| self.classes[i].size)
            .unwrap_or(min_size)
    }

    fn class_index(&self, min_size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.size >= min_size)
    }

    /// Get a buffer of at least `min_size` bytes.
    ///
    /// The contents are whatever the previous holder left behind.
    pub fn acquire(self: &Arc<Self>, min_size: usize) -> Result<PooledBuffer> {
        if min_size > MAX_BUFFER_SIZE {
            return Err(ProtoError::MessageTooLarge {
                size: min_size,
                max: MAX_BUFFER_SIZE,
            });
        }

        let buf = match self.class_index(min_size) {
            Some(i) => {
                let class = &self.classes[i];
                match class.free.lock().pop() {
                    Some(buf) => {
                        self.reused.fetch_add(1, Ordering::Relaxed);
                        buf
                    }
                    None => {
                        self.allocated.fetch_add(1, Ordering::Relaxed);
                        vec![0u8; class.size]
                    }
                }
            }
            None => {
                self.oversize.fetch_add(1, Ordering::Relaxed);
                vec![0u8; min_size]
            }
        };

        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    fn recycle(&self, buf: Vec<u8>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if let Some(class) = self.classes.iter().find(|c| c.size == buf.len()) {
            let mut free = class.free.lock();
            if free.len() < self.config.max_idle_per_class {
                free.push(buf);
            }
        }
    }

    /// Current pool statistics.
    pub fn stats(&self) -> BufferPoolStats {
        let idle = self.classes.iter().map(|c| c.free.lock().len()).sum();
        BufferPoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            in_use: self.in_use.load(Ordering::Relaxed),
            idle,
            oversize: self.oversize.load(Ordering::Relaxed),
        }
    }
}

/// A buffer borrowed from the pool. Returns itself to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Full capacity of the buffer.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(|b| b.len()).unwrap_or(0)
    }

    /// The whole buffer.
    pub fn as_slice(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }

    /// The whole buffer, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.recycle(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

/// Which part of the allocation goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wire {
    /// Nothing prepared.
    Empty,
    /// The plain message view.
    Message,
    /// Compressed bytes at the front of the compression region.
    Compressed { len: usize },
    /// Compressed bytes in a replacement buffer; the message view is gone.
    Spilled { len: usize },
}

/// Per-command message buffer with a message view and an optional
/// compression region, both offsets into one pooled allocation.
///
/// Layout with compression reserved:
///
/// ```text
/// [ compression region: 16 + size ][ message: size ]
/// ```
pub struct MessageBuffer {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) buf: Option<PooledBuffer>,
    pub(crate) msg_start: usize,
    pub(crate) msg_len: usize,
    pub(crate) reserved: bool,
    pub(crate) wire: Wire,
}

impl MessageBuffer {
    /// Empty buffer drawing from `pool`.
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self {
            pool,
            buf: None,
            msg_start: 0,
            msg_len: 0,
            reserved: false,
            wire: Wire::Empty,
        }
    }

    /// The backing pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Lay out a message of `size` bytes and return its view for writing.
    ///
    /// The compression region is only reserved when `compress` is requested
    /// and the message is large enough to be compressed at all. The current
    /// allocation is reused when it is large enough; otherwise it goes back to
    /// the pool before a bigger one is acquired.
    pub fn prepare(&mut self, size: usize, compress: bool) -> Result<&mut [u8]> {
        let reserve = compress && size > COMPRESS_THRESHOLD;
        let region = if reserve { COMPRESSED_HEADER_SIZE + size } else { 0 };
        let total = region + size;

        let fits = self
            .buf
            .as_ref()
            .map(|b| b.capacity() >= total)
            .unwrap_or(false);
        if !fits {
            self.buf = None;
            self.buf = Some(self.pool.acquire(total)?);
        }

        self.msg_start = region;
        self.msg_len = size;
        self.reserved = reserve;
        self.wire = Wire::Message;
        Ok(self.message_mut())
    }

    /// Whether the last `prepare` reserved a compression region.
    pub fn compression_reserved(&self) -> bool {
        self.reserved
    }

    /// The logical (uncompressed) message.
    pub fn message(&self) -> &[u8] {
        match (self.wire, &self.buf) {
            (Wire::Message | Wire::Compressed { .. }, Some(buf)) => {
                &buf[self.msg_start..self.msg_start + self.msg_len]
            }
            _ => &[],
        }
    }

    /// The logical message, mutably.
    pub fn message_mut(&mut self) -> &mut [u8] {
        let (start, len) = (self.msg_start, self.msg_len);
        match (self.wire, &mut self.buf) {
            (Wire::Message | Wire::Compressed { .. }, Some(buf)) => &mut buf[start..start + len],
            _ => &mut [],
        }
    }

    /// The bytes to send.
    pub fn wire(&self) -> &[u8] {
        match (self.wire, &self.buf) {
            (Wire::Message, _) => self.message(),
            (Wire::Compressed { len } | Wire::Spilled { len }, Some(buf)) => &buf[..len],
            _ => &[],
        }
    }

    /// True once the compression pass replaced the wire view.
    pub fn is_compressed(&self) -> bool {
        matches!(self.wire, Wire::Compressed { .. } | Wire::Spilled { .. })
    }

    /// Overwrite the server-side timeout of the prepared message.
    ///
    /// Must run before [`MessageBuffer::compress`]; once compressed the
    /// message is final and this is a no-op.
    pub fn set_server_timeout(&mut self, millis: u32) {
        if self.wire != Wire::Message {
            return;
        }
        if let Some(dst) = self
            .message_mut()
            .get_mut(SERVER_TIMEOUT_OFFSET..SERVER_TIMEOUT_OFFSET + 4)
        {
            dst.copy_from_slice(&millis.to_be_bytes());
        }
    }

    /// Give the allocation back to the pool.
    pub fn release(&mut self) {
        self.buf = None;
        self.msg_start = 0;
        self.msg_len = 0;
        self.reserved = false;
        self.wire = Wire::Empty;
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("msg_start", &self.msg_start)
            .field("msg_len", &self.msg_len)
            .field("reserved", &self.reserved)
            .field("wire", &self.wire)
            .finish()
    }
}
