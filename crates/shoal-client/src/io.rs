//! Framed socket I/O with deadline-bounded timeouts.

use std::sync::Arc;
use std::time::Duration;

use shoal_proto::protocol::PROTO_HEADER_SIZE;
use shoal_proto::{decompress_body, BufferPool, MessageType, PooledBuffer, ProtoError, ProtoHeader};
use tracing::trace;

use crate::connection::Connection;
use crate::deadline::CommandDeadline;
use crate::error::{ClientError, ErrorKind, Result};

/// What a response parser needs besides the connection.
#[derive(Debug, Clone)]
pub struct ParseContext {
    /// Pool the receive buffers come from.
    pub buffers: Arc<BufferPool>,
    /// Deadline of the running command.
    pub deadline: CommandDeadline,
}

impl ParseContext {
    /// Timeout for the next socket operation.
    pub fn io_timeout(&self) -> Option<Duration> {
        self.deadline.io_timeout()
    }
}

/// A received message, decompressed if it arrived compressed.
#[derive(Debug)]
pub enum Received {
    /// Plain message read straight into a pooled buffer.
    Pooled {
        /// Buffer holding the message at its start.
        buf: PooledBuffer,
        /// Message length including the proto header.
        len: usize,
    },
    /// Message inflated from a compressed frame.
    Inflated(Vec<u8>),
}

impl Received {
    /// The complete plain message, proto header included.
    pub fn message(&self) -> &[u8] {
        match self {
            Received::Pooled { buf, len } => &buf[..*len],
            Received::Inflated(v) => v,
        }
    }
}

fn timed_out() -> ClientError {
    ClientError::new(ErrorKind::SocketTimeout)
}

/// Fill `buf`, giving up after `timeout`.
pub async fn read_exact(conn: &mut dyn Connection, buf: &mut [u8], timeout: Option<Duration>) -> Result<()> {
    match timeout {
        Some(t) => tokio::time::timeout(t, conn.read_exact(buf))
            .await
            .map_err(|_| timed_out())??,
        None => conn.read_exact(buf).await?,
    }
    Ok(())
}

/// Write all of `buf`, giving up after `timeout`.
pub async fn write_all(conn: &mut dyn Connection, buf: &[u8], timeout: Option<Duration>) -> Result<()> {
    match timeout {
        Some(t) => tokio::time::timeout(t, conn.write_all(buf))
            .await
            .map_err(|_| timed_out())??,
        None => conn.write_all(buf).await?,
    }
    Ok(())
}

/// Read one framed message.
///
/// The proto header is validated before the body is read, so an oversized
/// or garbled length never triggers an allocation. Compressed frames are
/// inflated and returned as the original plain message.
pub async fn read_message(conn: &mut dyn Connection, ctx: &ParseContext) -> Result<Received> {
    let mut header = [0u8; PROTO_HEADER_SIZE];
    read_exact(conn, &mut header, ctx.io_timeout()).await?;
    let proto = ProtoHeader::decode(&header)?;
    trace!(node = %conn.node_name(), msg_type = ?proto.msg_type, len = proto.length, "frame header");

    match proto.msg_type {
        MessageType::Message => {
            let len = PROTO_HEADER_SIZE + proto.length;
            let mut buf = ctx.buffers.acquire(len)?;
            buf[..PROTO_HEADER_SIZE].copy_from_slice(&header);
            read_exact(conn, &mut buf[PROTO_HEADER_SIZE..len], ctx.io_timeout()).await?;
            Ok(Received::Pooled { buf, len })
        }
        MessageType::Compressed => {
            let mut buf = ctx.buffers.acquire(proto.length)?;
            read_exact(conn, &mut buf[..proto.length], ctx.io_timeout()).await?;
            let message = decompress_body(&buf[..proto.length])?;
            let inner = ProtoHeader::decode(&message)?;
            if inner.msg_type != MessageType::Message {
                return Err(ClientError::from(ProtoError::header(
                    "compressed frame does not hold a plain message",
                )));
            }
            Ok(Received::Inflated(message))
        }
        MessageType::Info => Err(ClientError::from(ProtoError::header(
            "unexpected info message on a command connection",
        ))),
    }
}
