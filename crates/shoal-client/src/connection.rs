//! Connection and connection-pool interfaces.
//!
//! The engine is written against these traits only. [`crate::tcp`] provides
//! the tokio TCP implementation and [`crate::mock`] a scripted one for tests.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::node::Node;

/// A byte stream to one node.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Name of the node this connection talks to.
    fn node_name(&self) -> &str;

    /// Write all of `buf`.
    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Fill `buf` completely.
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;

    /// False once the connection has failed or been closed.
    fn is_connected(&self) -> bool;

    /// Read and discard the rest of an interrupted response.
    ///
    /// # Arguments
    ///
    /// * `budget` - How long to wait for the remaining bytes.
    ///
    /// # Returns
    ///
    /// `true` if the stream is aligned on a message boundary again and the
    /// connection can be reused.
    async fn drain(&mut self, budget: Duration) -> bool;
}

/// Why a pool could not hand out a connection.
#[derive(Error, Debug)]
pub enum AcquireError {
    /// No idle connection right now; the attempt does not count.
    #[error("connection pool empty")]
    Empty,

    /// The node is at its connection limit.
    #[error("connection pool exhausted")]
    Exhausted,

    /// Opening a new connection failed.
    #[error("connect failed: {0}")]
    Connect(#[from] io::Error),
}

/// Source of connections, keyed by node.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Take an idle connection to `node` or open a new one within `timeout`.
    async fn acquire(&self, node: &Arc<Node>, timeout: Duration) -> Result<Box<dyn Connection>, AcquireError>;

    /// Return a healthy connection for reuse.
    fn release(&self, conn: Box<dyn Connection>);

    /// Discard a connection whose stream state is unknown.
    fn close(&self, conn: Box<dyn Connection>);
}
