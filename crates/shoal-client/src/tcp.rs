//! TCP connections and a per-node connection pool.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shoal_proto::protocol::PROTO_HEADER_SIZE;
use shoal_proto::ProtoHeader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::ClientConfig;
use crate::connection::{AcquireError, Connection, ConnectionPool};
use crate::node::Node;

/// A single TCP connection to a node.
pub struct TcpConnection {
    node: String,
    stream: TcpStream,
    connected: bool,
}

impl TcpConnection {
    /// Connect to `address` within `timeout`.
    pub async fn connect(node: &str, address: &str, timeout: Duration, nodelay: bool) -> io::Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {address} timed out")))??;
        if nodelay {
            stream.set_nodelay(true)?;
        }
        debug!(node = %node, addr = %address, "TCP connected");
        Ok(Self::from_stream(node, stream))
    }

    /// Wrap an established stream.
    pub fn from_stream(node: &str, stream: TcpStream) -> Self {
        Self {
            node: node.to_string(),
            stream,
            connected: true,
        }
    }

    fn fail<T>(&mut self, result: io::Result<T>) -> io::Result<T> {
        if result.is_err() {
            self.connected = false;
        }
        result
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn node_name(&self) -> &str {
        &self.node
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let result = self.stream.write_all(buf).await;
        self.fail(result)
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let result = self.stream.read_exact(buf).await.map(|_| ());
        self.fail(result)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn drain(&mut self, budget: Duration) -> bool {
        let stream = &mut self.stream;
        let drained = tokio::time::timeout(budget, async move {
            let mut header = [0u8; PROTO_HEADER_SIZE];
            stream.read_exact(&mut header).await.ok()?;
            let header = ProtoHeader::decode(&header).ok()?;
            let mut body = (&mut *stream).take(header.length as u64);
            let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await.ok()?;
            (skipped == header.length as u64).then_some(())
        })
        .await;
        let ok = matches!(drained, Ok(Some(())));
        if !ok {
            self.connected = false;
        }
        ok
    }
}

/// Pool limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpPoolConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Open connections allowed per node, idle or in use.
    pub max_conns_per_node: usize,
    /// Connects allowed in flight per node; `0` is unlimited.
    pub max_opening_per_node: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for TcpPoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1_000,
            max_conns_per_node: 100,
            max_opening_per_node: 0,
            idle_timeout_ms: 55_000,
            nodelay: true,
        }
    }
}

struct Idle {
    conn: Box<dyn Connection>,
    since: Instant,
}

#[derive(Default)]
struct NodeConns {
    idle: parking_lot::Mutex<Vec<Idle>>,
    open: AtomicUsize,
    opening: AtomicUsize,
}

/// Snapshot of one node's pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpPoolStats {
    /// Open connections, idle or in use.
    pub open: usize,
    /// Idle connections.
    pub idle: usize,
}

/// Per-node idle queues with an open-connection limit.
pub struct TcpConnectionPool {
    config: TcpPoolConfig,
    nodes: DashMap<String, Arc<NodeConns>>,
}

impl TcpConnectionPool {
    /// Empty pool.
    pub fn new(config: TcpPoolConfig) -> Self {
        Self {
            config,
            nodes: DashMap::new(),
        }
    }

    /// Pool sized from the client configuration.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.tcp.clone())
    }

    /// Counts for `node`.
    pub fn stats(&self, node: &str) -> TcpPoolStats {
        self.nodes
            .get(node)
            .map(|n| TcpPoolStats {
                open: n.open.load(Ordering::Acquire),
                idle: n.idle.lock().len(),
            })
            .unwrap_or_default()
    }

    fn entry(&self, node: &str) -> Arc<NodeConns> {
        self.nodes.entry(node.to_string()).or_default().clone()
    }

    fn take_idle(&self, conns: &NodeConns) -> Option<Box<dyn Connection>> {
        let max_idle = Duration::from_millis(self.config.idle_timeout_ms);
        let mut idle = conns.idle.lock();
        while let Some(entry) = idle.pop() {
            if entry.conn.is_connected() && entry.since.elapsed() < max_idle {
                return Some(entry.conn);
            }
            conns.open.fetch_sub(1, Ordering::AcqRel);
            trace!(node = %entry.conn.node_name(), "dropped stale idle connection");
        }
        None
    }
}

#[async_trait]
impl ConnectionPool for TcpConnectionPool {
    async fn acquire(&self, node: &Arc<Node>, timeout: Duration) -> Result<Box<dyn Connection>, AcquireError> {
        let conns = self.entry(node.name());
        if let Some(conn) = self.take_idle(&conns) {
            return Ok(conn);
        }

        let open = conns.open.fetch_add(1, Ordering::AcqRel);
        if open >= self.config.max_conns_per_node {
            conns.open.fetch_sub(1, Ordering::AcqRel);
            return Err(AcquireError::Exhausted);
        }
        let opening = conns.opening.fetch_add(1, Ordering::AcqRel);
        if self.config.max_opening_per_node > 0 && opening >= self.config.max_opening_per_node {
            conns.opening.fetch_sub(1, Ordering::AcqRel);
            conns.open.fetch_sub(1, Ordering::AcqRel);
            return Err(AcquireError::Empty);
        }

        let connect_timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let timeout = if timeout.is_zero() {
            connect_timeout
        } else {
            timeout.min(connect_timeout)
        };
        let result = TcpConnection::connect(node.name(), node.address(), timeout, self.config.nodelay).await;
        conns.opening.fetch_sub(1, Ordering::AcqRel);
        match result {
            Ok(conn) => Ok(Box::new(conn)),
            Err(e) => {
                conns.open.fetch_sub(1, Ordering::AcqRel);
                Err(AcquireError::Connect(e))
            }
        }
    }

    fn release(&self, conn: Box<dyn Connection>) {
        if !conn.is_connected() {
            self.close(conn);
            return;
        }
        let conns = self.entry(conn.node_name());
        conns.idle.lock().push(Idle {
            conn,
            since: Instant::now(),
        });
    }

    fn close(&self, conn: Box<dyn Connection>) {
        if let Some(conns) = self.nodes.get(conn.node_name()) {
            conns.open.fetch_sub(1, Ordering::AcqRel);
        }
        trace!(node = %conn.node_name(), "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::ErrorRateConfig;
    use shoal_proto::response::ResponseBuilder;
    use shoal_proto::ResultCode;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn test_acquire_release_reuses() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        let node = Arc::new(Node::new("A", addr, ErrorRateConfig::default()));
        let pool = TcpConnectionPool::new(TcpPoolConfig::default());

        let conn = pool.acquire(&node, Duration::from_secs(1)).await.unwrap();
        assert_eq!(conn.node_name(), "A");
        pool.release(conn);
        assert_eq!(pool.stats("A"), TcpPoolStats { open: 1, idle: 1 });

        let conn = pool.acquire(&node, Duration::from_secs(1)).await.unwrap();
        assert_eq!(pool.stats("A"), TcpPoolStats { open: 1, idle: 0 });
        pool.close(conn);
        assert_eq!(pool.stats("A").open, 0);
    }

    #[tokio::test]
    async fn test_exhausted_at_limit() {
        let (listener, addr) = listener().await;
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((s, _)) = listener.accept().await {
                held.push(s);
            }
        });
        let node = Arc::new(Node::new("A", addr, ErrorRateConfig::default()));
        let pool = TcpConnectionPool::new(TcpPoolConfig {
            max_conns_per_node: 1,
            ..Default::default()
        });
        let _held = pool.acquire(&node, Duration::from_secs(1)).await.unwrap();
        let err = pool.acquire(&node, Duration::from_secs(1)).await.err().expect("expected acquire error");
        assert!(matches!(err, AcquireError::Exhausted));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let (listener, addr) = listener().await;
        drop(listener);
        let node = Arc::new(Node::new("A", addr, ErrorRateConfig::default()));
        let pool = TcpConnectionPool::new(TcpPoolConfig::default());
        let err = pool.acquire(&node, Duration::from_secs(1)).await.err().expect("expected acquire error");
        assert!(matches!(err, AcquireError::Connect(_)));
        assert_eq!(pool.stats("A").open, 0);
    }

    #[tokio::test]
    async fn test_drain_consumes_one_message() {
        let (listener, addr) = listener().await;
        let mut builder = ResponseBuilder::new();
        builder.last(ResultCode::OK);
        let reply = builder.finish();
        let sent = reply.clone();
        tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            s.write_all(&sent).await.unwrap();
            s.write_all(&sent).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let mut conn = TcpConnection::connect("A", &addr, Duration::from_secs(1), true)
            .await
            .unwrap();
        assert!(conn.drain(Duration::from_secs(1)).await);
        let mut next = vec![0u8; reply.len()];
        conn.read_exact(&mut next).await.unwrap();
        assert_eq!(next, reply);
        assert!(!conn.drain(Duration::from_millis(20)).await);
        assert!(!conn.is_connected());
    }
}
