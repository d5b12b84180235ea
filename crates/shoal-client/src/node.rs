//! Cluster node handle and its counters.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::circuit::{ErrorRateBreaker, ErrorRateConfig};
use crate::error::{ClientError, ErrorKind};

/// Atomic per-node counters, updated by every command that touches the node.
#[derive(Debug, Default)]
pub struct NodeStats {
    commands: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
    in_doubt: AtomicU64,
    salvaged: AtomicU64,
}

/// Point-in-time copy of [`NodeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatsSnapshot {
    /// Attempts that reached this node.
    pub commands: u64,
    /// Attempts that were retries.
    pub retries: u64,
    /// Socket timeouts.
    pub timeouts: u64,
    /// Errors counted against the breaker.
    pub errors: u64,
    /// Writes that ended in doubt.
    pub in_doubt: u64,
    /// Connections handed to the salvage path.
    pub salvaged: u64,
}

impl NodeStats {
    /// Count one attempt; `retry` marks attempts after the first.
    pub fn record_command(&self, retry: bool) {
        self.commands.fetch_add(1, Ordering::Relaxed);
        if retry {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Count a socket timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Count an in-doubt write.
    pub fn record_in_doubt(&self) {
        self.in_doubt.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a salvage hand-off.
    pub fn record_salvage(&self) {
        self.salvaged.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            in_doubt: self.in_doubt.load(Ordering::Relaxed),
            salvaged: self.salvaged.load(Ordering::Relaxed),
        }
    }
}

/// A server in the cluster.
///
/// Owned by the topology as `Arc<Node>`; the engine only reads it and bumps
/// its atomic counters.
pub struct Node {
    name: String,
    address: String,
    active: AtomicBool,
    breaker: ErrorRateBreaker,
    stats: NodeStats,
}

impl Node {
    /// New active node.
    pub fn new(name: impl Into<String>, address: impl Into<String>, breaker: ErrorRateConfig) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            active: AtomicBool::new(true),
            breaker: ErrorRateBreaker::new(breaker),
            stats: NodeStats::default(),
        }
    }

    /// Node name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `host:port` the node listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// False once the topology has removed the node.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Mark the node active or inactive.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Fails with [`ErrorKind::CircuitOpen`] while the node's error rate is
    /// over its limit.
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.breaker.validate() {
            Ok(())
        } else {
            Err(ClientError::new(ErrorKind::CircuitOpen).with_node(self.name.clone()))
        }
    }

    /// Count an error against the breaker.
    pub fn incr_error(&self) {
        self.breaker.record_error();
        self.stats.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Error-rate breaker.
    pub fn breaker(&self) -> &ErrorRateBreaker {
        &self.breaker
    }

    /// Counters.
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("active", &self.is_active())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.address)
    }
}
