//! Retry and failover engine.
//!
//! [`Executor::execute`] drives one logical command through
//! select node, acquire connection, encode, send, then receive and parse,
//! looping on retryable failures until the attempt budget or the deadline
//! runs out. The loop knows nothing about what a command encodes or
//! parses; that lives behind [`Command`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shoal_proto::{BufferPool, MessageBuffer, ResultCode};
use tracing::{debug, trace, warn};

use crate::cluster::{Cluster, StaticCluster};
use crate::config::ClientConfig;
use crate::connection::{AcquireError, Connection, ConnectionPool};
use crate::deadline::CommandDeadline;
use crate::error::{ClientError, ErrorKind, Result};
use crate::io::{self, ParseContext};
use crate::node::Node;
use crate::policy::BasePolicy;
use crate::retry::Backoff;
use crate::tcp::TcpConnectionPool;

/// What a command does, for logs and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Read bins or the header of one record.
    Read,
    /// Check that a record exists.
    Exists,
    /// Write bins to one record.
    Write,
    /// Delete one record.
    Delete,
    /// Reset one record's TTL.
    Touch,
    /// Mixed read and write operations on one record.
    Operate,
    /// Multi-key request to one node.
    Batch,
    /// Partition scan on one node.
    Scan,
    /// Secondary index query on one node.
    Query,
    /// Transaction read verification.
    TxnVerify,
    /// Transaction roll forward or back.
    TxnRoll,
}

impl CommandKind {
    /// True for kinds that never modify records.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            CommandKind::Read
                | CommandKind::Exists
                | CommandKind::Scan
                | CommandKind::Query
                | CommandKind::TxnVerify
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of [`Command::prepare_retry`].
#[derive(Debug)]
pub enum RetryAction {
    /// Run the next attempt as usual.
    Continue,
    /// The command finished the work itself; return this result.
    Done(Result<()>),
}

/// Progress of one command's attempt loop.
///
/// Handed to [`Command::prepare_retry`] so work split off a retry can
/// continue under the same budget with [`Executor::execute_continued`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    /// Iteration being prepared, starting at 1.
    pub iteration: u32,
    /// Attempts counted against `max_retries + 1`, this one included.
    pub attempts: u32,
    /// Requests written to a connection so far.
    pub sent: u32,
}

/// A logical command the engine can run.
#[async_trait]
pub trait Command: Send {
    /// Timeouts, retry budget and encoding options.
    fn policy(&self) -> &BasePolicy;

    /// Command kind.
    fn kind(&self) -> CommandKind;

    /// True if the command never modifies records. Failed writes sent more
    /// than once are reported in doubt.
    fn is_read(&self) -> bool {
        self.kind().is_read()
    }

    /// Streaming commands that cannot resume mid-stream are never retried
    /// after a network error.
    fn is_one_shot(&self) -> bool {
        false
    }

    /// Node for the next attempt.
    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>>;

    /// Encode the request into `buf`.
    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()>;

    /// Read and interpret the response.
    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()>;

    /// False if the connection must not be reused after a clean server error.
    fn can_put_conn_back(&self) -> bool {
        true
    }

    /// Called before every retry, after the backoff sleep.
    async fn prepare_retry(
        &mut self,
        _executor: &Executor,
        _deadline: &CommandDeadline,
        _state: &RetryState,
    ) -> RetryAction {
        RetryAction::Continue
    }
}

/// Runs commands against a cluster.
///
/// Cheap to clone; every clone shares the same topology, connection pool and
/// buffer pool.
#[derive(Clone)]
pub struct Executor {
    cluster: Arc<dyn Cluster>,
    pool: Arc<dyn ConnectionPool>,
    buffers: Arc<BufferPool>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("nodes", &self.cluster.active_nodes().len())
            .field("buffers", &self.buffers.stats())
            .finish()
    }
}

/// Pause before asking an empty pool again.
const POOL_EMPTY_WAIT: Duration = Duration::from_millis(1);

/// Counters of one `execute` call.
struct Attempt {
    iteration: u32,
    sent: u32,
    is_read: bool,
    kind: CommandKind,
}

impl Attempt {
    fn in_doubt(&self) -> bool {
        !self.is_read && self.sent > 1
    }
}

impl Executor {
    /// Executor over the given collaborators.
    pub fn new(cluster: Arc<dyn Cluster>, pool: Arc<dyn ConnectionPool>, buffers: Arc<BufferPool>) -> Self {
        Self {
            cluster,
            pool,
            buffers,
        }
    }

    /// Static topology and TCP pool built from `config`.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(
            Arc::new(StaticCluster::from_config(config)),
            Arc::new(TcpConnectionPool::from_config(config)),
            BufferPool::new(config.buffer_pool.clone()),
        )
    }

    /// Topology.
    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    /// Connection pool.
    pub fn pool(&self) -> &Arc<dyn ConnectionPool> {
        &self.pool
    }

    /// Message buffer pool.
    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.buffers
    }

    /// Run `cmd` under a deadline computed from its policy now.
    pub async fn execute(&self, cmd: &mut dyn Command) -> Result<()> {
        let deadline = cmd.policy().deadline();
        self.execute_with_deadline(cmd, deadline).await
    }

    /// Run `cmd` under an existing deadline.
    pub async fn execute_with_deadline(&self, cmd: &mut dyn Command, deadline: CommandDeadline) -> Result<()> {
        self.execute_continued(cmd, deadline, RetryState::default()).await
    }

    /// Run `cmd` as the continuation of an attempt that split it off.
    ///
    /// The first pass takes the place of the attempt described by `seed`:
    /// no backoff sleep and no `prepare_retry`. Later passes count against
    /// the attempts the parent has left, and `seed.sent` still counts
    /// toward reporting a failed write in doubt.
    pub async fn execute_continued(
        &self,
        cmd: &mut dyn Command,
        deadline: CommandDeadline,
        seed: RetryState,
    ) -> Result<()> {
        let policy = cmd.policy();
        let max_attempts = policy.max_retries.saturating_add(1);
        let mut backoff = Backoff::from_policy(policy);
        for _ in 1..seed.iteration {
            backoff.advance();
        }
        let resume_at = seed.iteration;
        let timeout_delay = policy.timeout_delay();
        let exit_fast = policy.exit_fast_on_exhausted_connection_pool;

        let one_shot = cmd.is_one_shot();
        let mut state = Attempt {
            iteration: seed.iteration.saturating_sub(1),
            sent: seed.sent,
            is_read: cmd.is_read(),
            kind: cmd.kind(),
        };
        let ctx = ParseContext {
            buffers: self.buffers.clone(),
            deadline,
        };
        let mut buf = MessageBuffer::new(self.buffers.clone());
        let mut attempts = seed.attempts.saturating_sub(1);
        let mut last: Option<ClientError> = None;
        let mut last_node: Option<Arc<Node>> = None;

        while attempts < max_attempts {
            attempts += 1;
            state.iteration += 1;

            if state.iteration > 1 && state.iteration != resume_at {
                if backoff.is_enabled() {
                    let sleep = backoff.current();
                    if deadline.would_overshoot(sleep) {
                        debug!(
                            iteration = state.iteration,
                            sleep_ms = sleep.as_millis() as u64,
                            "backoff would pass the deadline"
                        );
                        return Err(self.fail(
                            ClientError::new(ErrorKind::Timeout),
                            last_node.as_deref(),
                            &state,
                            last,
                        ));
                    }
                    trace!(iteration = state.iteration, sleep_ms = sleep.as_millis() as u64, "backing off");
                    tokio::time::sleep(sleep).await;
                    backoff.advance();
                }

                let progress = RetryState {
                    iteration: state.iteration,
                    attempts,
                    sent: state.sent,
                };
                match cmd.prepare_retry(self, &deadline, &progress).await {
                    RetryAction::Continue => {}
                    RetryAction::Done(result) => {
                        return result.map_err(|e| {
                            let in_doubt = e.in_doubt() || state.in_doubt();
                            e.with_in_doubt(in_doubt).chain(last)
                        });
                    }
                }
            }

            if deadline.expired() {
                return Err(self.fail(ClientError::new(ErrorKind::Timeout), last_node.as_deref(), &state, last));
            }

            let node = match cmd.select_node(self.cluster.as_ref()) {
                Some(node) if node.is_active() => node,
                _ => {
                    debug!(iteration = state.iteration, kind = ?state.kind, "no active node");
                    last = Some(self.retryable(ClientError::new(ErrorKind::NoNode), None, &state, last));
                    continue;
                }
            };
            last_node = Some(node.clone());

            if let Err(err) = node.validate() {
                debug!(node = %node.name(), iteration = state.iteration, "circuit open, skipping node");
                last = Some(self.retryable(err, Some(&node), &state, last));
                continue;
            }
            node.stats().record_command(state.iteration > 1);

            let mut conn = match self.pool.acquire(&node, deadline.io_timeout().unwrap_or(Duration::ZERO)).await {
                Ok(conn) => conn,
                Err(AcquireError::Empty) => {
                    // An empty pool is not a real attempt, but without a
                    // deadline nothing else would end the loop.
                    if deadline.expiry().is_some() {
                        attempts -= 1;
                    }
                    trace!(node = %node.name(), iteration = state.iteration, "connection pool empty");
                    last = Some(self.retryable(ClientError::new(ErrorKind::PoolEmpty), Some(&node), &state, last));
                    let wait = deadline
                        .remaining()
                        .map_or(POOL_EMPTY_WAIT, |left| left.min(POOL_EMPTY_WAIT));
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(AcquireError::Exhausted) => {
                    let err = ClientError::new(ErrorKind::PoolExhausted);
                    if exit_fast {
                        debug!(node = %node.name(), iteration = state.iteration, "pool exhausted, failing fast");
                        return Err(self.fail(err, Some(&node), &state, last));
                    }
                    debug!(node = %node.name(), iteration = state.iteration, "connection pool exhausted");
                    last = Some(self.retryable(err, Some(&node), &state, last));
                    continue;
                }
                Err(AcquireError::Connect(e)) => {
                    node.incr_error();
                    debug!(node = %node.name(), iteration = state.iteration, error = %e, "connect failed");
                    last = Some(self.retryable(ClientError::from(e), Some(&node), &state, last));
                    continue;
                }
            };

            if let Err(e) = cmd.write_buffer(&mut buf) {
                warn!(node = %node.name(), kind = ?state.kind, error = %e, "command encode failed");
                self.pool.close(conn);
                return Err(self.fail(ClientError::encode(e), Some(&node), &state, last));
            }
            buf.set_server_timeout(deadline.server_timeout_ms());
            if let Err(e) = buf.compress() {
                warn!(node = %node.name(), kind = ?state.kind, error = %e, "command compression failed");
                self.pool.close(conn);
                return Err(self.fail(ClientError::encode(e), Some(&node), &state, last));
            }

            state.sent += 1;
            if let Err(err) = io::write_all(conn.as_mut(), buf.wire(), deadline.io_timeout()).await {
                self.count_network_error(&node, &err);
                debug!(node = %node.name(), iteration = state.iteration, kind = ?err.kind(), "send failed");
                self.discard(&node, conn, timeout_delay);
                if one_shot {
                    return Err(self.fail(err, Some(&node), &state, last));
                }
                last = Some(self.retryable(err, Some(&node), &state, last));
                continue;
            }

            match cmd.parse_result(conn.as_mut(), &ctx).await {
                Ok(()) => {
                    self.pool.release(conn);
                    trace!(node = %node.name(), iteration = state.iteration, kind = ?state.kind, "command done");
                    return Ok(());
                }
                Err(err) if err.is_network() => {
                    self.count_network_error(&node, &err);
                    debug!(node = %node.name(), iteration = state.iteration, kind = ?err.kind(), "receive failed");
                    self.discard(&node, conn, timeout_delay);
                    if one_shot {
                        return Err(self.fail(err, Some(&node), &state, last));
                    }
                    last = Some(self.retryable(err, Some(&node), &state, last));
                }
                Err(err) => {
                    if err.result_code() == Some(ResultCode::DEVICE_OVERLOAD) {
                        node.incr_error();
                    }
                    if cmd.can_put_conn_back() && conn.is_connected() && err.keep_connection() {
                        self.pool.release(conn);
                    } else {
                        self.pool.close(conn);
                    }
                    return Err(self.fail(err, Some(&node), &state, last));
                }
            }
        }

        Err(self.fail(
            ClientError::new(ErrorKind::MaxRetriesExceeded),
            last_node.as_deref(),
            &state,
            last,
        ))
    }

    fn count_network_error(&self, node: &Node, err: &ClientError) {
        match err.kind() {
            ErrorKind::SocketTimeout => node.stats().record_timeout(),
            _ => node.incr_error(),
        }
    }

    /// Give up on a connection whose stream position is unknown.
    ///
    /// With a salvage delay the connection is drained in the background and
    /// pooled again if that succeeds; the caller does not wait for it.
    fn discard(&self, node: &Node, conn: Box<dyn Connection>, delay: Duration) {
        if delay.is_zero() || !conn.is_connected() {
            self.pool.close(conn);
            return;
        }
        node.stats().record_salvage();
        debug!(node = %node.name(), delay_ms = delay.as_millis() as u64, "salvaging connection");
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut conn = conn;
            if conn.drain(delay).await {
                trace!(node = %conn.node_name(), "salvaged connection returned to pool");
                pool.release(conn);
            } else {
                trace!(node = %conn.node_name(), "salvage failed, closing connection");
                pool.close(conn);
            }
        });
    }

    fn retryable(
        &self,
        err: ClientError,
        node: Option<&Node>,
        state: &Attempt,
        last: Option<ClientError>,
    ) -> ClientError {
        tag(err, node, state).chain(last)
    }

    fn fail(&self, err: ClientError, node: Option<&Node>, state: &Attempt, last: Option<ClientError>) -> ClientError {
        let err = tag(err, node, state).with_in_doubt(state.in_doubt()).chain(last);
        if err.in_doubt() {
            if let Some(node) = node {
                node.stats().record_in_doubt();
            }
        }
        warn!(
            node = err.node().unwrap_or("-"),
            iteration = state.iteration,
            sent = state.sent,
            kind = ?state.kind,
            in_doubt = err.in_doubt(),
            error = %err.kind(),
            "command failed"
        );
        err
    }
}

fn tag(err: ClientError, node: Option<&Node>, state: &Attempt) -> ClientError {
    let err = err.with_iteration(state.iteration);
    match node {
        Some(node) => err.with_node(node.name()),
        None => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_kinds() {
        assert!(CommandKind::Read.is_read());
        assert!(CommandKind::Scan.is_read());
        assert!(CommandKind::TxnVerify.is_read());
        assert!(!CommandKind::Write.is_read());
        assert!(!CommandKind::TxnRoll.is_read());
        assert!(!CommandKind::Batch.is_read());
    }

    #[test]
    fn test_in_doubt_needs_two_sends() {
        let mut state = Attempt {
            iteration: 1,
            sent: 1,
            is_read: false,
            kind: CommandKind::Write,
        };
        assert!(!state.in_doubt());
        state.sent = 2;
        assert!(state.in_doubt());
        state.is_read = true;
        assert!(!state.in_doubt());
    }
}
