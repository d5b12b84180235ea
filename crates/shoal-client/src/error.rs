//! Error types for the execution engine.
//!
//! Every failed attempt becomes a [`ClientError`] that links to the failure
//! before it, so the error a caller finally sees carries the whole retry
//! history. Callers should branch on [`ClientError::in_doubt`] and
//! [`ClientError::result_code`] rather than on message text.

use std::fmt;
use std::io;

use shoal_proto::{ProtoError, ResultCode};
use thiserror::Error;

/// What went wrong on one attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The command could not be serialized. Never retried.
    #[error("encode failed: {0}")]
    Encode(ProtoError),

    /// The server sent something the parser could not accept.
    #[error("protocol error: {0}")]
    Protocol(ProtoError),

    /// A socket read or write did not finish in time.
    #[error("socket timeout")]
    SocketTimeout,

    /// The connection failed or was closed by the peer.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server answered with a non-OK result code.
    #[error("server error: {0}")]
    Server(ResultCode),

    /// The node's error rate is above its limit.
    #[error("circuit breaker open: node error rate exceeded")]
    CircuitOpen,

    /// No idle connection was available right now.
    #[error("connection pool empty")]
    PoolEmpty,

    /// The node is at its open-connection limit.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// No active node owns the key or partition.
    #[error("no active node available")]
    NoNode,

    /// The attempt budget is spent.
    #[error("max retries exceeded")]
    MaxRetriesExceeded,

    /// The total timeout elapsed.
    #[error("command timed out")]
    Timeout,

    /// One or more batch node commands failed.
    #[error("batch failed on {failed_nodes} node(s)")]
    Batch {
        /// Number of node commands that failed.
        failed_nodes: usize,
    },
}

/// Error returned by the execution engine, with the chain of earlier attempts.
#[derive(Debug, Clone)]
pub struct ClientError {
    kind: ErrorKind,
    node: Option<String>,
    iteration: u32,
    in_doubt: bool,
    previous: Option<Box<ClientError>>,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

impl ClientError {
    /// New error with no node, iteration or history.
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            node: None,
            iteration: 0,
            in_doubt: false,
            previous: None,
        }
    }

    /// Server error for `code`.
    pub fn server(code: ResultCode) -> Self {
        Self::new(ErrorKind::Server(code))
    }

    /// Encode error.
    pub fn encode(err: ProtoError) -> Self {
        Self::new(ErrorKind::Encode(err))
    }

    /// Record the node the attempt ran against.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Record the attempt number.
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }

    /// Mark whether a write may have been applied.
    pub fn with_in_doubt(mut self, in_doubt: bool) -> Self {
        self.in_doubt = in_doubt;
        self
    }

    /// Link `previous` as the failure that came before this one.
    ///
    /// If this error already has a history, `previous` goes after its
    /// oldest entry.
    pub fn chain(mut self, previous: Option<ClientError>) -> Self {
        if let Some(prev) = previous {
            self.push_oldest(prev);
        }
        self
    }

    fn push_oldest(&mut self, prev: ClientError) {
        match &mut self.previous {
            Some(next) => next.push_oldest(prev),
            None => self.previous = Some(Box::new(prev)),
        }
    }

    /// What went wrong.
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Node of the failed attempt, if one was selected.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Attempt number the error was raised on.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// True if a write may have reached the server.
    pub fn in_doubt(&self) -> bool {
        self.in_doubt
    }

    /// The failure before this one.
    pub fn previous(&self) -> Option<&ClientError> {
        self.previous.as_deref()
    }

    /// This error followed by every earlier one, newest first.
    pub fn history(&self) -> impl Iterator<Item = &ClientError> {
        std::iter::successors(Some(self), |e| e.previous())
    }

    /// Server result code, if the server produced this error.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self.kind {
            ErrorKind::Server(code) => Some(code),
            _ => None,
        }
    }

    /// Timeouts and connection faults.
    pub fn is_network(&self) -> bool {
        matches!(self.kind, ErrorKind::SocketTimeout | ErrorKind::Connection(_))
    }

    /// True if another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match &self.kind {
            ErrorKind::SocketTimeout
            | ErrorKind::Connection(_)
            | ErrorKind::CircuitOpen
            | ErrorKind::PoolEmpty
            | ErrorKind::PoolExhausted
            | ErrorKind::NoNode => true,
            ErrorKind::Server(code) => matches!(
                *code,
                ResultCode::TIMEOUT
                    | ResultCode::KEY_BUSY
                    | ResultCode::DEVICE_OVERLOAD
                    | ResultCode::PARTITION_UNAVAILABLE
            ),
            _ => false,
        }
    }

    /// True if the connection that produced this error is still in a known
    /// state and may go back to the pool.
    ///
    /// A clean server error leaves the stream aligned. Server-side timeouts
    /// and aborted scans may still have data in flight, and anything
    /// network- or parse-related leaves the stream position unknown.
    pub fn keep_connection(&self) -> bool {
        match self.kind {
            ErrorKind::Server(code) => !matches!(
                code,
                ResultCode::TIMEOUT
                    | ResultCode::SCAN_ABORT
                    | ResultCode::QUERY_ABORTED
                    | ResultCode::SERVER_MEM_ERROR
                    | ResultCode::QUERY_TIMEOUT
            ),
            _ => false,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (", self.kind)?;
        if let Some(node) = &self.node {
            write!(f, "node {node}, ")?;
        }
        write!(f, "iteration {}", self.iteration)?;
        if self.in_doubt {
            write!(f, ", in doubt")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.previous
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for ClientError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind)
    }
}

impl From<ProtoError> for ClientError {
    fn from(err: ProtoError) -> Self {
        Self::new(ErrorKind::Protocol(err))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::new(ErrorKind::SocketTimeout),
            _ => Self::new(ErrorKind::Connection(err.to_string())),
        }
    }
}
