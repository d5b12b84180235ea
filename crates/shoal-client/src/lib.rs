#![warn(missing_docs)]

//! Shoal driver core: retry/failover execution engine, policies, batch fan-out, scan streaming
//!
//! Every command runs through [`Executor`], which owns the attempt loop:
//! node selection, circuit-breaker checks, connection acquisition, encoding
//! into a pooled [`shoal_proto::MessageBuffer`], sending under the command
//! deadline, parsing, and classifying failures as retryable or final.
//! Commands themselves only know how to encode a request and read a reply.

pub mod circuit;
pub mod cluster;
pub mod command;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod io;
pub mod mock;
pub mod node;
pub mod policy;
pub mod retry;
pub mod tcp;

pub use circuit::{ErrorRateBreaker, ErrorRateConfig};
pub use cluster::{Cluster, StaticCluster};
pub use command::{
    execute_batch, scan, BatchOp, BatchRecord, DeleteCommand, ExistsCommand, Filter, OperateCommand, ReadBins,
    ReadCommand, Record, RecordStream, ScanRequest, ScanSummary, TouchCommand, Txn, TxnOutcome, WriteCommand,
};
pub use config::ClientConfig;
pub use connection::{AcquireError, Connection, ConnectionPool};
pub use deadline::CommandDeadline;
pub use error::{ClientError, ErrorKind, Result};
pub use executor::{Command, CommandKind, Executor, RetryAction, RetryState};
pub use node::Node;
pub use policy::{BasePolicy, BatchPolicy, ScanPolicy, WritePolicy};
pub use tcp::{TcpConnectionPool, TcpPoolConfig};
