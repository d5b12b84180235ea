//! Multi-record transactions.
//!
//! A [`Txn`] rides along in [`BasePolicy::txn`]. Commands that run inside
//! it send the transaction id, and the versions of records read so far, and
//! report back what they read and wrote. [`Txn::commit`] then verifies the
//! reads and rolls the writes forward, or rolls them back if a read no
//! longer holds.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use shoal_proto::protocol::*;
use shoal_proto::{encode_into, CommandHeader, Field, Key, Message, MessageBuffer, ResultCode};
use tracing::{debug, info};

use crate::cluster::Cluster;
use crate::command::batch::{execute_batch, BatchOp, BatchRecord};
use crate::command::read_single;
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::executor::{Command, CommandKind, Executor};
use crate::io::ParseContext;
use crate::node::Node;
use crate::policy::{BasePolicy, BatchPolicy};

type RecordId = (String, [u8; DIGEST_SIZE]);

fn record_id(key: &Key) -> RecordId {
    (key.namespace.clone(), key.digest)
}

/// How a commit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// Reads verified and writes rolled forward.
    Committed,
    /// A read no longer held; writes were rolled back.
    Aborted,
}

/// Transaction state shared by the commands that run inside it.
#[derive(Debug)]
pub struct Txn {
    id: u64,
    deadline: AtomicU32,
    reads: DashMap<RecordId, (Key, u64)>,
    writes: DashMap<RecordId, Key>,
}

impl Default for Txn {
    fn default() -> Self {
        Self::new()
    }
}

impl Txn {
    /// New transaction with a random non-zero id.
    pub fn new() -> Self {
        let mut id = 0;
        while id == 0 {
            id = rand::random::<u64>();
        }
        Self::with_id(id)
    }

    /// Transaction with a caller-chosen id.
    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            deadline: AtomicU32::new(0),
            reads: DashMap::new(),
            writes: DashMap::new(),
        }
    }

    /// Transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server deadline; 0 until the server assigned one.
    pub fn deadline(&self) -> u32 {
        self.deadline.load(Ordering::Acquire)
    }

    /// Record the server-assigned deadline.
    pub fn set_deadline(&self, deadline: u32) {
        self.deadline.store(deadline, Ordering::Release);
    }

    /// Record that `key` was read at `version`.
    pub fn on_read(&self, key: &Key, version: Option<u64>) {
        if let Some(version) = version {
            self.reads.insert(record_id(key), (key.clone(), version));
        }
    }

    /// Version `key` was read at, if it was read.
    pub fn read_version(&self, key: &Key) -> Option<u64> {
        self.reads.get(&record_id(key)).map(|entry| entry.1)
    }

    /// Record that `key` was written. A returned version replaces the read
    /// version; otherwise the key no longer needs verifying.
    pub fn on_write(&self, key: &Key, version: Option<u64>) {
        let id = record_id(key);
        match version {
            Some(version) => {
                self.reads.insert(id.clone(), (key.clone(), version));
            }
            None => {
                self.reads.remove(&id);
            }
        }
        self.writes.insert(id, key.clone());
    }

    /// Keys read, with their versions.
    pub fn reads(&self) -> Vec<(Key, u64)> {
        self.reads.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Keys written.
    pub fn writes(&self) -> Vec<Key> {
        self.writes.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Verify every read, then roll every write forward.
    ///
    /// If a read no longer matches its version the writes are rolled back
    /// instead and the outcome is [`TxnOutcome::Aborted`].
    pub async fn commit(self: &Arc<Self>, exec: &Executor, policy: &BatchPolicy) -> Result<TxnOutcome> {
        let policy = self.policy(policy);

        let mut verify: Vec<BatchRecord> = self
            .reads()
            .into_iter()
            .map(|(key, version)| BatchRecord::new(key, BatchOp::TxnVerify(version)))
            .collect();
        let verified = if verify.is_empty() {
            true
        } else {
            match execute_batch(exec, &policy, &mut verify).await {
                Ok(()) => verify.iter().all(|r| r.result_code == Some(ResultCode::OK)),
                Err(e) => {
                    debug!(txn = self.id, error = %e, "transaction verify failed");
                    false
                }
            }
        };

        if !verified {
            self.roll(exec, &policy, false).await?;
            info!(txn = self.id, "transaction aborted");
            return Ok(TxnOutcome::Aborted);
        }
        self.roll(exec, &policy, true).await?;
        info!(txn = self.id, writes = self.writes.len(), "transaction committed");
        Ok(TxnOutcome::Committed)
    }

    /// Roll every write back.
    pub async fn abort(self: &Arc<Self>, exec: &Executor, policy: &BatchPolicy) -> Result<()> {
        let policy = self.policy(policy);
        self.roll(exec, &policy, false).await
    }

    fn policy(self: &Arc<Self>, policy: &BatchPolicy) -> BatchPolicy {
        let mut policy = policy.clone();
        policy.base.txn = Some(self.clone());
        policy
    }

    async fn roll(&self, exec: &Executor, policy: &BatchPolicy, forward: bool) -> Result<()> {
        let mut records: Vec<BatchRecord> = self
            .writes()
            .into_iter()
            .map(|key| BatchRecord::new(key, BatchOp::TxnRoll(forward)))
            .collect();
        if records.is_empty() {
            return Ok(());
        }
        execute_batch(exec, policy, &mut records).await?;
        match records.iter().find_map(|r| r.result_code.filter(|c| *c != ResultCode::OK)) {
            Some(code) => Err(ClientError::server(code)),
            None => Ok(()),
        }
    }
}

fn txn_fields(key: &Key, txn: &Txn) -> Vec<Field> {
    vec![
        Field::Namespace(key.namespace.clone()),
        Field::Set(key.set_name.clone()),
        Field::Digest(key.digest),
        Field::TxnId(txn.id()),
    ]
}

/// Check that one record is still at the version a transaction read.
#[derive(Debug)]
pub struct TxnVerifyCommand {
    policy: BasePolicy,
    txn: Arc<Txn>,
    key: Key,
    version: u64,
}

impl TxnVerifyCommand {
    /// Verify `key` is still at `version`.
    pub fn new(policy: &BasePolicy, txn: Arc<Txn>, key: Key, version: u64) -> Self {
        Self {
            policy: policy.clone(),
            txn,
            key,
            version,
        }
    }
}

#[async_trait]
impl Command for TxnVerifyCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy
    }

    fn kind(&self) -> CommandKind {
        CommandKind::TxnVerify
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, false)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let header = CommandHeader {
            info1: INFO1_READ | INFO1_NOBINDATA,
            info3: INFO3_SC_READ_TYPE,
            info4: INFO4_TXN_VERIFY_READ,
            ..Default::default()
        };
        let mut fields = txn_fields(&self.key, &self.txn);
        fields.push(Field::RecordVersion(self.version));
        encode_into(&Message { header, fields, ops: Vec::new() }, buf, false)?;
        Ok(())
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        match read_single(conn, ctx).await?.result_code() {
            ResultCode::OK => Ok(()),
            code => Err(ClientError::server(code)),
        }
    }
}

/// Roll one record of a transaction forward or back.
#[derive(Debug)]
pub struct TxnRollCommand {
    policy: BasePolicy,
    txn: Arc<Txn>,
    key: Key,
    forward: bool,
}

impl TxnRollCommand {
    /// Roll `key` forward (`true`) or back.
    pub fn new(policy: &BasePolicy, txn: Arc<Txn>, key: Key, forward: bool) -> Self {
        Self {
            policy: policy.clone(),
            txn,
            key,
            forward,
        }
    }
}

#[async_trait]
impl Command for TxnRollCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy
    }

    fn kind(&self) -> CommandKind {
        CommandKind::TxnRoll
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, true)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let header = CommandHeader {
            info2: INFO2_WRITE | INFO2_DURABLE_DELETE,
            info4: if self.forward {
                INFO4_TXN_ROLL_FORWARD
            } else {
                INFO4_TXN_ROLL_BACK
            },
            ..Default::default()
        };
        let fields = txn_fields(&self.key, &self.txn);
        encode_into(&Message { header, fields, ops: Vec::new() }, buf, false)?;
        Ok(())
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        match read_single(conn, ctx).await?.result_code() {
            ResultCode::OK | ResultCode::KEY_NOT_FOUND => Ok(()),
            code => Err(ClientError::server(code)),
        }
    }
}
