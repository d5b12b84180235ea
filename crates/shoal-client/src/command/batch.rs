//! Multi-key batches.
//!
//! [`execute_batch`] groups the caller's records by owning node, sends one
//! [`BatchNodeCommand`] per node, and writes each per-key outcome back into
//! the caller's slice. Per-key server codes such as "not found" stay on the
//! record; only failures of a whole node command become errors.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use shoal_proto::protocol::*;
use shoal_proto::{
    encode_into, BatchAttr, BatchEntry, BatchFlags, BatchMessage, BatchTxn, Key, MessageBuffer, Operation,
    ResponseParser, ResultCode,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::cluster::Cluster;
use crate::command::Record;
use crate::connection::Connection;
use crate::deadline::CommandDeadline;
use crate::error::{ClientError, ErrorKind, Result};
use crate::executor::{Command, CommandKind, Executor, RetryAction, RetryState};
use crate::io::{self, ParseContext};
use crate::node::Node;
use crate::policy::{BasePolicy, BatchPolicy};

/// What to do with one key.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOp {
    /// Read every bin, or the named ones.
    Read {
        /// Bins to return; `None` for all.
        bins: Option<Vec<String>>,
    },
    /// Read generation and expiration only.
    ReadHeader,
    /// Apply operations; any write operation makes the entry a write.
    Write(Vec<Operation>),
    /// Delete the record.
    Delete,
    /// Verify the record is still at this version.
    TxnVerify(u64),
    /// Roll a transaction's write forward (`true`) or back.
    TxnRoll(bool),
}

/// One key of a batch and, after execution, its outcome.
#[derive(Debug, Clone)]
pub struct BatchRecord {
    /// Key.
    pub key: Key,
    /// Requested operation.
    pub op: BatchOp,
    /// Returned record, when the server sent one.
    pub record: Option<Record>,
    /// Per-key result code; `None` if the key's node command failed.
    pub result_code: Option<ResultCode>,
    /// True if a write may have been applied although its node command failed.
    pub in_doubt: bool,
}

impl BatchRecord {
    /// Record for `key` with no outcome yet.
    pub fn new(key: Key, op: BatchOp) -> Self {
        Self {
            key,
            op,
            record: None,
            result_code: None,
            in_doubt: false,
        }
    }

    /// Read every bin of `key`.
    pub fn read(key: Key) -> Self {
        Self::new(key, BatchOp::Read { bins: None })
    }

    /// True if the operation modifies the record.
    pub fn is_write(&self) -> bool {
        match &self.op {
            BatchOp::Write(ops) => ops.iter().any(Operation::is_write),
            BatchOp::Delete | BatchOp::TxnRoll(_) => true,
            BatchOp::Read { .. } | BatchOp::ReadHeader | BatchOp::TxnVerify(_) => false,
        }
    }

    fn entry(&self, index: u32, policy: &BasePolicy) -> BatchEntry {
        let read_attr = |attr: BatchAttr| BatchAttr {
            info1: attr.info1 | (policy.read_info1() & INFO1_READ_MODE_AP_ALL),
            info3: attr.info3 | policy.read_info3(),
            ..attr
        };
        let (attr, ops) = match &self.op {
            BatchOp::Read { bins: None } => (read_attr(BatchAttr::read_all()), Vec::new()),
            BatchOp::Read { bins: Some(bins) } => (
                read_attr(BatchAttr::read_bins()),
                bins.iter().map(Operation::get).collect(),
            ),
            BatchOp::ReadHeader => (read_attr(BatchAttr::read_header()), Vec::new()),
            BatchOp::Write(ops) if self.is_write() => (BatchAttr::write(None, 0), ops.clone()),
            BatchOp::Write(ops) => (read_attr(BatchAttr::read_bins()), ops.clone()),
            BatchOp::Delete => (BatchAttr::delete(), Vec::new()),
            BatchOp::TxnVerify(_) => (BatchAttr::txn_verify(), Vec::new()),
            BatchOp::TxnRoll(forward) => (BatchAttr::txn_roll(*forward), Vec::new()),
        };
        let version = match self.op {
            BatchOp::TxnVerify(version) => Some(version),
            BatchOp::TxnRoll(_) => None,
            _ => policy.txn.as_ref().and_then(|txn| txn.read_version(&self.key)),
        };
        BatchEntry {
            version,
            ..BatchEntry::new(index, self.key.clone(), attr.with_send_key(policy.send_key)).with_ops(ops)
        }
    }
}

/// Outcome of one key as parsed from a node's response.
#[derive(Debug, Clone)]
struct KeyResult {
    index: u32,
    code: ResultCode,
    record: Option<Record>,
}

/// The part of a batch that one node owns.
#[derive(Debug)]
pub struct BatchNodeCommand {
    node: Arc<Node>,
    policy: BatchPolicy,
    entries: Vec<BatchEntry>,
    has_write: bool,
    results: Vec<KeyResult>,
}

impl BatchNodeCommand {
    /// Command for `entries`, all owned by `node`.
    pub fn new(node: Arc<Node>, policy: &BatchPolicy, entries: Vec<BatchEntry>, has_write: bool) -> Self {
        Self {
            node,
            policy: policy.clone(),
            entries,
            has_write,
            results: Vec::new(),
        }
    }

    /// Node the command currently targets.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// Entries, in send order.
    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    /// Regroup the entries under the current topology.
    ///
    /// Returns `None` if some key has no active owner.
    fn regroup(&self, cluster: &dyn Cluster) -> Option<Vec<BatchNodeCommand>> {
        let groups = group_by_node(
            cluster,
            self.entries.iter().map(|e| (e.key.clone(), self.has_write, e.clone())),
        )
        .ok()?;
        Some(
            groups
                .into_iter()
                .map(|(node, entries)| BatchNodeCommand::new(node, &self.policy, entries, self.has_write))
                .collect(),
        )
    }
}

#[async_trait]
impl Command for BatchNodeCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Batch
    }

    fn is_read(&self) -> bool {
        !self.has_write
    }

    fn select_node(&mut self, _cluster: &dyn Cluster) -> Option<Arc<Node>> {
        Some(self.node.clone())
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let base = &self.policy.base;
        let mut msg = BatchMessage::new(self.entries.iter().collect());
        if base.use_compression {
            msg.info1 |= INFO1_COMPRESS_RESPONSE;
        }
        msg.flags = BatchFlags {
            allow_inline: self.policy.allow_inline,
            allow_inline_ssd: self.policy.allow_inline_ssd,
            respond_all_keys: self.policy.respond_all_keys,
        };
        msg.filter = base.filter_expression.clone().map(Bytes::from);
        msg.txn = base.txn.as_ref().map(|txn| BatchTxn {
            id: txn.id(),
            deadline: txn.deadline(),
        });
        encode_into(&msg, buf, base.use_compression)?;
        Ok(())
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        self.results.clear();
        loop {
            let received = io::read_message(conn, ctx).await?;
            let mut parser = ResponseParser::from_message(received.message())?;
            while let Some(response) = parser.next_record()? {
                if response.header.is_last() {
                    return match response.result_code() {
                        ResultCode::OK => Ok(()),
                        code => Err(ClientError::server(code)),
                    };
                }
                let code = response.result_code();
                let index = response.header.batch_index;
                let record = (code == ResultCode::OK).then(|| Record::from_response(response, None));
                self.results.push(KeyResult { index, code, record });
            }
        }
    }

    async fn prepare_retry(
        &mut self,
        exec: &Executor,
        deadline: &CommandDeadline,
        state: &RetryState,
    ) -> RetryAction {
        let Some(mut groups) = self.regroup(exec.cluster().as_ref()) else {
            return RetryAction::Continue;
        };
        if groups.len() == 1 {
            if let Some(group) = groups.pop() {
                if group.node.name() != self.node.name() {
                    debug!(from = %self.node.name(), to = %group.node.name(), "batch keys moved node");
                    self.node = group.node;
                }
            }
            return RetryAction::Continue;
        }

        debug!(
            node = %self.node.name(),
            parts = groups.len(),
            iteration = state.iteration,
            "splitting batch retry by node"
        );
        self.results.clear();
        let resume = Some((*deadline, *state));
        let outcomes = if self.policy.concurrent_nodes == 1 {
            run_sequential(exec, groups, self.policy.allow_partial_results, resume).await
        } else {
            match run_concurrent(exec, groups, self.policy.concurrent_nodes, resume).await {
                Ok(outcomes) => outcomes,
                Err(e) => return RetryAction::Done(Err(e)),
            }
        };

        let mut errors = Vec::new();
        for (mut sub, result) in outcomes {
            self.results.append(&mut sub.results);
            if let Err(e) = result {
                errors.push(e);
            }
        }
        match fold_errors(errors, self.policy.allow_partial_results) {
            Some(err) => RetryAction::Done(Err(err)),
            None => RetryAction::Done(Ok(())),
        }
    }
}

type NodeGroups = Vec<(Arc<Node>, Vec<BatchEntry>)>;

/// Group entries by owning node, keeping the caller's order within a node.
fn group_by_node(
    cluster: &dyn Cluster,
    entries: impl Iterator<Item = (Key, bool, BatchEntry)>,
) -> std::result::Result<NodeGroups, Key> {
    let mut groups: NodeGroups = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();
    for (key, for_write, entry) in entries {
        let node = cluster.node_for_key(&key, for_write).ok_or(key)?;
        let slot = *by_name.entry(node.name().to_string()).or_insert_with(|| {
            groups.push((node.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(entry);
    }
    Ok(groups)
}

/// Run a batch over `records`, filling in each record's outcome.
///
/// With `allow_partial_results` every node command runs to completion and a
/// failure of any of them yields [`ErrorKind::Batch`] chained to each node's
/// error; the records of successful nodes are still filled in. Otherwise the
/// first node failure is returned as is.
pub async fn execute_batch(exec: &Executor, policy: &BatchPolicy, records: &mut [BatchRecord]) -> Result<()> {
    let any_write = records.iter().any(BatchRecord::is_write);
    let entries = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.key.clone(), any_write, r.entry(i as u32, &policy.base)));
    let groups = group_by_node(exec.cluster().as_ref(), entries).map_err(|key| {
        debug!(key = ?key, "no active node for batch key");
        ClientError::new(ErrorKind::NoNode)
    })?;

    let commands: Vec<BatchNodeCommand> = groups
        .into_iter()
        .map(|(node, entries)| {
            let has_write = entries.iter().any(|e| e.attr.has_write);
            BatchNodeCommand::new(node, policy, entries, has_write)
        })
        .collect();
    debug!(keys = records.len(), nodes = commands.len(), "batch grouped");

    let outcomes = if policy.concurrent_nodes == 1 || commands.len() == 1 {
        run_sequential(exec, commands, policy.allow_partial_results, None).await
    } else {
        run_concurrent(exec, commands, policy.concurrent_nodes, None).await?
    };

    let mut errors = Vec::new();
    for (cmd, result) in outcomes {
        for KeyResult { index, code, record } in cmd.results {
            if let Some(target) = records.get_mut(index as usize) {
                if let (Some(txn), Some(record)) = (&policy.base.txn, &record) {
                    if target.is_write() {
                        txn.on_write(&target.key, record.version);
                    } else if record.version.is_some() {
                        txn.on_read(&target.key, record.version);
                    }
                }
                target.result_code = Some(code);
                target.record = record.map(|r| Record {
                    key: Some(target.key.clone()),
                    ..r
                });
            }
        }
        if let Err(err) = result {
            if err.in_doubt() {
                for entry in cmd.entries.iter().filter(|e| e.attr.has_write) {
                    if let Some(target) = records.get_mut(entry.index as usize) {
                        if target.result_code.is_none() {
                            target.in_doubt = true;
                        }
                    }
                }
            }
            errors.push(err);
        }
    }

    match fold_errors(errors, policy.allow_partial_results) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Collapse per-node failures into the batch outcome.
///
/// Without partial results the first failure stands alone. Otherwise the
/// result is [`ErrorKind::Batch`] chained to every failure, counting the
/// nodes behind an already folded batch error individually.
fn fold_errors(mut errors: Vec<ClientError>, allow_partial: bool) -> Option<ClientError> {
    if errors.is_empty() {
        return None;
    }
    if !allow_partial {
        return Some(errors.swap_remove(0));
    }
    let failed_nodes = errors
        .iter()
        .map(|err| match err.kind() {
            ErrorKind::Batch { failed_nodes } => *failed_nodes,
            _ => 1,
        })
        .sum();
    let in_doubt = errors.iter().any(ClientError::in_doubt);
    Some(errors.into_iter().fold(
        ClientError::new(ErrorKind::Batch { failed_nodes }).with_in_doubt(in_doubt),
        |batch, err| batch.chain(Some(err)),
    ))
}

/// Deadline and attempt progress of the retry that split a batch.
type Resume = Option<(CommandDeadline, RetryState)>;

async fn run_one(exec: &Executor, cmd: &mut BatchNodeCommand, resume: Resume) -> Result<()> {
    match resume {
        Some((deadline, seed)) => exec.execute_continued(cmd, deadline, seed).await,
        None => exec.execute(cmd).await,
    }
}

async fn run_sequential(
    exec: &Executor,
    commands: Vec<BatchNodeCommand>,
    allow_partial: bool,
    resume: Resume,
) -> Vec<(BatchNodeCommand, Result<()>)> {
    let mut outcomes = Vec::with_capacity(commands.len());
    for mut cmd in commands {
        let result = run_one(exec, &mut cmd, resume).await;
        let failed = result.is_err();
        outcomes.push((cmd, result));
        if failed && !allow_partial {
            break;
        }
    }
    outcomes
}

async fn run_concurrent(
    exec: &Executor,
    commands: Vec<BatchNodeCommand>,
    concurrent_nodes: usize,
    resume: Resume,
) -> Result<Vec<(BatchNodeCommand, Result<()>)>> {
    let limit = if concurrent_nodes == 0 {
        commands.len()
    } else {
        concurrent_nodes
    };
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    for mut cmd in commands {
        let exec = exec.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let result = run_one(&exec, &mut cmd, resume).await;
            (cmd, result)
        });
    }

    let mut outcomes = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => return Err(ClientError::new(ErrorKind::Connection(format!("batch task failed: {e}")))),
        }
    }
    Ok(outcomes)
}
