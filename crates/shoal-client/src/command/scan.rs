//! Partition scans and secondary-index queries.
//!
//! [`scan`] starts one [`ScanCommand`] per active node, each covering the
//! partitions that node owns, and streams records to the caller through a
//! bounded channel. Scans are one-shot: a network error ends the node's scan
//! instead of retrying it, since a retry would replay records already
//! delivered.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use shoal_proto::key::PARTITIONS;
use shoal_proto::protocol::*;
use shoal_proto::{
    encode_into, CommandHeader, Field, IndexRange, Message, MessageBuffer, ResponseParser, ResultCode, Value, VecSink,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, trace};

use crate::cluster::Cluster;
use crate::command::Record;
use crate::connection::Connection;
use crate::error::{ClientError, ErrorKind, Result};
use crate::executor::{Command, CommandKind, Executor};
use crate::io::{self, ParseContext};
use crate::node::Node;
use crate::policy::{BasePolicy, ScanPolicy};

/// Secondary-index predicate of a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    range: IndexRange,
}

fn serialize(value: &Value) -> Bytes {
    let mut sink = VecSink::new();
    value.write(&mut sink);
    Bytes::from(sink.into_inner())
}

impl Filter {
    /// Records whose `bin` equals `value`.
    pub fn equal(bin: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        let bytes = serialize(&value);
        Self {
            range: IndexRange {
                bin_name: bin.into(),
                particle: value.particle_type(),
                begin: bytes.clone(),
                end: bytes,
            },
        }
    }

    /// Records whose integer `bin` lies in `begin..=end`.
    pub fn range(bin: impl Into<String>, begin: i64, end: i64) -> Self {
        let begin = Value::Int(begin);
        Self {
            range: IndexRange {
                bin_name: bin.into(),
                particle: begin.particle_type(),
                begin: serialize(&begin),
                end: serialize(&Value::Int(end)),
            },
        }
    }

    /// Wire form.
    pub fn index_range(&self) -> &IndexRange {
        &self.range
    }
}

/// What to scan.
#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    /// Namespace.
    pub namespace: String,
    /// Set; empty scans the whole namespace.
    pub set_name: String,
    /// Bins to return; `None` for all.
    pub bins: Option<Vec<String>>,
    /// Index predicate; turns the scan into a query.
    pub filter: Option<Filter>,
}

impl ScanRequest {
    /// Scan every record of `set_name`.
    pub fn new(namespace: impl Into<String>, set_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            ..Default::default()
        }
    }

    /// Only return `bins`.
    pub fn with_bins(mut self, bins: Vec<String>) -> Self {
        self.bins = Some(bins);
        self
    }

    /// Query with `filter`.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Scan of some partitions on one node.
#[derive(Debug)]
pub struct ScanCommand {
    node: Arc<Node>,
    policy: ScanPolicy,
    request: Arc<ScanRequest>,
    partitions: Vec<u16>,
    max_records: u64,
    task_id: u64,
    records: mpsc::Sender<Record>,
    partitions_done: Vec<u16>,
    received: u64,
}

impl ScanCommand {
    /// Scan `partitions` of `node`, sending records to `records`.
    pub fn new(
        node: Arc<Node>,
        policy: &ScanPolicy,
        request: Arc<ScanRequest>,
        partitions: Vec<u16>,
        records: mpsc::Sender<Record>,
    ) -> Self {
        Self {
            node,
            max_records: policy.max_records,
            policy: policy.clone(),
            request,
            partitions,
            task_id: rand::random(),
            records,
            partitions_done: Vec::new(),
            received: 0,
        }
    }

    /// Cap the records this node returns.
    pub fn with_max_records(mut self, max_records: u64) -> Self {
        self.max_records = max_records;
        self
    }

    /// Partitions the server reported complete.
    pub fn partitions_done(&self) -> &[u16] {
        &self.partitions_done
    }

    /// Records delivered so far.
    pub fn received(&self) -> u64 {
        self.received
    }
}

#[async_trait]
impl Command for ScanCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn kind(&self) -> CommandKind {
        if self.request.filter.is_some() {
            CommandKind::Query
        } else {
            CommandKind::Scan
        }
    }

    fn is_one_shot(&self) -> bool {
        true
    }

    fn select_node(&mut self, _cluster: &dyn Cluster) -> Option<Arc<Node>> {
        Some(self.node.clone())
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let base = &self.policy.base;
        let mut info1 = INFO1_READ;
        if !self.policy.include_bin_data {
            info1 |= INFO1_NOBINDATA;
        } else if self.request.bins.is_none() {
            info1 |= INFO1_GET_ALL;
        }
        if base.use_compression {
            info1 |= INFO1_COMPRESS_RESPONSE;
        }
        let header = CommandHeader {
            info1,
            info3: base.read_info3(),
            ..Default::default()
        };

        let mut msg = Message::new(header).field(Field::Namespace(self.request.namespace.clone()));
        if !self.request.set_name.is_empty() {
            msg = msg.field(Field::Set(self.request.set_name.clone()));
        }
        if let Some(filter) = &self.request.filter {
            msg = msg.field(Field::IndexRange(filter.range.clone()));
        }
        msg = msg
            .field(Field::PartitionIds(self.partitions.clone()))
            .field(Field::SocketTimeout(base.socket_timeout_ms.min(u32::MAX as u64) as u32))
            .field(Field::TaskId(self.task_id));
        if self.max_records > 0 {
            msg = msg.field(Field::MaxRecords(self.max_records));
        }
        if self.policy.records_per_second > 0 {
            msg = msg.field(Field::RecordsPerSecond(self.policy.records_per_second));
        }
        if let Some(filter) = &base.filter_expression {
            msg = msg.field(Field::FilterExp(Bytes::from(filter.clone())));
        }
        if let Some(bins) = &self.request.bins {
            if !bins.is_empty() {
                msg = msg.field(Field::BinList(bins.clone()));
            }
        }
        encode_into(&msg, buf, base.use_compression)?;
        Ok(())
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        loop {
            let received = io::read_message(conn, ctx).await?;
            let mut parser = ResponseParser::from_message(received.message())?;
            while let Some(response) = parser.next_record()? {
                let code = response.result_code();
                if response.header.is_last() {
                    return match code {
                        ResultCode::OK | ResultCode::QUERY_END => Ok(()),
                        code => Err(ClientError::server(code)),
                    };
                }
                if response.header.is_partition_done() {
                    if code == ResultCode::OK {
                        self.partitions_done.push(response.header.generation as u16);
                    } else {
                        trace!(node = %self.node.name(), partition = response.header.generation, code = %code, "partition unavailable");
                    }
                    continue;
                }
                if code != ResultCode::OK {
                    return Err(ClientError::server(code));
                }
                self.received += 1;
                if self.records.send(Record::from_response(response, None)).await.is_err() {
                    // The caller stopped listening; the rest of the stream is
                    // unread, so the connection cannot be reused.
                    debug!(node = %self.node.name(), "scan receiver dropped");
                    return Err(ClientError::server(ResultCode::QUERY_ABORTED));
                }
            }
        }
    }
}

/// Totals of a finished scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Nodes scanned.
    pub nodes: usize,
    /// Records delivered.
    pub records: u64,
    /// Partitions reported complete, sorted.
    pub partitions_done: Vec<u16>,
}

/// Records of a running scan.
#[derive(Debug)]
pub struct RecordStream {
    records: mpsc::Receiver<Record>,
    task: JoinHandle<Result<ScanSummary>>,
}

impl RecordStream {
    /// Next record, or `None` once every node finished.
    pub async fn next(&mut self) -> Option<Record> {
        self.records.recv().await
    }

    /// Drain the remaining records and wait for the scan to end.
    pub async fn finish(mut self) -> Result<ScanSummary> {
        while self.records.recv().await.is_some() {}
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(ClientError::new(ErrorKind::Connection(format!("scan task failed: {e}")))),
        }
    }
}

/// Partitions of `namespace` owned by each active node.
fn partitions_by_node(cluster: &dyn Cluster, namespace: &str) -> Vec<(Arc<Node>, Vec<u16>)> {
    let mut owned: Vec<(Arc<Node>, Vec<u16>)> = cluster
        .active_nodes()
        .into_iter()
        .map(|node| (node, Vec::new()))
        .collect();
    for partition in 0..PARTITIONS {
        let Some(owner) = cluster.node_for_partition(namespace, partition, false) else {
            continue;
        };
        if let Some((_, parts)) = owned.iter_mut().find(|(n, _)| n.name() == owner.name()) {
            parts.push(partition as u16);
        }
    }
    owned.retain(|(_, parts)| !parts.is_empty());
    owned
}

/// Start scanning `request` on every node that owns partitions of its
/// namespace.
///
/// `max_records` is split evenly across nodes.
pub fn scan(exec: &Executor, policy: &ScanPolicy, request: ScanRequest) -> RecordStream {
    let (tx, rx) = mpsc::channel(policy.record_queue_size.max(1));
    let exec = exec.clone();
    let policy = policy.clone();
    let task = tokio::spawn(async move { run_scan(exec, policy, Arc::new(request), tx).await });
    RecordStream { records: rx, task }
}

async fn run_scan(
    exec: Executor,
    policy: ScanPolicy,
    request: Arc<ScanRequest>,
    tx: mpsc::Sender<Record>,
) -> Result<ScanSummary> {
    let owned = partitions_by_node(exec.cluster().as_ref(), &request.namespace);
    if owned.is_empty() {
        return Err(ClientError::new(ErrorKind::NoNode));
    }
    let nodes = owned.len();
    let per_node = if policy.max_records == 0 {
        0
    } else {
        policy.max_records.div_ceil(nodes as u64)
    };
    debug!(namespace = %request.namespace, set = %request.set_name, nodes, "scan started");

    let limit = match policy.max_concurrent_nodes {
        0 => nodes,
        n => n,
    };
    let permits = Arc::new(Semaphore::new(limit));
    let mut tasks = JoinSet::new();
    for (node, partitions) in owned {
        let cmd = ScanCommand::new(node, &policy, request.clone(), partitions, tx.clone()).with_max_records(per_node);
        let exec = exec.clone();
        let permits = permits.clone();
        tasks.spawn(async move {
            let _permit = permits.acquire_owned().await;
            let mut cmd = cmd;
            let result = exec.execute(&mut cmd).await;
            (cmd, result)
        });
    }
    drop(tx);

    let mut summary = ScanSummary {
        nodes,
        ..Default::default()
    };
    let mut errors: Vec<ClientError> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((cmd, result)) => {
                summary.records += cmd.received;
                summary.partitions_done.extend_from_slice(&cmd.partitions_done);
                if let Err(e) = result {
                    errors.push(e);
                }
            }
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => errors.push(ClientError::new(ErrorKind::Connection(format!("scan task failed: {e}")))),
        }
    }
    summary.partitions_done.sort_unstable();

    let mut errors = errors.into_iter();
    match errors.next() {
        None => Ok(summary),
        Some(first) => Err(errors.fold(first, |acc, e| acc.chain(Some(e)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::ErrorRateConfig;
    use crate::cluster::StaticCluster;
    use shoal_proto::BufferPool;

    #[test]
    fn test_filter_equal_and_range() {
        let eq = Filter::equal("age", 30i64);
        assert_eq!(eq.index_range().begin, eq.index_range().end);
        assert_eq!(eq.index_range().begin.len(), 8);

        let range = Filter::range("age", 1, 9);
        assert_eq!(&range.index_range().end[..], &9i64.to_be_bytes());
    }

    #[test]
    fn test_partitions_split_between_nodes() {
        let cluster = StaticCluster::new(vec![
            Arc::new(Node::new("A", "a:1", ErrorRateConfig::default())),
            Arc::new(Node::new("B", "b:1", ErrorRateConfig::default())),
        ]);
        let owned = partitions_by_node(&cluster, "test");
        assert_eq!(owned.len(), 2);
        assert_eq!(owned[0].1.len() + owned[1].1.len(), PARTITIONS as usize);

        cluster.assign_all("B");
        let owned = partitions_by_node(&cluster, "test");
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].0.name(), "B");
    }

    #[test]
    fn test_scan_message_fields() {
        let (tx, _rx) = mpsc::channel(1);
        let node = Arc::new(Node::new("A", "a:1", ErrorRateConfig::default()));
        let request = ScanRequest::new("test", "demo").with_filter(Filter::equal("k", "v"));
        let mut cmd = ScanCommand::new(node, &ScanPolicy::default(), Arc::new(request), vec![1, 2], tx);
        assert!(cmd.is_one_shot());
        assert_eq!(cmd.kind(), CommandKind::Query);

        let mut buf = MessageBuffer::new(BufferPool::with_defaults());
        cmd.write_buffer(&mut buf).unwrap();
        let msg = Message::decode(buf.wire()).unwrap();
        assert_eq!(msg.header.info1, INFO1_READ | INFO1_GET_ALL);
        assert!(msg.fields.contains(&Field::PartitionIds(vec![1, 2])));
        assert!(msg.fields.iter().any(|f| matches!(f, Field::IndexRange(_))));
        assert!(!msg.fields.iter().any(|f| matches!(f, Field::MaxRecords(_))));
    }
}
