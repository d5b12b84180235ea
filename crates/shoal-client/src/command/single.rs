//! Single-record commands.

use std::sync::Arc;

use async_trait::async_trait;
use shoal_proto::protocol::*;
use shoal_proto::{encode_into, CommandHeader, Key, MessageBuffer, Message, Operation, ResponseRecord, ResultCode, Value};

use crate::cluster::Cluster;
use crate::command::{key_fields, read_single, Record};
use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::executor::{Command, CommandKind};
use crate::io::ParseContext;
use crate::node::Node;
use crate::policy::{BasePolicy, WritePolicy};

/// Which bins a read returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadBins {
    /// Every bin.
    #[default]
    All,
    /// The named bins.
    Named(Vec<String>),
    /// Generation and expiration only.
    Header,
}

fn encode(msg: Message, policy: &BasePolicy, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
    encode_into(&msg, buf, policy.use_compression)?;
    Ok(())
}

fn write_header(policy: &WritePolicy) -> CommandHeader {
    CommandHeader {
        info1: if policy.base.use_compression {
            INFO1_COMPRESS_RESPONSE
        } else {
            0
        },
        info2: policy.write_info2(),
        info3: policy.write_info3(),
        generation: policy.header_generation(),
        expiration: policy.expiration,
        ..Default::default()
    }
}

fn after_write(policy: &BasePolicy, key: &Key, record: &ResponseRecord) {
    if let Some(txn) = &policy.txn {
        txn.on_write(key, record.version);
    }
}

fn after_read(policy: &BasePolicy, key: &Key, record: &ResponseRecord) {
    if let (Some(txn), Some(version)) = (&policy.txn, record.version) {
        txn.on_read(key, Some(version));
    }
}

/// Read one record.
#[derive(Debug)]
pub struct ReadCommand {
    policy: BasePolicy,
    key: Key,
    bins: ReadBins,
    record: Option<Record>,
}

impl ReadCommand {
    /// Read every bin of `key`.
    pub fn new(policy: &BasePolicy, key: Key) -> Self {
        Self {
            policy: policy.clone(),
            key,
            bins: ReadBins::All,
            record: None,
        }
    }

    /// Choose which bins to return.
    pub fn with_bins(mut self, bins: ReadBins) -> Self {
        self.bins = bins;
        self
    }

    /// The record, once the command succeeded and the key existed.
    pub fn record(&self) -> Option<&Record> {
        self.record.as_ref()
    }

    /// Take the record.
    pub fn into_record(self) -> Option<Record> {
        self.record
    }
}

#[async_trait]
impl Command for ReadCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Read
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, false)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let mut header = CommandHeader {
            info1: self.policy.read_info1(),
            info3: self.policy.read_info3(),
            ..Default::default()
        };
        let mut msg = Message::default();
        match &self.bins {
            ReadBins::All => header.info1 |= INFO1_GET_ALL,
            ReadBins::Header => header.info1 |= INFO1_NOBINDATA,
            ReadBins::Named(names) => msg.ops = names.iter().map(Operation::get).collect(),
        }
        msg.header = header;
        msg.fields = key_fields(&self.key, &self.policy, false);
        encode(msg, &self.policy, buf)
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        let response = read_single(conn, ctx).await?;
        match response.result_code() {
            ResultCode::OK => {
                after_read(&self.policy, &self.key, &response);
                self.record = Some(Record::from_response(response, Some(self.key.clone())));
                Ok(())
            }
            ResultCode::KEY_NOT_FOUND => {
                self.record = None;
                Ok(())
            }
            code => Err(ClientError::server(code)),
        }
    }
}

/// Check that a record exists.
#[derive(Debug)]
pub struct ExistsCommand {
    policy: BasePolicy,
    key: Key,
    exists: bool,
}

impl ExistsCommand {
    /// Existence check for `key`.
    pub fn new(policy: &BasePolicy, key: Key) -> Self {
        Self {
            policy: policy.clone(),
            key,
            exists: false,
        }
    }

    /// Result of the last successful run.
    pub fn exists(&self) -> bool {
        self.exists
    }
}

#[async_trait]
impl Command for ExistsCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Exists
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, false)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let header = CommandHeader {
            info1: self.policy.read_info1() | INFO1_NOBINDATA,
            info3: self.policy.read_info3(),
            ..Default::default()
        };
        let msg = Message {
            header,
            fields: key_fields(&self.key, &self.policy, false),
            ops: Vec::new(),
        };
        encode(msg, &self.policy, buf)
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        let response = read_single(conn, ctx).await?;
        match response.result_code() {
            ResultCode::OK => {
                after_read(&self.policy, &self.key, &response);
                self.exists = true;
                Ok(())
            }
            ResultCode::KEY_NOT_FOUND => {
                self.exists = false;
                Ok(())
            }
            code => Err(ClientError::server(code)),
        }
    }
}

/// Write bins to one record.
#[derive(Debug)]
pub struct WriteCommand {
    policy: WritePolicy,
    key: Key,
    bins: Vec<(String, Value)>,
}

impl WriteCommand {
    /// Put `bins` on `key`.
    pub fn new(policy: &WritePolicy, key: Key, bins: Vec<(String, Value)>) -> Self {
        Self {
            policy: policy.clone(),
            key,
            bins,
        }
    }
}

#[async_trait]
impl Command for WriteCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Write
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, true)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let msg = Message {
            header: write_header(&self.policy),
            fields: key_fields(&self.key, &self.policy.base, true),
            ops: self
                .bins
                .iter()
                .map(|(name, value)| Operation::put(name.clone(), value.clone()))
                .collect(),
        };
        encode(msg, &self.policy.base, buf)
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        let response = read_single(conn, ctx).await?;
        match response.result_code() {
            ResultCode::OK => {
                after_write(&self.policy.base, &self.key, &response);
                Ok(())
            }
            code => Err(ClientError::server(code)),
        }
    }
}

/// Delete one record.
#[derive(Debug)]
pub struct DeleteCommand {
    policy: WritePolicy,
    key: Key,
    existed: bool,
}

impl DeleteCommand {
    /// Delete `key`.
    pub fn new(policy: &WritePolicy, key: Key) -> Self {
        Self {
            policy: policy.clone(),
            key,
            existed: false,
        }
    }

    /// True if the record was there to delete.
    pub fn existed(&self) -> bool {
        self.existed
    }
}

#[async_trait]
impl Command for DeleteCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Delete
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, true)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let mut header = write_header(&self.policy);
        header.info2 |= INFO2_DELETE;
        let msg = Message {
            header,
            fields: key_fields(&self.key, &self.policy.base, true),
            ops: Vec::new(),
        };
        encode(msg, &self.policy.base, buf)
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        let response = read_single(conn, ctx).await?;
        match response.result_code() {
            ResultCode::OK => {
                after_write(&self.policy.base, &self.key, &response);
                self.existed = true;
                Ok(())
            }
            ResultCode::KEY_NOT_FOUND => {
                self.existed = false;
                Ok(())
            }
            code => Err(ClientError::server(code)),
        }
    }
}

/// Reset a record's time to live.
#[derive(Debug)]
pub struct TouchCommand {
    policy: WritePolicy,
    key: Key,
}

impl TouchCommand {
    /// Touch `key` with the policy's expiration.
    pub fn new(policy: &WritePolicy, key: Key) -> Self {
        Self {
            policy: policy.clone(),
            key,
        }
    }
}

#[async_trait]
impl Command for TouchCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Touch
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, true)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let msg = Message::new(write_header(&self.policy)).op(Operation::touch());
        let msg = Message {
            fields: key_fields(&self.key, &self.policy.base, true),
            ..msg
        };
        encode(msg, &self.policy.base, buf)
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        let response = read_single(conn, ctx).await?;
        match response.result_code() {
            ResultCode::OK => {
                after_write(&self.policy.base, &self.key, &response);
                Ok(())
            }
            code => Err(ClientError::server(code)),
        }
    }
}

/// Several operations on one record, applied atomically by the server.
///
/// Write operations make the whole command a write; their results come back
/// one per operation, in order.
#[derive(Debug)]
pub struct OperateCommand {
    policy: WritePolicy,
    key: Key,
    ops: Vec<Operation>,
    has_write: bool,
    record: Option<Record>,
}

impl OperateCommand {
    /// Apply `ops` to `key`.
    pub fn new(policy: &WritePolicy, key: Key, ops: Vec<Operation>) -> Self {
        let has_write = ops.iter().any(Operation::is_write);
        Self {
            policy: policy.clone(),
            key,
            ops,
            has_write,
            record: None,
        }
    }

    /// Values returned by read operations.
    pub fn record(&self) -> Option<&Record> {
        self.record.as_ref()
    }

    /// Take the returned record.
    pub fn into_record(self) -> Option<Record> {
        self.record
    }
}

#[async_trait]
impl Command for OperateCommand {
    fn policy(&self) -> &BasePolicy {
        &self.policy.base
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Operate
    }

    fn is_read(&self) -> bool {
        !self.has_write
    }

    fn select_node(&mut self, cluster: &dyn Cluster) -> Option<Arc<Node>> {
        cluster.node_for_key(&self.key, self.has_write)
    }

    fn write_buffer(&mut self, buf: &mut MessageBuffer) -> shoal_proto::Result<()> {
        let has_read = self.ops.iter().any(|op| !op.is_write());
        let mut header = if self.has_write {
            let mut header = write_header(&self.policy);
            header.info2 |= INFO2_RESPOND_ALL_OPS;
            header
        } else {
            CommandHeader {
                info3: self.policy.base.read_info3(),
                ..Default::default()
            }
        };
        if has_read {
            header.info1 |= self.policy.base.read_info1();
        }
        let msg = Message {
            header,
            fields: key_fields(&self.key, &self.policy.base, self.has_write),
            ops: self.ops.clone(),
        };
        encode(msg, &self.policy.base, buf)
    }

    async fn parse_result(&mut self, conn: &mut dyn Connection, ctx: &ParseContext) -> Result<()> {
        let response = read_single(conn, ctx).await?;
        match response.result_code() {
            ResultCode::OK => {
                if self.has_write {
                    after_write(&self.policy.base, &self.key, &response);
                } else {
                    after_read(&self.policy.base, &self.key, &response);
                }
                self.record = Some(Record::from_response(response, Some(self.key.clone())));
                Ok(())
            }
            ResultCode::KEY_NOT_FOUND if !self.has_write => {
                self.record = None;
                Ok(())
            }
            code => Err(ClientError::server(code)),
        }
    }
}
