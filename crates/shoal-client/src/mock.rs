//! In-memory connections, pool and server for tests.
//!
//! [`MockPool`] hands out [`MockConnection`]s whose replies come from a
//! responder closure, usually [`MockStore::respond`] wrapped with whatever
//! failures a test wants to inject. Every request written is logged, so
//! tests can count sends and inspect the exact bytes that went out.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shoal_proto::key::partition_id;
use shoal_proto::protocol::*;
use shoal_proto::value::particle;
use shoal_proto::{
    compress_message, decode_batch_request, decompress_message, single_record_response, BufferPool, DecodedEntry,
    Field, IndexRange, Key, Message, MessageType, OperationType, ProtoHeader, ResponseBuilder, ResponseRecord,
    ResultCode, Value, VecSink,
};
use tracing::trace;

use crate::circuit::ErrorRateConfig;
use crate::cluster::StaticCluster;
use crate::connection::{AcquireError, Connection, ConnectionPool};
use crate::executor::Executor;
use crate::node::Node;

fn take(data: &[u8], pos: &mut usize, buf: &mut [u8]) -> io::Result<()> {
    let end = *pos + buf.len();
    let src = data
        .get(*pos..end)
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    buf.copy_from_slice(src);
    *pos = end;
    Ok(())
}

/// A connection that replays fixed bytes, or never answers.
#[derive(Debug)]
pub struct ScriptedStream {
    node: String,
    data: Vec<u8>,
    pos: usize,
    stalled: bool,
    connected: bool,
}

impl ScriptedStream {
    /// Reads return `data`, then fail with end of file.
    pub fn new(node: &str, data: Vec<u8>) -> Self {
        Self {
            node: node.to_string(),
            data,
            pos: 0,
            stalled: false,
            connected: true,
        }
    }

    /// Reads never complete.
    pub fn stalled(node: &str) -> Self {
        Self {
            stalled: true,
            ..Self::new(node, Vec::new())
        }
    }
}

#[async_trait]
impl Connection for ScriptedStream {
    fn node_name(&self) -> &str {
        &self.node
    }

    async fn write_all(&mut self, _buf: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        take(&self.data, &mut self.pos, buf).inspect_err(|_| self.connected = false)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn drain(&mut self, _budget: Duration) -> bool {
        false
    }
}

/// One request as the server saw it.
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// Node it was sent to.
    pub node: String,
    /// Bytes exactly as written.
    pub wire: Vec<u8>,
    /// The plain message, inflated if `wire` was compressed.
    pub message: Vec<u8>,
}

impl MockRequest {
    fn new(node: &str, wire: &[u8]) -> Self {
        let message = match ProtoHeader::decode(wire) {
            Ok(h) if h.msg_type == MessageType::Compressed => {
                decompress_message(wire).unwrap_or_else(|_| wire.to_vec())
            }
            _ => wire.to_vec(),
        };
        Self {
            node: node.to_string(),
            wire: wire.to_vec(),
            message,
        }
    }

    /// True if the request went out compressed.
    pub fn is_compressed(&self) -> bool {
        matches!(ProtoHeader::decode(&self.wire), Ok(h) if h.msg_type == MessageType::Compressed)
    }

    /// Read flags of the command header.
    pub fn info1(&self) -> u8 {
        self.message.get(PROTO_HEADER_SIZE + 1).copied().unwrap_or(0)
    }

    /// True for a batch request.
    pub fn is_batch(&self) -> bool {
        self.info1() & INFO1_BATCH != 0
    }

    /// Decode a single-record or scan request.
    pub fn decode(&self) -> shoal_proto::Result<Message> {
        Message::decode(&self.message)
    }
}

/// What the server does with one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Answer with these bytes.
    Bytes(Vec<u8>),
    /// Fail the write itself.
    WriteError(io::ErrorKind),
    /// Accept the write, then fail the first read.
    ReadError(io::ErrorKind),
    /// Accept the write and never answer.
    Stall,
}

impl MockReply {
    /// Answer with one record.
    pub fn record(record: &ResponseRecord) -> Self {
        match single_record_response(record) {
            Ok(bytes) => MockReply::Bytes(bytes),
            Err(_) => MockReply::ReadError(io::ErrorKind::InvalidData),
        }
    }

    /// Answer with an empty record carrying `code`.
    pub fn code(code: ResultCode) -> Self {
        Self::record(&ResponseRecord::new(code))
    }
}

/// Outcome of one [`ConnectionPool::acquire`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockAcquire {
    /// Hand out a connection.
    Ok,
    /// [`AcquireError::Empty`].
    Empty,
    /// [`AcquireError::Exhausted`].
    Exhausted,
    /// [`AcquireError::Connect`] with connection refused.
    ConnectError,
}

type Responder = dyn Fn(&MockRequest) -> MockReply + Send + Sync;

struct Shared {
    responder: Box<Responder>,
    requests: Mutex<Vec<MockRequest>>,
    acquire_script: Mutex<HashMap<String, VecDeque<MockAcquire>>>,
    drain_succeeds: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
    closed: AtomicUsize,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("requests", &self.requests.lock().len())
            .field("acquired", &self.acquired)
            .field("released", &self.released)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Connection pool backed by a responder closure.
#[derive(Debug)]
pub struct MockPool {
    shared: Arc<Shared>,
}

impl MockPool {
    /// Pool whose connections answer every request with `responder`.
    pub fn new(responder: impl Fn(&MockRequest) -> MockReply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                responder: Box::new(responder),
                requests: Mutex::new(Vec::new()),
                acquire_script: Mutex::new(HashMap::new()),
                drain_succeeds: AtomicBool::new(true),
                acquired: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
            }),
        })
    }

    /// Pool served by `store`.
    pub fn with_store(store: Arc<MockStore>) -> Arc<Self> {
        Self::new(move |req| store.respond(req))
    }

    /// Queue acquire outcomes for `node`; once used up, acquires succeed.
    pub fn script(&self, node: &str, outcomes: impl IntoIterator<Item = MockAcquire>) {
        self.shared
            .acquire_script
            .lock()
            .entry(node.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// Whether draining a connection after a timeout succeeds.
    pub fn set_drain_succeeds(&self, succeeds: bool) {
        self.shared.drain_succeeds.store(succeeds, Ordering::SeqCst);
    }

    /// Every request written so far, in order.
    pub fn requests(&self) -> Vec<MockRequest> {
        self.shared.requests.lock().clone()
    }

    /// Number of writes attempted.
    pub fn sends(&self) -> usize {
        self.shared.requests.lock().len()
    }

    /// Number of writes attempted to `node`.
    pub fn sends_to(&self, node: &str) -> usize {
        self.shared.requests.lock().iter().filter(|r| r.node == node).count()
    }

    /// Connections handed out.
    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(Ordering::SeqCst)
    }

    /// Connections returned healthy.
    pub fn released(&self) -> usize {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Connections discarded.
    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionPool for MockPool {
    async fn acquire(&self, node: &Arc<Node>, _timeout: Duration) -> Result<Box<dyn Connection>, AcquireError> {
        let next = self
            .shared
            .acquire_script
            .lock()
            .get_mut(node.name())
            .and_then(|queue| queue.pop_front());
        match next.unwrap_or(MockAcquire::Ok) {
            MockAcquire::Ok => {
                self.shared.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(MockConnection::new(node.name(), self.shared.clone())))
            }
            MockAcquire::Empty => Err(AcquireError::Empty),
            MockAcquire::Exhausted => Err(AcquireError::Exhausted),
            MockAcquire::ConnectError => Err(AcquireError::Connect(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
        }
    }

    fn release(&self, _conn: Box<dyn Connection>) {
        self.shared.released.fetch_add(1, Ordering::SeqCst);
    }

    fn close(&self, _conn: Box<dyn Connection>) {
        self.shared.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Connection handed out by [`MockPool`].
#[derive(Debug)]
pub struct MockConnection {
    node: String,
    shared: Arc<Shared>,
    pending: Vec<u8>,
    pos: usize,
    read_error: Option<io::ErrorKind>,
    stalled: bool,
    connected: bool,
}

impl MockConnection {
    fn new(node: &str, shared: Arc<Shared>) -> Self {
        Self {
            node: node.to_string(),
            shared,
            pending: Vec::new(),
            pos: 0,
            read_error: None,
            stalled: false,
            connected: true,
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn node_name(&self) -> &str {
        &self.node
    }

    async fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let request = MockRequest::new(&self.node, buf);
        let reply = (self.shared.responder)(&request);
        trace!(node = %self.node, len = buf.len(), "mock request");
        self.shared.requests.lock().push(request);

        self.pending.clear();
        self.pos = 0;
        self.read_error = None;
        self.stalled = false;
        match reply {
            MockReply::Bytes(bytes) => self.pending = bytes,
            MockReply::WriteError(kind) => {
                self.connected = false;
                return Err(kind.into());
            }
            MockReply::ReadError(kind) => self.read_error = Some(kind),
            MockReply::Stall => self.stalled = true,
        }
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        if let Some(kind) = self.read_error.take() {
            self.connected = false;
            return Err(kind.into());
        }
        if self.stalled {
            std::future::pending::<()>().await;
        }
        take(&self.pending, &mut self.pos, buf).inspect_err(|_| self.connected = false)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn drain(&mut self, budget: Duration) -> bool {
        if self.shared.drain_succeeds.load(Ordering::SeqCst) {
            self.pending.clear();
            self.pos = 0;
            self.stalled = false;
            true
        } else {
            tokio::time::sleep(budget).await;
            self.connected = false;
            false
        }
    }
}

/// A record held by [`MockStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    /// Set name.
    pub set_name: String,
    /// User key, if one was sent.
    pub user_key: Option<Value>,
    /// Bins by name.
    pub bins: BTreeMap<String, Value>,
    /// Bumped on every write.
    pub generation: u32,
    /// Expiration of the last write.
    pub expiration: u32,
    /// Store-wide write counter at the last write.
    pub version: u64,
}

type RecordId = (String, [u8; DIGEST_SIZE]);

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<RecordId, StoredRecord>,
    // First pre-image of each record a transaction wrote.
    undo: HashMap<(u64, RecordId), Option<StoredRecord>>,
}

/// One record-level request, from a single command or a batch entry.
struct RecordRequest {
    namespace: String,
    set_name: String,
    digest: [u8; DIGEST_SIZE],
    user_key: Option<Value>,
    header: (u8, u8, u8, u8),
    generation: u32,
    expiration: u32,
    txn_id: Option<u64>,
    version: Option<u64>,
    ops: Vec<shoal_proto::Operation>,
}

impl RecordRequest {
    fn from_message(msg: Message) -> Option<Self> {
        let mut req = RecordRequest {
            namespace: String::new(),
            set_name: String::new(),
            digest: [0; DIGEST_SIZE],
            user_key: None,
            header: (msg.header.info1, msg.header.info2, msg.header.info3, msg.header.info4),
            generation: msg.header.generation,
            expiration: msg.header.expiration,
            txn_id: None,
            version: None,
            ops: msg.ops,
        };
        let mut has_digest = false;
        for field in msg.fields {
            match field {
                Field::Namespace(ns) => req.namespace = ns,
                Field::Set(set) => req.set_name = set,
                Field::Digest(d) => {
                    req.digest = d;
                    has_digest = true;
                }
                Field::UserKey(k) => req.user_key = Some(k),
                Field::TxnId(id) => req.txn_id = Some(id),
                Field::RecordVersion(v) => req.version = Some(v),
                _ => {}
            }
        }
        has_digest.then_some(req)
    }

    fn from_batch(entry: DecodedEntry) -> Self {
        let attr = entry.attr;
        RecordRequest {
            namespace: entry.namespace,
            set_name: entry.set_name,
            digest: entry.digest,
            user_key: entry.user_key,
            header: (attr.info1, attr.info2, attr.info3, attr.info4),
            generation: u32::from(attr.generation),
            expiration: attr.expiration,
            txn_id: entry.txn_id,
            version: entry.version,
            ops: entry.ops,
        }
    }

    fn id(&self) -> RecordId {
        (self.namespace.clone(), self.digest)
    }
}

/// A toy server that keeps records in memory and answers requests the way
/// a real node would, closely enough for the engine and its commands.
#[derive(Debug, Default)]
pub struct MockStore {
    state: Mutex<StoreState>,
    versions: AtomicU64,
}

impl MockStore {
    /// Empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a record.
    pub fn put(&self, key: &Key, bins: Vec<(&str, Value)>) {
        let record = StoredRecord {
            set_name: key.set_name.clone(),
            user_key: key.user_key.clone(),
            bins: bins.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
            generation: 1,
            expiration: 0,
            version: self.next_version(),
        };
        self.state
            .lock()
            .records
            .insert((key.namespace.clone(), key.digest), record);
    }

    /// Record stored under `key`.
    pub fn get(&self, key: &Key) -> Option<StoredRecord> {
        self.state
            .lock()
            .records
            .get(&(key.namespace.clone(), key.digest))
            .cloned()
    }

    /// Records stored.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// True if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Answer `request`, compressing the reply if the request asked for it.
    pub fn respond(&self, request: &MockRequest) -> MockReply {
        let plain = if request.is_batch() {
            self.batch(request)
        } else {
            match request.decode() {
                Ok(msg) if msg.fields.iter().any(|f| matches!(f, Field::PartitionIds(_))) => self.scan(msg),
                Ok(msg) => Ok(self.single(msg)),
                Err(_) => single_record_response(&ResponseRecord::new(ResultCode::PARAMETER_ERROR)),
            }
        };
        let bytes = match plain {
            Ok(bytes) if request.info1() & INFO1_COMPRESS_RESPONSE != 0 => compress_message(&bytes),
            other => other,
        };
        match bytes {
            Ok(bytes) => MockReply::Bytes(bytes),
            Err(_) => MockReply::ReadError(io::ErrorKind::InvalidData),
        }
    }

    fn single(&self, msg: Message) -> Vec<u8> {
        let record = match RecordRequest::from_message(msg) {
            Some(req) => self.apply(&mut self.state.lock(), &req),
            None => ResponseRecord::new(ResultCode::PARAMETER_ERROR),
        };
        match single_record_response(&record) {
            Ok(bytes) => bytes,
            Err(_) => Vec::new(),
        }
    }

    fn batch(&self, request: &MockRequest) -> shoal_proto::Result<Vec<u8>> {
        let batch = decode_batch_request(&request.message)?;
        let mut out = ResponseBuilder::new();
        let mut state = self.state.lock();
        for entry in batch.entries {
            let index = entry.index;
            let mut record = self.apply(&mut state, &RecordRequest::from_batch(entry));
            record.header.batch_index = index;
            out.record(&record)?;
        }
        out.last(ResultCode::OK);
        Ok(out.finish())
    }

    fn scan(&self, msg: Message) -> shoal_proto::Result<Vec<u8>> {
        let mut namespace = String::new();
        let mut set_name = String::new();
        let mut partitions = Vec::new();
        let mut range = None;
        let mut bin_list = None;
        let mut max_records = 0u64;
        for field in msg.fields {
            match field {
                Field::Namespace(ns) => namespace = ns,
                Field::Set(set) => set_name = set,
                Field::PartitionIds(ids) => partitions = ids,
                Field::IndexRange(r) => range = Some(r),
                Field::BinList(bins) => bin_list = Some(bins),
                Field::MaxRecords(n) => max_records = n,
                _ => {}
            }
        }
        let no_bins = msg.header.info1 & INFO1_NOBINDATA != 0;

        let state = self.state.lock();
        let mut matched: Vec<(&RecordId, &StoredRecord)> = state
            .records
            .iter()
            .filter(|((ns, digest), record)| {
                *ns == namespace
                    && (set_name.is_empty() || record.set_name == set_name)
                    && partitions.contains(&(partition_id(digest) as u16))
                    && range.as_ref().map_or(true, |r| in_range(record, r))
            })
            .collect();
        matched.sort_by_key(|((_, digest), _)| *digest);
        if max_records > 0 {
            matched.truncate(max_records as usize);
        }

        let mut out = ResponseBuilder::new();
        for ((ns, digest), stored) in matched {
            let bins = if no_bins {
                Vec::new()
            } else {
                stored
                    .bins
                    .iter()
                    .filter(|(name, _)| bin_list.as_ref().map_or(true, |list| list.contains(*name)))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            };
            let mut record = ResponseRecord::ok(bins);
            record.digest = Some(*digest);
            record.namespace = Some(ns.clone());
            record.set_name = Some(stored.set_name.clone());
            record.header.generation = stored.generation;
            out.record(&record)?;
        }
        for pid in partitions {
            out.partition_done(pid, ResultCode::OK);
        }
        out.last(ResultCode::OK);
        Ok(out.finish())
    }

    fn apply(&self, state: &mut StoreState, req: &RecordRequest) -> ResponseRecord {
        let (_, info2, _, info4) = req.header;
        let id = req.id();

        if info4 & INFO4_TXN_VERIFY_READ != 0 {
            let current = state.records.get(&id).map(|r| r.version);
            return ResponseRecord::new(if current.is_some() && current == req.version {
                ResultCode::OK
            } else {
                ResultCode::TXN_VERSION_MISMATCH
            });
        }
        if info4 & (INFO4_TXN_ROLL_FORWARD | INFO4_TXN_ROLL_BACK) != 0 {
            let Some(txn) = req.txn_id else {
                return ResponseRecord::new(ResultCode::PARAMETER_ERROR);
            };
            let pre_image = state.undo.remove(&(txn, id.clone()));
            if info4 & INFO4_TXN_ROLL_BACK != 0 {
                match pre_image {
                    Some(Some(record)) => {
                        state.records.insert(id, record);
                    }
                    Some(None) => {
                        state.records.remove(&id);
                    }
                    None => {}
                }
            }
            return ResponseRecord::new(ResultCode::OK);
        }
        if info2 & INFO2_WRITE != 0 {
            self.write(state, req, id)
        } else {
            read(state, req, &id)
        }
    }

    fn write(&self, state: &mut StoreState, req: &RecordRequest, id: RecordId) -> ResponseRecord {
        let (_, info2, info3, _) = req.header;
        let existing = state.records.get(&id).cloned();

        if info2 & INFO2_DELETE != 0 && existing.is_none() {
            return ResponseRecord::new(ResultCode::KEY_NOT_FOUND);
        }
        if info2 & INFO2_CREATE_ONLY != 0 && existing.is_some() {
            return ResponseRecord::new(ResultCode::KEY_EXISTS);
        }
        if info3 & (INFO3_UPDATE_ONLY | INFO3_REPLACE_ONLY) != 0 && existing.is_none() {
            return ResponseRecord::new(ResultCode::KEY_NOT_FOUND);
        }
        if let Some(current) = &existing {
            if info2 & INFO2_GENERATION != 0 && current.generation != req.generation {
                return ResponseRecord::new(ResultCode::GENERATION_ERROR);
            }
            if info2 & INFO2_GENERATION_GT != 0 && req.generation <= current.generation {
                return ResponseRecord::new(ResultCode::GENERATION_ERROR);
            }
        }

        let mut record = existing.clone().unwrap_or_else(|| StoredRecord {
            set_name: req.set_name.clone(),
            user_key: None,
            bins: BTreeMap::new(),
            generation: 0,
            expiration: 0,
            version: 0,
        });
        if info3 & (INFO3_CREATE_OR_REPLACE | INFO3_REPLACE_ONLY) != 0 {
            record.bins.clear();
        }
        if req.user_key.is_some() {
            record.user_key = req.user_key.clone();
        }

        let mut deleted = info2 & INFO2_DELETE != 0;
        let mut results = Vec::new();
        for op in &req.ops {
            let name = &op.bin_name;
            match op.op_type {
                OperationType::Read if name.is_empty() => {}
                OperationType::Read => {
                    if let Some(value) = record.bins.get(name) {
                        results.push((name.clone(), value.clone()));
                    }
                }
                OperationType::Write => match &op.value {
                    Value::Nil => {
                        record.bins.remove(name);
                    }
                    value => {
                        record.bins.insert(name.clone(), value.clone());
                    }
                },
                OperationType::Add => {
                    let sum = match (record.bins.get(name), &op.value) {
                        (None, Value::Int(d)) => Value::Int(*d),
                        (Some(Value::Int(c)), Value::Int(d)) => Value::Int(c.wrapping_add(*d)),
                        (None, Value::Float(d)) => Value::Float(*d),
                        (Some(Value::Float(c)), Value::Float(d)) => Value::Float(c + d),
                        _ => return ResponseRecord::new(ResultCode::BIN_TYPE_ERROR),
                    };
                    record.bins.insert(name.clone(), sum);
                }
                OperationType::Append | OperationType::Prepend => {
                    let Value::String(part) = &op.value else {
                        return ResponseRecord::new(ResultCode::PARAMETER_ERROR);
                    };
                    let joined = match record.bins.get(name) {
                        None => part.clone(),
                        Some(Value::String(current)) if op.op_type == OperationType::Append => {
                            format!("{current}{part}")
                        }
                        Some(Value::String(current)) => format!("{part}{current}"),
                        Some(_) => return ResponseRecord::new(ResultCode::BIN_TYPE_ERROR),
                    };
                    record.bins.insert(name.clone(), Value::String(joined));
                }
                OperationType::Touch => {}
                OperationType::Delete => deleted = true,
                _ => return ResponseRecord::new(ResultCode::UNSUPPORTED_FEATURE),
            }
        }

        if let Some(txn) = req.txn_id {
            state.undo.entry((txn, id.clone())).or_insert(existing);
        }

        let mut response = ResponseRecord::ok(results);
        if deleted {
            state.records.remove(&id);
        } else {
            record.generation += 1;
            record.expiration = req.expiration;
            record.version = self.next_version();
            response.header.generation = record.generation;
            response.header.expiration = record.expiration;
            if req.txn_id.is_some() {
                response.version = Some(record.version);
            }
            state.records.insert(id, record);
        }
        response
    }
}

fn read(state: &StoreState, req: &RecordRequest, id: &RecordId) -> ResponseRecord {
    let (info1, ..) = req.header;
    let Some(stored) = state.records.get(id) else {
        return ResponseRecord::new(ResultCode::KEY_NOT_FOUND);
    };
    let bins = if info1 & INFO1_NOBINDATA != 0 {
        Vec::new()
    } else if info1 & INFO1_GET_ALL != 0 {
        stored.bins.iter().map(|(n, v)| (n.clone(), v.clone())).collect()
    } else {
        req.ops
            .iter()
            .filter_map(|op| stored.bins.get(&op.bin_name).map(|v| (op.bin_name.clone(), v.clone())))
            .collect()
    };
    let mut response = ResponseRecord::ok(bins);
    response.header.generation = stored.generation;
    response.header.expiration = stored.expiration;
    if req.txn_id.is_some() {
        response.version = Some(stored.version);
    }
    response
}

fn in_range(record: &StoredRecord, range: &IndexRange) -> bool {
    let Some(value) = record.bins.get(&range.bin_name) else {
        return false;
    };
    if let Value::Int(n) = value {
        let bound = |bytes: &[u8]| match Value::decode(particle::INTEGER, bytes) {
            Ok(Value::Int(b)) => Some(b),
            _ => None,
        };
        return match (bound(&range.begin), bound(&range.end)) {
            (Some(lo), Some(hi)) => lo <= *n && *n <= hi,
            _ => false,
        };
    }
    let mut sink = VecSink::new();
    value.write(&mut sink);
    sink.as_slice() == &range.begin[..]
}

/// Cluster of active nodes named `names`, partitions spread round-robin.
pub fn cluster(names: &[&str]) -> Arc<StaticCluster> {
    Arc::new(StaticCluster::new(
        names
            .iter()
            .map(|n| Arc::new(Node::new(*n, format!("mock:{n}"), ErrorRateConfig::default())))
            .collect(),
    ))
}

/// Executor over `cluster` and `pool`.
pub fn executor(cluster: Arc<StaticCluster>, pool: Arc<MockPool>) -> Executor {
    Executor::new(cluster, pool, BufferPool::with_defaults())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::CommandDeadline;
    use crate::io::{read_message, ParseContext};
    use shoal_proto::{encode_into, CommandHeader, MessageBuffer, Operation, ResponseParser};

    fn request(msg: &Message) -> MockRequest {
        let mut buf = MessageBuffer::new(BufferPool::with_defaults());
        encode_into(msg, &mut buf, false).unwrap();
        MockRequest::new("A", buf.wire())
    }

    fn reply_record(reply: MockReply) -> ResponseRecord {
        let MockReply::Bytes(bytes) = reply else {
            panic!("expected bytes, got {reply:?}");
        };
        ResponseParser::from_message(&bytes).unwrap().next_record().unwrap().unwrap()
    }

    fn key() -> Key {
        Key::new("test", "demo", 1).unwrap()
    }

    fn write_msg(ops: Vec<Operation>, info2: u8) -> Message {
        let key = key();
        let mut msg = Message::new(CommandHeader {
            info2: INFO2_WRITE | info2,
            ..Default::default()
        })
        .field(Field::Namespace(key.namespace.clone()))
        .field(Field::Set(key.set_name.clone()))
        .field(Field::Digest(key.digest));
        for op in ops {
            msg = msg.op(op);
        }
        msg
    }

    #[test]
    fn test_store_write_then_add() {
        let store = MockStore::new();
        let put = request(&write_msg(vec![Operation::put("n", 1i64)], 0));
        assert_eq!(reply_record(store.respond(&put)).result_code(), ResultCode::OK);
        let add = request(&write_msg(vec![Operation::add("n", 4i64)], 0));
        assert_eq!(reply_record(store.respond(&add)).header.generation, 2);
        assert_eq!(store.get(&key()).unwrap().bins["n"], Value::Int(5));

        let create = request(&write_msg(vec![Operation::put("n", 1i64)], INFO2_CREATE_ONLY));
        assert_eq!(reply_record(store.respond(&create)).result_code(), ResultCode::KEY_EXISTS);
    }

    #[test]
    fn test_store_type_error() {
        let store = MockStore::new();
        store.put(&key(), vec![("s", Value::from("x"))]);
        let add = request(&write_msg(vec![Operation::add("s", 1i64)], 0));
        assert_eq!(reply_record(store.respond(&add)).result_code(), ResultCode::BIN_TYPE_ERROR);
    }

    #[tokio::test]
    async fn test_scripted_stream_eof_disconnects() {
        let mut conn = ScriptedStream::new("A", vec![1, 2]);
        let mut buf = [0u8; 4];
        assert!(conn.read_exact(&mut buf).await.is_err());
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_connection_replays_store_reply() {
        let store = MockStore::new();
        store.put(&key(), vec![("a", Value::Int(7))]);
        let pool = MockPool::with_store(store);
        let cluster = cluster(&["A"]);
        let node = cluster.node("A").unwrap();
        let mut conn = pool.acquire(&node, Duration::from_secs(1)).await.unwrap();

        let read = Message::new(CommandHeader {
            info1: INFO1_READ | INFO1_GET_ALL,
            ..Default::default()
        })
        .field(Field::Namespace("test".into()))
        .field(Field::Digest(key().digest));
        conn.write_all(request(&read).wire.as_slice()).await.unwrap();

        let ctx = ParseContext {
            buffers: BufferPool::with_defaults(),
            deadline: CommandDeadline::unbounded(),
        };
        let received = read_message(conn.as_mut(), &ctx).await.unwrap();
        let record = ResponseParser::from_message(received.message())
            .unwrap()
            .next_record()
            .unwrap()
            .unwrap();
        assert_eq!(record.bin("a"), Some(&Value::Int(7)));
        assert_eq!(pool.sends(), 1);
    }
}
