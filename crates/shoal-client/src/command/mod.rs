//! Concrete commands run by the [`Executor`](crate::executor::Executor).

pub mod batch;
pub mod scan;
pub mod single;
pub mod txn;

use std::collections::HashMap;

use bytes::Bytes;
use shoal_proto::{Field, Key, ProtoError, ResponseParser, ResponseRecord, Value};

use crate::connection::Connection;
use crate::error::{ClientError, Result};
use crate::io::{self, ParseContext};
use crate::policy::BasePolicy;

pub use batch::{execute_batch, BatchNodeCommand, BatchOp, BatchRecord};
pub use scan::{scan, Filter, RecordStream, ScanCommand, ScanRequest, ScanSummary};
pub use single::{DeleteCommand, ExistsCommand, OperateCommand, ReadBins, ReadCommand, TouchCommand, WriteCommand};
pub use txn::{Txn, TxnOutcome, TxnRollCommand, TxnVerifyCommand};

/// A record returned by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Key the record was requested or returned by.
    pub key: Option<Key>,
    /// Bins by name.
    pub bins: HashMap<String, Value>,
    /// Generation.
    pub generation: u32,
    /// Expiration.
    pub expiration: u32,
    /// Version, returned for transactional commands.
    pub version: Option<u64>,
}

impl Record {
    /// Convert a parsed response record.
    pub fn from_response(response: ResponseRecord, key: Option<Key>) -> Self {
        let key = key.or_else(|| {
            let digest = response.digest?;
            let mut k = Key::from_digest(
                response.namespace.clone().unwrap_or_default(),
                response.set_name.clone().unwrap_or_default(),
                digest,
            );
            k.user_key = response.user_key.clone();
            Some(k)
        });
        Self {
            key,
            bins: response.bins.into_iter().collect(),
            generation: response.header.generation,
            expiration: response.header.expiration,
            version: response.version,
        }
    }

    /// Bin value by name.
    pub fn bin(&self, name: &str) -> Option<&Value> {
        self.bins.get(name)
    }
}

/// Namespace, set and digest, then the transaction, filter and user-key
/// fields the policy calls for.
pub(crate) fn key_fields(key: &Key, policy: &BasePolicy, write: bool) -> Vec<Field> {
    let mut fields = vec![
        Field::Namespace(key.namespace.clone()),
        Field::Set(key.set_name.clone()),
        Field::Digest(key.digest),
    ];
    if let Some(txn) = &policy.txn {
        fields.push(Field::TxnId(txn.id()));
        if let Some(version) = txn.read_version(key) {
            fields.push(Field::RecordVersion(version));
        }
        if write && txn.deadline() != 0 {
            fields.push(Field::TxnDeadline(txn.deadline()));
        }
    }
    if let Some(filter) = &policy.filter_expression {
        fields.push(Field::FilterExp(Bytes::from(filter.clone())));
    }
    if policy.send_key {
        if let Some(user_key) = &key.user_key {
            fields.push(Field::UserKey(user_key.clone()));
        }
    }
    fields
}

/// Read a single-record response.
pub(crate) async fn read_single(conn: &mut dyn Connection, ctx: &ParseContext) -> Result<ResponseRecord> {
    let received = io::read_message(conn, ctx).await?;
    let mut parser = ResponseParser::from_message(received.message())?;
    parser
        .next_record()?
        .ok_or_else(|| ClientError::from(ProtoError::header("response holds no record")))
}
