//! Command policies.
//!
//! Policies are plain data: they deserialize from config files and map onto
//! header bits through helpers such as [`BasePolicy::read_info1`]. Durations are stored in
//! milliseconds, `0` meaning "none".

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shoal_proto::protocol::*;

use crate::command::txn::Txn;
use crate::deadline::CommandDeadline;

/// Replica consulted by reads in AP namespaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadModeAp {
    /// One copy.
    #[default]
    One,
    /// Every copy; the newest record wins.
    All,
}

/// Consistency of reads in SC namespaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadModeSc {
    /// Monotonic within the client session.
    #[default]
    Session,
    /// Linearizable.
    Linearize,
    /// Master or any replica.
    AllowReplica,
    /// Also unavailable partitions.
    AllowUnavailable,
}

/// What a write does when the record exists or does not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordExistsAction {
    /// Create or merge bins.
    #[default]
    Update,
    /// Merge bins; fail if the record does not exist.
    UpdateOnly,
    /// Create or replace all bins.
    Replace,
    /// Replace all bins; fail if the record does not exist.
    ReplaceOnly,
    /// Create; fail if the record exists.
    CreateOnly,
}

/// Generation check applied to a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPolicy {
    /// No check.
    #[default]
    None,
    /// Write only if the generation equals the expected one.
    ExpectGenEqual,
    /// Write only if the expected generation is greater.
    ExpectGenGt,
}

/// Replication acknowledgement level for writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitLevel {
    /// Wait for every replica.
    #[default]
    CommitAll,
    /// Wait for the master only.
    CommitMaster,
}

/// Settings shared by every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasePolicy {
    /// Total time budget across all attempts, in milliseconds.
    pub total_timeout_ms: u64,
    /// Time budget for one socket read or write, in milliseconds.
    pub socket_timeout_ms: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Sleep before each retry, in milliseconds.
    pub sleep_between_retries_ms: u64,
    /// Factor applied to the sleep after every retry; values `<= 1` keep it fixed.
    pub sleep_multiplier: f64,
    /// How long a timed-out connection may be drained before it is dropped.
    /// `0` closes it immediately.
    pub timeout_delay_ms: u64,
    /// Fail at once when the node's pool is at its limit.
    pub exit_fast_on_exhausted_connection_pool: bool,
    /// AP read replica mode.
    pub read_mode_ap: ReadModeAp,
    /// SC read consistency mode.
    pub read_mode_sc: ReadModeSc,
    /// Send the user key along with the digest.
    pub send_key: bool,
    /// Compress requests and ask for compressed responses.
    pub use_compression: bool,
    /// Compiled filter expression, sent as-is.
    pub filter_expression: Option<Vec<u8>>,
    /// Transaction this command belongs to.
    #[serde(skip)]
    pub txn: Option<Arc<Txn>>,
}

impl Default for BasePolicy {
    fn default() -> Self {
        Self {
            total_timeout_ms: 1_000,
            socket_timeout_ms: 30_000,
            max_retries: 2,
            sleep_between_retries_ms: 0,
            sleep_multiplier: 1.0,
            timeout_delay_ms: 0,
            exit_fast_on_exhausted_connection_pool: false,
            read_mode_ap: ReadModeAp::One,
            read_mode_sc: ReadModeSc::Session,
            send_key: false,
            use_compression: false,
            filter_expression: None,
            txn: None,
        }
    }
}

impl BasePolicy {
    /// Total timeout.
    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }

    /// Socket timeout.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    /// Sleep before the first retry.
    pub fn sleep_between_retries(&self) -> Duration {
        Duration::from_millis(self.sleep_between_retries_ms)
    }

    /// Salvage budget for a timed-out connection.
    pub fn timeout_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_delay_ms)
    }

    /// Deadline starting now.
    pub fn deadline(&self) -> CommandDeadline {
        CommandDeadline::new(self.total_timeout(), self.socket_timeout())
    }

    /// `info1` bits for a read.
    pub fn read_info1(&self) -> u8 {
        let mut info1 = INFO1_READ;
        if self.read_mode_ap == ReadModeAp::All {
            info1 |= INFO1_READ_MODE_AP_ALL;
        }
        if self.use_compression {
            info1 |= INFO1_COMPRESS_RESPONSE;
        }
        info1
    }

    /// `info3` bits for a read.
    pub fn read_info3(&self) -> u8 {
        match self.read_mode_sc {
            ReadModeSc::Session => 0,
            ReadModeSc::Linearize => INFO3_SC_READ_TYPE,
            ReadModeSc::AllowReplica => INFO3_SC_READ_RELAX,
            ReadModeSc::AllowUnavailable => INFO3_SC_READ_TYPE | INFO3_SC_READ_RELAX,
        }
    }
}

/// Settings for single-record writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WritePolicy {
    /// Shared settings.
    pub base: BasePolicy,
    /// Behavior when the record exists or does not.
    pub record_exists_action: RecordExistsAction,
    /// Generation check.
    pub generation_policy: GenerationPolicy,
    /// Expected generation for the check.
    pub generation: u32,
    /// Record TTL in seconds; `0` uses the namespace default.
    pub expiration: u32,
    /// Replication acknowledgement level.
    pub commit_level: CommitLevel,
    /// Leave a tombstone on delete.
    pub durable_delete: bool,
    /// Return a result for every operation, not one per bin.
    pub respond_per_each_op: bool,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                max_retries: 0,
                ..BasePolicy::default()
            },
            record_exists_action: RecordExistsAction::Update,
            generation_policy: GenerationPolicy::None,
            generation: 0,
            expiration: 0,
            commit_level: CommitLevel::CommitAll,
            durable_delete: false,
            respond_per_each_op: false,
        }
    }
}

impl WritePolicy {
    /// `info2` bits for a write.
    pub fn write_info2(&self) -> u8 {
        let mut info2 = INFO2_WRITE;
        match self.generation_policy {
            GenerationPolicy::None => {}
            GenerationPolicy::ExpectGenEqual => info2 |= INFO2_GENERATION,
            GenerationPolicy::ExpectGenGt => info2 |= INFO2_GENERATION_GT,
        }
        if self.record_exists_action == RecordExistsAction::CreateOnly {
            info2 |= INFO2_CREATE_ONLY;
        }
        if self.durable_delete {
            info2 |= INFO2_DURABLE_DELETE;
        }
        if self.respond_per_each_op {
            info2 |= INFO2_RESPOND_ALL_OPS;
        }
        info2
    }

    /// `info3` bits for a write.
    pub fn write_info3(&self) -> u8 {
        let mut info3 = match self.record_exists_action {
            RecordExistsAction::UpdateOnly => INFO3_UPDATE_ONLY,
            RecordExistsAction::Replace => INFO3_CREATE_OR_REPLACE,
            RecordExistsAction::ReplaceOnly => INFO3_REPLACE_ONLY,
            RecordExistsAction::Update | RecordExistsAction::CreateOnly => 0,
        };
        if self.commit_level == CommitLevel::CommitMaster {
            info3 |= INFO3_COMMIT_MASTER;
        }
        info3
    }

    /// Generation sent in the header; zero unless a check is requested.
    pub fn header_generation(&self) -> u32 {
        match self.generation_policy {
            GenerationPolicy::None => 0,
            _ => self.generation,
        }
    }
}

/// Settings for multi-key batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    /// Shared settings, applied to every node command.
    pub base: BasePolicy,
    /// Node commands run at once; `1` is sequential, `0` is all at once.
    pub concurrent_nodes: usize,
    /// Let the server answer in-memory records inline.
    pub allow_inline: bool,
    /// Let the server answer SSD records inline.
    pub allow_inline_ssd: bool,
    /// Return a result for every key, found or not.
    pub respond_all_keys: bool,
    /// Finish every node command and report all failures instead of
    /// stopping at the first failed node.
    pub allow_partial_results: bool,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy::default(),
            concurrent_nodes: 1,
            allow_inline: true,
            allow_inline_ssd: false,
            respond_all_keys: true,
            allow_partial_results: false,
        }
    }
}

/// Settings for scans and queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanPolicy {
    /// Shared settings. Scans are never retried after bytes were sent.
    pub base: BasePolicy,
    /// Stop after roughly this many records; `0` is unlimited.
    pub max_records: u64,
    /// Server-side throttle; `0` is unlimited.
    pub records_per_second: u32,
    /// Nodes scanned at once; `0` is all.
    pub max_concurrent_nodes: usize,
    /// Capacity of the record channel handed to the caller.
    pub record_queue_size: usize,
    /// Return bin data, not just metadata.
    pub include_bin_data: bool,
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            base: BasePolicy {
                total_timeout_ms: 0,
                max_retries: 0,
                ..BasePolicy::default()
            },
            max_records: 0,
            records_per_second: 0,
            max_concurrent_nodes: 0,
            record_queue_size: 256,
            include_bin_data: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let read = BasePolicy::default();
        assert_eq!(read.total_timeout(), Duration::from_millis(1_000));
        assert_eq!(read.socket_timeout(), Duration::from_secs(30));
        assert_eq!(read.max_retries, 2);
        assert_eq!(read.sleep_multiplier, 1.0);

        let write = WritePolicy::default();
        assert_eq!(write.base.max_retries, 0);
        assert_eq!(write.base.total_timeout_ms, 1_000);
    }

    #[test]
    fn test_read_bits() {
        let mut p = BasePolicy::default();
        assert_eq!(p.read_info1(), INFO1_READ);
        assert_eq!(p.read_info3(), 0);
        p.read_mode_ap = ReadModeAp::All;
        p.read_mode_sc = ReadModeSc::AllowUnavailable;
        p.use_compression = true;
        assert_eq!(p.read_info1(), INFO1_READ | INFO1_READ_MODE_AP_ALL | INFO1_COMPRESS_RESPONSE);
        assert_eq!(p.read_info3(), INFO3_SC_READ_TYPE | INFO3_SC_READ_RELAX);
    }

    #[test]
    fn test_write_bits() {
        let p = WritePolicy {
            record_exists_action: RecordExistsAction::CreateOnly,
            generation_policy: GenerationPolicy::ExpectGenEqual,
            generation: 7,
            durable_delete: true,
            commit_level: CommitLevel::CommitMaster,
            ..Default::default()
        };
        assert_eq!(
            p.write_info2(),
            INFO2_WRITE | INFO2_GENERATION | INFO2_CREATE_ONLY | INFO2_DURABLE_DELETE
        );
        assert_eq!(p.write_info3(), INFO3_COMMIT_MASTER);
        assert_eq!(p.header_generation(), 7);

        let replace = WritePolicy {
            record_exists_action: RecordExistsAction::ReplaceOnly,
            generation: 7,
            ..Default::default()
        };
        assert_eq!(replace.write_info3(), INFO3_REPLACE_ONLY);
        assert_eq!(replace.header_generation(), 0);
    }

    #[test]
    fn test_partial_json() {
        let p: WritePolicy = serde_json::from_str(r#"{"durable_delete": true}"#).unwrap();
        assert_eq!(p.base.max_retries, 0);
        assert!(p.durable_delete);

        let p: WritePolicy =
            serde_json::from_str(r#"{"base": {"total_timeout_ms": 50, "max_retries": 3}}"#).unwrap();
        assert_eq!(p.base.total_timeout_ms, 50);
        assert_eq!(p.base.max_retries, 3);
        assert_eq!(p.base.socket_timeout_ms, 30_000);
    }
}
