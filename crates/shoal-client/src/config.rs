//! Client configuration file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shoal_proto::BufferPoolConfig;

use crate::circuit::{ErrorRateConfig, DEFAULT_ERROR_RATE_WINDOW_MS, DEFAULT_MAX_ERROR_RATE};
use crate::policy::{BasePolicy, BatchPolicy, ScanPolicy, WritePolicy};
use crate::tcp::TcpPoolConfig;

/// A node the client talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name used in routing and logs.
    pub name: String,
    /// `host:port`.
    pub address: String,
}

/// Client settings, loadable from TOML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Cluster nodes.
    pub nodes: Vec<NodeConfig>,
    /// Message buffer pool sizing.
    pub buffer_pool: BufferPoolConfig,
    /// Connection pool limits.
    pub tcp: TcpPoolConfig,
    /// Errors per window before a node's breaker opens; `0` disables it.
    pub max_error_rate: u32,
    /// Breaker window in milliseconds.
    pub error_rate_window_ms: u64,
    /// Default read policy.
    pub read_policy: BasePolicy,
    /// Default write policy.
    pub write_policy: WritePolicy,
    /// Default batch policy.
    pub batch_policy: BatchPolicy,
    /// Default scan and query policy.
    pub scan_policy: ScanPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            buffer_pool: BufferPoolConfig::default(),
            tcp: TcpPoolConfig::default(),
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            error_rate_window_ms: DEFAULT_ERROR_RATE_WINDOW_MS,
            read_policy: BasePolicy::default(),
            write_policy: WritePolicy::default(),
            batch_policy: BatchPolicy::default(),
            scan_policy: ScanPolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: ClientConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: ClientConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Breaker limits applied to every node.
    pub fn error_rate(&self) -> ErrorRateConfig {
        ErrorRateConfig {
            max_error_rate: self.max_error_rate,
            window: Duration::from_millis(self.error_rate_window_ms),
        }
    }
}
