//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use shoal_client::StaticCluster;
use shoal_proto::Key;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn key(n: i64) -> Key {
    Key::new("test", "demo", n).unwrap()
}

/// The first `count` keys whose partition `node` currently owns.
pub fn keys_on(cluster: &StaticCluster, node: &str, count: usize) -> Vec<Key> {
    (0..)
        .map(key)
        .filter(|k| cluster.owner(k.partition_id()) == Some(node))
        .take(count)
        .collect()
}
