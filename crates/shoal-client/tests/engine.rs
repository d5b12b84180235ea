//! Execution engine behavior end to end: retry budget, deadlines, in-doubt
//! tagging, pool outcomes, circuit breaking and connection salvage.

mod common;

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, key};
use shoal_client::mock::{self, MockAcquire, MockPool, MockReply, MockStore};
use shoal_client::policy::GenerationPolicy;
use shoal_client::{
    BasePolicy, Cluster, DeleteCommand, ErrorKind, ErrorRateConfig, ExistsCommand, Node, OperateCommand, ReadBins,
    ReadCommand, StaticCluster, TouchCommand, WriteCommand, WritePolicy,
};
use shoal_proto::protocol::INFO2_WRITE;
use shoal_proto::{Key, Message, Operation, ResultCode, Value};
use tokio::time::Instant;

fn reset() -> MockReply {
    MockReply::WriteError(io::ErrorKind::ConnectionReset)
}

fn node(cluster: &StaticCluster, name: &str) -> Arc<Node> {
    cluster.node(name).unwrap()
}

#[tokio::test]
async fn test_retry_budget_is_three_sends() {
    init_tracing();
    let pool = MockPool::new(|_| reset());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        max_retries: 2,
        ..Default::default()
    };

    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::MaxRetriesExceeded);
    assert_eq!(pool.sends(), 3);
    assert_eq!(pool.closed(), 3);
    assert!(!err.in_doubt());
    let iterations: Vec<u32> = err.history().skip(1).map(|e| e.iteration()).collect();
    assert_eq!(iterations, vec![3, 2, 1]);
    assert!(err
        .history()
        .skip(1)
        .all(|e| matches!(e.kind(), ErrorKind::Connection(_)) && e.node() == Some("A")));
}

#[tokio::test]
async fn test_write_in_doubt_after_second_send() {
    let pool = MockPool::new(|_| MockReply::ReadError(io::ErrorKind::ConnectionReset));
    let cluster = mock::cluster(&["A"]);
    let exec = mock::executor(cluster.clone(), pool.clone());
    let policy = WritePolicy {
        base: BasePolicy {
            max_retries: 1,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut cmd = WriteCommand::new(&policy, key(1), vec![("a".into(), Value::Int(1))]);
    let err = exec.execute(&mut cmd).await.unwrap_err();

    assert_eq!(pool.sends(), 2);
    assert!(err.in_doubt());
    assert_eq!(node(&cluster, "A").stats().snapshot().in_doubt, 1);
}

#[tokio::test]
async fn test_write_not_in_doubt_after_first_send() {
    let pool = MockPool::new(|_| MockReply::ReadError(io::ErrorKind::ConnectionReset));
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());

    let mut cmd = WriteCommand::new(&WritePolicy::default(), key(1), vec![("a".into(), Value::Int(1))]);
    let err = exec.execute(&mut cmd).await.unwrap_err();

    assert_eq!(pool.sends(), 1);
    assert_eq!(err.kind(), &ErrorKind::MaxRetriesExceeded);
    assert!(!err.in_doubt());
}

#[tokio::test]
async fn test_read_never_in_doubt() {
    let pool = MockPool::new(|_| MockReply::ReadError(io::ErrorKind::ConnectionReset));
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        max_retries: 3,
        ..Default::default()
    };

    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();
    assert_eq!(pool.sends(), 4);
    assert!(!err.in_doubt());
}

#[tokio::test(start_paused = true)]
async fn test_backoff_never_sleeps_past_deadline() {
    let pool = MockPool::new(|_| reset());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        total_timeout_ms: 50,
        sleep_between_retries_ms: 100,
        max_retries: 5,
        ..Default::default()
    };

    let start = Instant::now();
    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::Timeout);
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(pool.sends(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sleeps_between_attempts() {
    let pool = MockPool::new(|_| reset());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        total_timeout_ms: 0,
        sleep_between_retries_ms: 10,
        sleep_multiplier: 2.0,
        max_retries: 2,
        ..Default::default()
    };

    let start = Instant::now();
    exec.execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();
    // 10 ms, then 20 ms
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(30) && elapsed < Duration::from_millis(35));
    assert_eq!(pool.sends(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_read_ends_in_timeout() {
    let pool = MockPool::new(|_| MockReply::Stall);
    let cluster = mock::cluster(&["A"]);
    let exec = mock::executor(cluster.clone(), pool.clone());
    let policy = BasePolicy {
        total_timeout_ms: 50,
        socket_timeout_ms: 0,
        max_retries: 3,
        ..Default::default()
    };

    let start = Instant::now();
    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::Timeout);
    assert_eq!(err.previous().map(|e| e.kind()), Some(&ErrorKind::SocketTimeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(50) && elapsed < Duration::from_millis(55));
    assert_eq!(pool.sends(), 1);
    assert_eq!(pool.closed(), 1);
    assert_eq!(node(&cluster, "A").stats().snapshot().timeouts, 1);
}

#[tokio::test]
async fn test_empty_pool_does_not_use_up_attempts() {
    let store = MockStore::new();
    store.put(&key(1), vec![("a", Value::Int(1))]);
    let pool = MockPool::with_store(store);
    pool.script("A", [MockAcquire::Empty; 4]);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        max_retries: 0,
        ..Default::default()
    };

    let mut cmd = ReadCommand::new(&policy, key(1));
    exec.execute(&mut cmd).await.unwrap();

    assert_eq!(cmd.record().unwrap().bin("a"), Some(&Value::Int(1)));
    assert_eq!(pool.acquired(), 1);
    assert_eq!(pool.sends(), 1);
}

#[tokio::test]
async fn test_empty_pool_without_deadline_is_bounded() {
    let pool = MockPool::with_store(MockStore::new());
    pool.script("A", [MockAcquire::Empty; 5]);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        total_timeout_ms: 0,
        max_retries: 2,
        ..Default::default()
    };

    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::MaxRetriesExceeded);
    assert_eq!(pool.sends(), 0);
    assert_eq!(
        err.history()
            .skip(1)
            .filter(|e| e.kind() == &ErrorKind::PoolEmpty)
            .count(),
        3
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_pool_waits_out_deadline() {
    let pool = MockPool::with_store(MockStore::new());
    pool.script("A", [MockAcquire::Empty; 1000]);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        total_timeout_ms: 20,
        max_retries: 0,
        ..Default::default()
    };

    let start = Instant::now();
    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::Timeout);
    assert_eq!(err.previous().map(|e| e.kind()), Some(&ErrorKind::PoolEmpty));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(20) && elapsed < Duration::from_millis(25));
    assert_eq!(pool.sends(), 0);
}

#[tokio::test]
async fn test_exhausted_pool_fails_fast_when_asked() {
    let pool = MockPool::with_store(MockStore::new());
    pool.script("A", [MockAcquire::Exhausted]);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        max_retries: 2,
        exit_fast_on_exhausted_connection_pool: true,
        ..Default::default()
    };

    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::PoolExhausted);
    assert_eq!(err.iteration(), 1);
    assert_eq!(pool.sends(), 0);
}

#[tokio::test]
async fn test_exhausted_pool_retries_by_default() {
    let pool = MockPool::with_store(MockStore::new());
    pool.script("A", [MockAcquire::Exhausted]);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        max_retries: 1,
        ..Default::default()
    };

    let mut cmd = ReadCommand::new(&policy, key(1));
    exec.execute(&mut cmd).await.unwrap();
    assert!(cmd.record().is_none());
    assert_eq!(pool.sends(), 1);
}

#[tokio::test]
async fn test_connect_failure_counts_against_node() {
    let pool = MockPool::with_store(MockStore::new());
    pool.script("A", [MockAcquire::ConnectError]);
    let cluster = mock::cluster(&["A"]);
    let exec = mock::executor(cluster.clone(), pool.clone());
    let policy = BasePolicy {
        max_retries: 1,
        ..Default::default()
    };

    exec.execute(&mut ExistsCommand::new(&policy, key(1)))
        .await
        .unwrap();

    let a = node(&cluster, "A");
    assert_eq!(a.breaker().error_count(), 1);
    assert_eq!(a.stats().snapshot().retries, 1);
}

#[tokio::test]
async fn test_encode_error_is_fatal_and_closes_connection() {
    let pool = MockPool::with_store(MockStore::new());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = WritePolicy {
        base: BasePolicy {
            max_retries: 3,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut cmd = WriteCommand::new(&policy, key(1), vec![("sixteen_bytes_xx".into(), Value::Int(1))]);
    let err = exec.execute(&mut cmd).await.unwrap_err();

    assert!(matches!(err.kind(), ErrorKind::Encode(_)));
    assert!(!err.is_retryable());
    assert!(!err.in_doubt());
    assert_eq!(pool.sends(), 0);
    assert_eq!(pool.acquired(), 1);
    assert_eq!(pool.closed(), 1);

    let mut cmd = WriteCommand::new(&policy, key(1), vec![("fifteen_bytes_x".into(), Value::Int(1))]);
    exec.execute(&mut cmd).await.unwrap();
}

#[tokio::test]
async fn test_circuit_breaker_skips_node() {
    let a = Arc::new(Node::new(
        "A",
        "mock:A",
        ErrorRateConfig {
            max_error_rate: 1,
            window: Duration::from_secs(10),
        },
    ));
    let cluster = Arc::new(StaticCluster::new(vec![a]));
    let pool = MockPool::new(|_| reset());
    let exec = mock::executor(cluster, pool.clone());
    let policy = BasePolicy {
        max_retries: 2,
        ..Default::default()
    };

    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();

    assert_eq!(pool.sends(), 1);
    let kinds: Vec<ErrorKind> = err.history().map(|e| e.kind().clone()).collect();
    assert_eq!(kinds[0], ErrorKind::MaxRetriesExceeded);
    assert_eq!(kinds[1], ErrorKind::CircuitOpen);
    assert_eq!(kinds[2], ErrorKind::CircuitOpen);
    assert!(matches!(kinds[3], ErrorKind::Connection(_)));
}

#[tokio::test]
async fn test_inactive_node_is_no_node() {
    let cluster = mock::cluster(&["A"]);
    node(&cluster, "A").set_active(false);
    let pool = MockPool::with_store(MockStore::new());
    let exec = mock::executor(cluster.clone(), pool.clone());

    let err = exec
        .execute(&mut ReadCommand::new(&BasePolicy::default(), key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), &ErrorKind::MaxRetriesExceeded);
    assert_eq!(err.previous().map(|e| e.kind()), Some(&ErrorKind::NoNode));
    assert!(cluster.node_for_key(&key(1), false).is_none());
    assert_eq!(pool.sends(), 0);
}

#[tokio::test]
async fn test_server_error_returns_connection() {
    let store = MockStore::new();
    store.put(&key(1), vec![("a", Value::Int(1))]);
    let pool = MockPool::with_store(store);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = WritePolicy {
        generation_policy: GenerationPolicy::ExpectGenEqual,
        generation: 5,
        base: BasePolicy {
            max_retries: 2,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut cmd = WriteCommand::new(&policy, key(1), vec![("a".into(), Value::Int(2))]);
    let err = exec.execute(&mut cmd).await.unwrap_err();

    assert_eq!(err.result_code(), Some(ResultCode::GENERATION_ERROR));
    assert!(!err.in_doubt());
    assert_eq!(pool.sends(), 1);
    assert_eq!(pool.released(), 1);
    assert_eq!(pool.closed(), 0);
}

#[tokio::test]
async fn test_device_overload_counts_error() {
    let pool = MockPool::new(|_| MockReply::code(ResultCode::DEVICE_OVERLOAD));
    let cluster = mock::cluster(&["A"]);
    let exec = mock::executor(cluster.clone(), pool.clone());

    let err = exec
        .execute(&mut ReadCommand::new(&BasePolicy::default(), key(1)))
        .await
        .unwrap_err();

    assert_eq!(err.result_code(), Some(ResultCode::DEVICE_OVERLOAD));
    assert_eq!(pool.sends(), 1);
    assert_eq!(node(&cluster, "A").breaker().error_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timed_out_connection_is_salvaged() {
    let store = MockStore::new();
    store.put(&key(1), vec![("a", Value::Int(1))]);
    let calls = AtomicUsize::new(0);
    let pool = MockPool::new(move |req| {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            MockReply::Stall
        } else {
            store.respond(req)
        }
    });
    let cluster = mock::cluster(&["A"]);
    let exec = mock::executor(cluster.clone(), pool.clone());
    let policy = BasePolicy {
        socket_timeout_ms: 20,
        timeout_delay_ms: 100,
        max_retries: 1,
        ..Default::default()
    };

    let mut cmd = ReadCommand::new(&policy, key(1));
    exec.execute(&mut cmd).await.unwrap();
    assert!(cmd.record().is_some());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.released(), 2);
    assert_eq!(pool.closed(), 0);
    let stats = node(&cluster, "A").stats().snapshot();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.salvaged, 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_salvage_closes_connection() {
    let pool = MockPool::new(|_| MockReply::Stall);
    pool.set_drain_succeeds(false);
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = BasePolicy {
        socket_timeout_ms: 20,
        timeout_delay_ms: 100,
        max_retries: 0,
        ..Default::default()
    };

    let err = exec
        .execute(&mut ReadCommand::new(&policy, key(1)))
        .await
        .unwrap_err();
    assert_eq!(err.previous().map(|e| e.kind()), Some(&ErrorKind::SocketTimeout));
    assert_eq!(pool.closed(), 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.closed(), 1);
    assert_eq!(pool.released(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_single_write_bytes_on_the_wire() {
    let pool = MockPool::with_store(MockStore::new());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let key = Key::from_digest("test", "demo", [0xAB; 20]);

    let mut cmd = WriteCommand::new(
        &WritePolicy::default(),
        key,
        vec![("a".into(), Value::Int(1)), ("b".into(), Value::from("x"))],
    );
    exec.execute(&mut cmd).await.unwrap();

    let mut expected = Vec::new();
    expected.extend_from_slice(&((2u64 << 56) | (3u64 << 48) | 92).to_be_bytes());
    expected.extend_from_slice(&[22, 0, INFO2_WRITE, 0, 0, 0]);
    expected.extend_from_slice(&0u32.to_be_bytes());
    expected.extend_from_slice(&0u32.to_be_bytes());
    expected.extend_from_slice(&1000u32.to_be_bytes());
    expected.extend_from_slice(&3u16.to_be_bytes());
    expected.extend_from_slice(&2u16.to_be_bytes());
    for (field_type, payload) in [(0u8, &b"test"[..]), (1, b"demo"), (4, &[0xAB; 20])] {
        expected.extend_from_slice(&(payload.len() as u32 + 1).to_be_bytes());
        expected.push(field_type);
        expected.extend_from_slice(payload);
    }
    // write a = 1 (integer)
    expected.extend_from_slice(&13u32.to_be_bytes());
    expected.extend_from_slice(&[2, 1, 0, 1, b'a']);
    expected.extend_from_slice(&1i64.to_be_bytes());
    // write b = "x" (string)
    expected.extend_from_slice(&6u32.to_be_bytes());
    expected.extend_from_slice(&[2, 3, 0, 1, b'b', b'x']);

    let requests = pool.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].wire.len(), 100);
    assert_eq!(requests[0].wire, expected);
}

#[tokio::test]
async fn test_compressed_request_and_response() {
    let store = MockStore::new();
    let pool = MockPool::with_store(store.clone());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let long = "abc".repeat(200);
    let policy = WritePolicy {
        base: BasePolicy {
            use_compression: true,
            ..Default::default()
        },
        ..Default::default()
    };

    let mut write = WriteCommand::new(&policy, key(1), vec![("s".into(), Value::from(long.as_str()))]);
    exec.execute(&mut write).await.unwrap();
    assert!(pool.requests()[0].is_compressed());
    assert_eq!(store.get(&key(1)).unwrap().bins["s"], Value::from(long.as_str()));

    let mut read = ReadCommand::new(&policy.base, key(1));
    exec.execute(&mut read).await.unwrap();
    assert_eq!(read.record().unwrap().bin("s"), Some(&Value::from(long.as_str())));
}

#[tokio::test]
async fn test_single_record_commands_against_store() {
    let store = MockStore::new();
    let pool = MockPool::with_store(store.clone());
    let exec = mock::executor(mock::cluster(&["A", "B"]), pool.clone());
    let policy = WritePolicy::default();
    let k = key(7);

    let mut exists = ExistsCommand::new(&policy.base, k.clone());
    exec.execute(&mut exists).await.unwrap();
    assert!(!exists.exists());

    let mut op = OperateCommand::new(
        &policy,
        k.clone(),
        vec![Operation::put("n", 1i64), Operation::add("n", 2i64), Operation::get("n")],
    );
    exec.execute(&mut op).await.unwrap();
    assert_eq!(op.record().unwrap().bin("n"), Some(&Value::Int(3)));

    let mut header = ReadCommand::new(&policy.base, k.clone()).with_bins(ReadBins::Header);
    exec.execute(&mut header).await.unwrap();
    let record = header.into_record().unwrap();
    assert!(record.bins.is_empty());
    assert_eq!(record.generation, 1);

    let touch_policy = WritePolicy {
        expiration: 60,
        ..Default::default()
    };
    exec.execute(&mut TouchCommand::new(&touch_policy, k.clone()))
        .await
        .unwrap();
    assert_eq!(store.get(&k).unwrap().expiration, 60);
    assert_eq!(store.get(&k).unwrap().generation, 2);

    let mut delete = DeleteCommand::new(&policy, k.clone());
    exec.execute(&mut delete).await.unwrap();
    assert!(delete.existed());
    let mut delete = DeleteCommand::new(&policy, k.clone());
    exec.execute(&mut delete).await.unwrap();
    assert!(!delete.existed());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_send_key_reaches_server() {
    let store = MockStore::new();
    let pool = MockPool::with_store(store.clone());
    let exec = mock::executor(mock::cluster(&["A"]), pool.clone());
    let policy = WritePolicy {
        base: BasePolicy {
            send_key: true,
            ..Default::default()
        },
        ..Default::default()
    };

    exec.execute(&mut WriteCommand::new(&policy, key(3), vec![("a".into(), Value::Int(1))]))
        .await
        .unwrap();

    let msg = Message::decode(&pool.requests()[0].message).unwrap();
    assert_eq!(msg.fields.len(), 4);
    assert_eq!(store.get(&key(3)).unwrap().user_key, Some(Value::Int(3)));
}
