//! Transactions: read versions, verify, roll forward and roll back.

mod common;

use std::sync::Arc;

use common::key;
use shoal_client::mock::{self, MockPool, MockStore};
use shoal_client::{BasePolicy, BatchPolicy, Executor, ReadCommand, Txn, TxnOutcome, WriteCommand, WritePolicy};
use shoal_proto::{Key, Value};

struct Fixture {
    store: Arc<MockStore>,
    exec: Executor,
}

fn fixture() -> Fixture {
    let store = MockStore::new();
    let exec = mock::executor(mock::cluster(&["A", "B"]), MockPool::with_store(store.clone()));
    Fixture { store, exec }
}

fn in_txn(txn: &Arc<Txn>) -> WritePolicy {
    WritePolicy {
        base: BasePolicy {
            txn: Some(txn.clone()),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn write(exec: &Executor, policy: &WritePolicy, key: Key, value: i64) {
    let mut cmd = WriteCommand::new(policy, key, vec![("a".into(), Value::Int(value))]);
    exec.execute(&mut cmd).await.unwrap();
}

#[tokio::test]
async fn test_commit_after_read_and_write() {
    let f = fixture();
    f.store.put(&key(1), vec![("a", Value::Int(1))]);
    let txn = Arc::new(Txn::new());
    let policy = in_txn(&txn);

    let mut read = ReadCommand::new(&policy.base, key(1));
    f.exec.execute(&mut read).await.unwrap();
    assert_eq!(txn.read_version(&key(1)), Some(f.store.get(&key(1)).unwrap().version));

    write(&f.exec, &policy, key(2), 2).await;
    assert_eq!(txn.writes(), vec![key(2)]);
    assert_eq!(txn.read_version(&key(2)), Some(f.store.get(&key(2)).unwrap().version));

    let outcome = txn.commit(&f.exec, &BatchPolicy::default()).await.unwrap();
    assert_eq!(outcome, TxnOutcome::Committed);
    assert_eq!(f.store.get(&key(2)).unwrap().bins["a"], Value::Int(2));
}

#[tokio::test]
async fn test_commit_aborts_when_read_changed() {
    let f = fixture();
    f.store.put(&key(1), vec![("a", Value::Int(1))]);
    let txn = Arc::new(Txn::new());
    let policy = in_txn(&txn);

    let mut read = ReadCommand::new(&policy.base, key(1));
    f.exec.execute(&mut read).await.unwrap();
    write(&f.exec, &policy, key(2), 2).await;
    assert!(f.store.get(&key(2)).is_some());

    // outside the transaction
    write(&f.exec, &WritePolicy::default(), key(1), 10).await;

    let outcome = txn.commit(&f.exec, &BatchPolicy::default()).await.unwrap();
    assert_eq!(outcome, TxnOutcome::Aborted);
    assert!(f.store.get(&key(2)).is_none());
    assert_eq!(f.store.get(&key(1)).unwrap().bins["a"], Value::Int(10));
}

#[tokio::test]
async fn test_abort_restores_previous_bins() {
    let f = fixture();
    f.store.put(&key(1), vec![("a", Value::Int(1))]);
    let txn = Arc::new(Txn::with_id(99));
    let policy = in_txn(&txn);

    write(&f.exec, &policy, key(1), 2).await;
    write(&f.exec, &policy, key(3), 3).await;
    assert_eq!(f.store.get(&key(1)).unwrap().bins["a"], Value::Int(2));

    txn.abort(&f.exec, &BatchPolicy::default()).await.unwrap();

    let restored = f.store.get(&key(1)).unwrap();
    assert_eq!(restored.bins["a"], Value::Int(1));
    assert_eq!(restored.generation, 1);
    assert!(f.store.get(&key(3)).is_none());
}

#[tokio::test]
async fn test_commit_without_work_is_trivial() {
    let f = fixture();
    let txn = Arc::new(Txn::new());
    let outcome = txn.commit(&f.exec, &BatchPolicy::default()).await.unwrap();
    assert_eq!(outcome, TxnOutcome::Committed);
    assert!(f.store.is_empty());
}
