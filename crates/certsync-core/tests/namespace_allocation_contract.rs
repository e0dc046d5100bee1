//! Contract Test: Namespace Allocation
//!
//! This test verifies that the key prefix is allocated exactly once per
//! host, however many processes race for it.
//!
//! Constraints verified:
//! - N concurrent first-time allocations converge on one persisted value
//! - Exactly one writer performs the create step
//! - The allocation lock is released on success and on failure
//! - A write that outlives its lease is never handed out as the prefix
//!
//! If this test fails, namespace coordination is broken.

mod common;

use certsync_core::traits::KeyValueStore;
use certsync_core::{KeyNamespaceAllocator, NamespaceConfig, StatValue};
use common::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn config() -> NamespaceConfig {
    NamespaceConfig {
        host: "node-1".to_string(),
        lock_retry_delay_ms: 2,
        ..NamespaceConfig::default()
    }
}

fn allocator(store: &FlakyStore) -> KeyNamespaceAllocator {
    KeyNamespaceAllocator::new(Arc::new(store.clone()), Arc::new(store.clone()), config())
        .expect("valid namespace config")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_allocations_converge() {
    const N: usize = 16;
    let store = FlakyStore::new();

    let mut tasks = Vec::with_capacity(N);
    for _ in 0..N {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            allocator(&store).prefix().await.map(str::to_string)
        }));
    }

    let mut values = HashSet::new();
    for task in tasks {
        values.insert(task.await.unwrap().expect("allocation succeeds"));
    }

    assert_eq!(values.len(), 1, "all callers must see one prefix: {:?}", values);
    assert_eq!(store.set_calls(), 1, "exactly one process may create the prefix");

    let prefix = values.into_iter().next().unwrap();
    assert!(prefix.starts_with("node-1-"));

    let stat_key = allocator(&store).stat_key();
    let stored: StatValue =
        serde_json::from_slice(&store.get(&stat_key).await.unwrap().unwrap()).unwrap();
    assert_eq!(stored.value, prefix);
    assert!(stored.created_at.is_some());
    assert_eq!(store.inner().lease_owner(&format!("{}:lock", stat_key)).await, None);
}

#[tokio::test]
async fn failed_create_releases_lock_and_is_retryable() {
    let store = FlakyStore::new();
    let alloc = allocator(&store);
    let lock = format!("{}:lock", alloc.stat_key());

    store.set_failing_writes(true);
    let err = alloc.prefix().await.unwrap_err();
    assert!(matches!(err, certsync_core::Error::StoreUnavailable(_)));
    assert_eq!(
        store.inner().lease_owner(&lock).await,
        None,
        "lock must be released when the create step fails"
    );

    store.set_failing_writes(false);
    let prefix = alloc.prefix().await.expect("retry succeeds").to_string();
    assert!(prefix.starts_with("node-1-"));
}

#[tokio::test]
async fn restart_reuses_persisted_prefix() {
    let store = FlakyStore::new();
    let first = allocator(&store).prefix().await.unwrap().to_string();
    let writes = store.set_calls();

    let second = allocator(&store).prefix().await.unwrap().to_string();
    assert_eq!(first, second);
    assert_eq!(store.set_calls(), writes, "a usable prefix is never rewritten");
}

fn short_lease_config() -> NamespaceConfig {
    NamespaceConfig {
        lock_lease_secs: 1,
        ..config()
    }
}

#[tokio::test]
async fn write_outliving_a_lapsed_lease_is_rejected() {
    let store = FlakyStore::new();
    store.set_write_delay(Duration::from_millis(1500));
    store.set_failing_renewals(true);

    let alloc =
        KeyNamespaceAllocator::new(Arc::new(store.clone()), Arc::new(store.clone()), short_lease_config())
            .expect("valid namespace config");
    let err = alloc.prefix().await.unwrap_err();
    assert!(
        matches!(err, certsync_core::Error::LockAcquisition(_)),
        "expected a lost lease, got {:?}",
        err
    );

    // Recovery converges on whatever was persisted
    store.set_write_delay(Duration::ZERO);
    store.set_failing_renewals(false);
    let prefix = alloc.prefix().await.expect("retry succeeds").to_string();
    let stored: StatValue =
        serde_json::from_slice(&store.get(&alloc.stat_key()).await.unwrap().unwrap()).unwrap();
    assert_eq!(prefix, stored.value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lapsed_leases_never_yield_two_prefixes() {
    let store = FlakyStore::new();
    store.set_write_delay(Duration::from_millis(1500));
    store.set_failing_renewals(true);

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            KeyNamespaceAllocator::new(
                Arc::new(store.clone()),
                Arc::new(store),
                short_lease_config(),
            )
            .expect("valid namespace config")
            .prefix()
            .await
            .map(str::to_string)
        }));
    }

    let mut granted = HashSet::new();
    for task in tasks {
        match task.await.unwrap() {
            Ok(prefix) => {
                granted.insert(prefix);
            }
            Err(e) => assert!(
                matches!(e, certsync_core::Error::LockAcquisition(_)),
                "unexpected error {:?}",
                e
            ),
        }
    }
    assert!(granted.len() <= 1, "two writers handed out prefixes: {:?}", granted);

    store.set_write_delay(Duration::ZERO);
    store.set_failing_renewals(false);
    let settled = allocator(&store).prefix().await.unwrap().to_string();
    for prefix in granted {
        assert_eq!(prefix, settled);
    }
}
