// # Memory Key-Value Store
//
// In-memory implementation of KeyValueStore and LockService.
//
// ## Purpose
//
// Provides a simple, fast store that doesn't persist across restarts.
// Useful for testing, embedding, and single-process deployments where
// the "distributed" lock only has to coordinate tasks in one process.
//
// ## Lease Behavior
//
// - Leases expire at `acquired_at + lease` unless renewed
// - An expired lease is free for any owner
// - Renew/release by a non-owner is rejected/ignored
//
// ## When to Use
//
// - Testing environments
// - Embedding certsync next to a process that already owns the data

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::traits::{KeyValueStore, LockService};
use crate::Error;

#[derive(Debug, Clone)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory key-value store with lease-based locks
///
/// Values live in a `BTreeMap` so key listings come back in a stable,
/// sorted order. Clones share the same underlying data, which lets several
/// "processes" in a test talk to one store.
///
/// # Example
///
/// ```rust,no_run
/// use certsync_core::store::MemoryKeyValueStore;
/// use certsync_core::traits::KeyValueStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryKeyValueStore::new();
///
///     store.set("ns/certificates/svc/example.com/site.crt", b"{}").await?;
///
///     let keys = store.list_keys_by_pattern("ns/*").await?;
///     assert_eq!(keys.len(), 1);
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyValueStore {
    values: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    leases: Arc<Mutex<HashMap<String, Lease>>>,
}

impl MemoryKeyValueStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of keys in the store
    pub async fn len(&self) -> usize {
        self.values.read().await.len()
    }

    /// Check if the store is empty
    pub async fn is_empty(&self) -> bool {
        self.values.read().await.is_empty()
    }

    /// Delete a key (no-op if absent)
    pub async fn delete(&self, key: &str) -> Result<(), Error> {
        self.values.write().await.remove(key);
        Ok(())
    }

    /// Current owner of an unexpired lease on `resource`, if any
    pub async fn lease_owner(&self, resource: &str) -> Option<String> {
        let leases = self.leases.lock().await;
        leases
            .get(resource)
            .filter(|lease| lease.is_live(Instant::now()))
            .map(|lease| lease.owner.clone())
    }
}

fn matches_pattern(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[async_trait]
impl KeyValueStore for MemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let guard = self.values.read().await;
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut guard = self.values.write().await;
        guard.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn list_keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, Error> {
        let guard = self.values.read().await;
        Ok(guard
            .keys()
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl LockService for MemoryKeyValueStore {
    async fn try_acquire(&self, resource: &str, owner: &str, lease: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        if let Some(current) = leases.get(resource) {
            if current.is_live(now) && current.owner != owner {
                return Ok(false);
            }
        }
        leases.insert(
            resource.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + lease,
            },
        );
        Ok(true)
    }

    async fn renew(&self, resource: &str, owner: &str, lease: Duration) -> Result<bool, Error> {
        let now = Instant::now();
        let mut leases = self.leases.lock().await;
        match leases.get_mut(resource) {
            Some(current) if current.owner == owner && current.is_live(now) => {
                current.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, owner: &str) -> Result<(), Error> {
        let mut leases = self.leases.lock().await;
        if leases.get(resource).is_some_and(|lease| lease.owner == owner) {
            leases.remove(resource);
        }
        Ok(())
    }
}
