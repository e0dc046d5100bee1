// # Key-Value Store Trait
//
// Defines the interface certsync consumes from the backing key-value store.
//
// ## Purpose
//
// certsync is a client of a flat, prefix-scoped store. It only needs to:
// - Read the raw bytes at a key
// - Write raw bytes at a key (namespace token only)
// - List keys matching `prefix*`
//
// ## Implementations
//
// - In-memory: `MemoryKeyValueStore` (tests, embedding)
// - Future: Redis, etcd, Consul KV
//
// ## Usage
//
// ```rust,ignore
// use certsync_core::KeyValueStore;
//
// let keys = store.list_keys_by_pattern("ns/*").await?;
// for key in keys {
//     let raw = store.get(&key).await?;
// }
// ```

use async_trait::async_trait;

/// Trait for key-value store clients
///
/// Implementations must be thread-safe and usable across async tasks.
///
/// # Error Contract
///
/// Every transport/connection failure must be reported as
/// [`Error::StoreUnavailable`](crate::Error::StoreUnavailable). certsync
/// treats those as transient: the failing poll step is logged and the next
/// tick retries.
///
/// A call that fails because the client itself is shutting down must be
/// reported as [`Error::Cancelled`](crate::Error::Cancelled) instead. Poll
/// loops skip those steps without logging.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get the raw bytes stored at `key`
    ///
    /// # Returns
    ///
    /// - `Ok(Some(bytes))`: The stored bytes
    /// - `Ok(None)`: No value at this key
    /// - `Err(Error)`: Transport error
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, crate::Error>;

    /// Store raw bytes at `key`, replacing any previous value
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), crate::Error>;

    /// List all keys matching a glob-style pattern
    ///
    /// certsync only ever passes `"<prefix>*"`. Implementations may support
    /// richer patterns but must honor a single trailing `*`.
    async fn list_keys_by_pattern(&self, pattern: &str) -> Result<Vec<String>, crate::Error>;
}
