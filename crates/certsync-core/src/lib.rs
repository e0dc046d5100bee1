// # certsync-core
//
// Encrypted, poll-based change detection over a prefix-scoped key-value
// store.
//
// ## Architecture Overview
//
// - **KeyValueStore / LockService**: Traits for the store certsync reads
//   and the lease lock it coordinates through
// - **KeyNamespaceAllocator**: Allocates the per-host key prefix once,
//   under a lease-renewing lock
// - **StorageReader**: Lazy view of one key (decrypt, parse, hash, path)
// - **RecordSynchronizer**: Polls keys and publishes added/updated/removed
// - **EntityGrouper**: Polls and assembles certificate bundles, publishing
//   group-level changes
// - **ChangeEventBus**: Typed synchronous fan-out to listeners
// - **CertSync**: Wires all of the above for an embedding host
//
// ## Design Principles
//
// 1. **Content hashing**: Change means a different `hash(key, value)`,
//    never different ciphertext
// 2. **Record isolation**: One bad record never fails a poll
// 3. **Library-first**: The store and lock are injected; nothing is global

pub mod bus;
pub mod config;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod group;
pub mod lock;
pub mod namespace;
pub mod reader;
pub mod service;
pub mod store;
pub mod sync;
pub mod traits;

// Re-export core types for convenience
pub use bus::{ChangeEventBus, EventStream, Subscription};
pub use config::{CryptoConfig, GroupConfig, NamespaceConfig, PollConfig, SyncConfig};
pub use crypto::EnvelopeCrypto;
pub use digest::{ContentHash, Versioned};
pub use error::{DecryptFailure, Error, Result};
pub use group::{EntityGroup, EntityGroupKey};
pub use lock::LeaseGuard;
pub use namespace::{KeyNamespaceAllocator, StatValue};
pub use reader::{
    DecryptErrorHandler, DecryptErrorLog, Envelope, ReaderSource, StorageReader, StorageRecord,
};
pub use service::CertSync;
pub use store::MemoryKeyValueStore;
pub use sync::groups::GroupChangeSet;
pub use sync::records::RecordChangeSet;
pub use sync::{ChangeSet, EntityGrouper, PollHandle, RecordSynchronizer};
pub use traits::{KeyValueStore, LockService};
