//! Key-level synchronizer
//!
//! Tracks `{key -> content hash}` for every key under the namespace and
//! publishes a [`RecordChangeSet`] whenever a poll sees a difference.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bus::ChangeEventBus;
use crate::digest::ContentHash;
use crate::error::Result;
use crate::reader::{ReaderSource, StorageRecord};
use crate::sync::{ChangeSet, PollHandle, PollStep, diff};

/// Record-level changes; removals are identified by key
pub type RecordChangeSet = ChangeSet<StorageRecord, String>;

/// Polls the namespace and diffs keys by content hash
pub struct RecordSynchronizer {
    source: ReaderSource,
    previous: Mutex<HashMap<String, ContentHash>>,
    events: ChangeEventBus<RecordChangeSet>,
}

impl RecordSynchronizer {
    /// Create a synchronizer with an empty snapshot
    ///
    /// The first poll reports every existing key as added.
    pub fn new(source: ReaderSource) -> Self {
        Self {
            source,
            previous: Mutex::new(HashMap::new()),
            events: ChangeEventBus::new(),
        }
    }

    /// Bus that receives every non-empty change set
    pub fn events(&self) -> &ChangeEventBus<RecordChangeSet> {
        &self.events
    }

    /// Keys in the last snapshot, sorted
    pub async fn known_keys(&self) -> Vec<String> {
        let previous = self.previous.lock().await;
        let mut keys: Vec<String> = previous.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Run one poll step
    ///
    /// # Returns
    ///
    /// - `Ok(Some(changes))`: Differences found and published
    /// - `Ok(None)`: Nothing changed; nothing published
    /// - `Err(Error::StoreUnavailable)`: Listing or reading failed; the
    ///   snapshot is left untouched
    pub async fn poll_once(&self) -> Result<Option<RecordChangeSet>> {
        // Held across the whole step: serializes concurrent callers and keeps
        // publishes in snapshot order.
        let mut previous = self.previous.lock().await;

        let readers = self.source.readers().await?;
        let mut current = Vec::with_capacity(readers.len());
        for reader in &readers {
            current.push((reader.key().to_string(), reader.record().await?));
        }

        let changes = diff(&*previous, &current);
        *previous = current
            .into_iter()
            .map(|(key, record)| (key, record.hash))
            .collect();

        if changes.is_empty() {
            debug!("Record poll: {} keys, no changes", previous.len());
            return Ok(None);
        }

        debug!(
            "Record poll: {} added, {} updated, {} removed",
            changes.added.len(),
            changes.updated.len(),
            changes.removed.len()
        );
        self.events.publish(&changes);
        Ok(Some(changes))
    }

    /// Start polling every `interval`
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> PollHandle {
        PollHandle::spawn(Arc::clone(self), interval)
    }
}

#[async_trait]
impl PollStep for RecordSynchronizer {
    fn name(&self) -> &str {
        "records"
    }

    async fn poll_step(&self) -> Result<()> {
        self.poll_once().await.map(|_| ())
    }
}

impl std::fmt::Debug for RecordSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSynchronizer")
            .field("namespace", &self.source.namespace())
            .field("events", &self.events)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Envelope;
    use crate::store::MemoryKeyValueStore;
    use crate::traits::KeyValueStore;

    fn synchronizer(store: &MemoryKeyValueStore) -> RecordSynchronizer {
        RecordSynchronizer::new(ReaderSource::new(Arc::new(store.clone()), None, "ns/"))
    }

    #[tokio::test]
    async fn first_poll_reports_existing_keys_as_added() {
        let store = MemoryKeyValueStore::new();
        store.set("ns/a", &Envelope::encode(b"1", None)).await.unwrap();
        store.set("ns/b", &Envelope::encode(b"2", None)).await.unwrap();

        let sync = synchronizer(&store);
        let changes = sync.poll_once().await.unwrap().unwrap();
        let keys: Vec<&str> = changes.added.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["ns/a", "ns/b"]);
        assert_eq!(sync.known_keys().await, vec!["ns/a", "ns/b"]);

        assert!(sync.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metadata_only_change_is_not_an_update() {
        let store = MemoryKeyValueStore::new();
        store.set("ns/a", &Envelope::encode(b"1", None)).await.unwrap();
        let sync = synchronizer(&store);
        sync.poll_once().await.unwrap();

        // Same value, new timestamp: hash covers key + value only
        store
            .set("ns/a", &Envelope::encode(b"1", Some(chrono::Utc::now())))
            .await
            .unwrap();
        assert!(sync.poll_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unchanged_store_publishes_nothing() {
        let store = MemoryKeyValueStore::new();
        store.set("ns/a", &Envelope::encode(b"1", None)).await.unwrap();
        let sync = synchronizer(&store);

        let published = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&published);
        sync.events().register(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        for _ in 0..3 {
            sync.poll_once().await.unwrap();
        }
        assert_eq!(published.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
