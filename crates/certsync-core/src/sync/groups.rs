//! Group-level synchronizer
//!
//! Each step rebuilds every [`EntityGroup`] from a fresh reader set and diffs
//! the result against the groups it published last time. A group is never
//! patched in place: any role change produces a new group with a new hash.
//!
//! ## Role selection
//!
//! Within one `(service, domain, name)` bucket, for each required role:
//!
//! - candidates are the readers whose extension equals the role, in key order
//! - candidates with an empty value are skipped (missing, undecryptable, or
//!   malformed records count as absent)
//! - the candidate with the latest `modified` wins; no timestamp counts as
//!   oldest; on a tie the earlier key wins
//!
//! A bucket missing any role produces no group.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bus::ChangeEventBus;
use crate::config::GroupConfig;
use crate::error::Result;
use crate::group::{EntityGroup, EntityGroupKey};
use crate::reader::{ReaderSource, StorageReader, StorageRecord};
use crate::sync::{ChangeSet, PollHandle, PollStep, diff};

/// Group-level changes; removals are identified by group key
pub type GroupChangeSet = ChangeSet<EntityGroup, EntityGroupKey>;

/// Buckets readers into certificate bundles and diffs them
pub struct EntityGrouper {
    source: ReaderSource,
    config: GroupConfig,
    previous: Mutex<HashMap<EntityGroupKey, EntityGroup>>,
    events: ChangeEventBus<GroupChangeSet>,
}

impl EntityGrouper {
    /// Create a grouper with an empty snapshot
    ///
    /// Fails with `Error::Validation` if the group config is invalid.
    pub fn new(source: ReaderSource, config: GroupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            config,
            previous: Mutex::new(HashMap::new()),
            events: ChangeEventBus::new(),
        })
    }

    /// Bus that receives every non-empty change set
    pub fn events(&self) -> &ChangeEventBus<GroupChangeSet> {
        &self.events
    }

    /// Groups from the last step, latest `modified` first
    pub async fn current(&self) -> Vec<EntityGroup> {
        let previous = self.previous.lock().await;
        let mut groups: Vec<EntityGroup> = previous.values().cloned().collect();
        groups.sort_by(|a, b| {
            b.modified()
                .cmp(&a.modified())
                .then_with(|| a.key().cmp(b.key()))
        });
        groups
    }

    /// Build every complete group from the store as it is now
    ///
    /// Groups come back in key order.
    pub async fn assemble(&self) -> Result<Vec<EntityGroup>> {
        let readers = self.source.readers().await?;

        let mut buckets: BTreeMap<EntityGroupKey, Vec<&StorageReader>> = BTreeMap::new();
        for reader in &readers {
            let is_role = reader
                .extension()
                .is_some_and(|ext| self.config.roles.iter().any(|role| role == ext));
            if !is_role {
                continue;
            }
            if let Some(key) = EntityGroupKey::from_reader(reader, &self.config.root_folder) {
                buckets.entry(key).or_default().push(reader);
            }
        }

        let mut groups = Vec::with_capacity(buckets.len());
        'buckets: for (key, members) in buckets {
            let mut selected = Vec::with_capacity(self.config.roles.len());
            for role in &self.config.roles {
                match select_role(&members, role).await? {
                    Some(record) => selected.push((role.clone(), record)),
                    None => {
                        debug!("Group {} is missing role {}", key, role);
                        continue 'buckets;
                    }
                }
            }
            groups.push(EntityGroup::new(key, selected));
        }
        Ok(groups)
    }

    /// Run one grouping step
    ///
    /// # Returns
    ///
    /// - `Ok(Some(changes))`: Group differences found and published
    /// - `Ok(None)`: Nothing changed; nothing published
    /// - `Err(Error::StoreUnavailable)`: Listing or reading failed; the
    ///   snapshot is left untouched
    pub async fn poll_once(&self) -> Result<Option<GroupChangeSet>> {
        let mut previous = self.previous.lock().await;

        let current: Vec<(EntityGroupKey, EntityGroup)> = self
            .assemble()
            .await?
            .into_iter()
            .map(|group| (group.key().clone(), group))
            .collect();

        let changes = diff(&*previous, &current);
        *previous = current.into_iter().collect();

        if changes.is_empty() {
            debug!("Group poll: {} groups, no changes", previous.len());
            return Ok(None);
        }

        debug!(
            "Group poll: {} added, {} updated, {} removed",
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

async fn select_role(members: &[&StorageReader], role: &str) -> Result<Option<StorageRecord>> {
    let mut best: Option<StorageRecord> = None;
    for reader in members.iter().filter(|r| r.extension() == Some(role)) {
        let record = reader.record().await?;
        if record.value.is_empty() {
            continue;
        }
        // Strictly newer only: ties keep the earlier key
        if best.as_ref().is_none_or(|b| record.modified > b.modified) {
            best = Some(record);
        }
    }
    Ok(best)
}

#[async_trait]
impl PollStep for EntityGrouper {
    fn name(&self) -> &str {
        "groups"
    }

    async fn poll_step(&self) -> Result<()> {
        self.poll_once().await.map(|_| ())
    }
}

impl std::fmt::Debug for EntityGrouper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityGrouper")
            .field("namespace", &self.source.namespace())
            .field("root_folder", &self.config.root_folder)
            .field("roles", &self.config.roles)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::Envelope;
    use crate::store::MemoryKeyValueStore;
    use crate::traits::KeyValueStore;
    use chrono::{DateTime, Utc};

    fn grouper(store: &MemoryKeyValueStore) -> EntityGrouper {
        EntityGrouper::new(
            ReaderSource::new(Arc::new(store.clone()), None, "ns"),
            GroupConfig::default(),
        )
        .unwrap()
    }

    async fn put(store: &MemoryKeyValueStore, key: &str, value: &[u8], modified: Option<&str>) {
        let modified = modified.map(|m| m.parse::<DateTime<Utc>>().unwrap());
        store
            .set(key, &Envelope::encode(value, modified))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ignores_files_outside_the_hierarchy_and_unknown_roles() {
        let store = MemoryKeyValueStore::new();
        for ext in ["json", "key", "crt"] {
            put(&store, &format!("ns/certificates/svc/d.com/site.{}", ext), b"x", None).await;
        }
        put(&store, "ns/certificates/svc/d.com/site.txt", b"x", None).await;
        put(&store, "ns/other/svc/d.com/site.json", b"x", None).await;

        let groups = grouper(&store).assemble().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].roles().len(), 3);
    }

    #[tokio::test]
    async fn empty_value_counts_as_missing_role() {
        let store = MemoryKeyValueStore::new();
        put(&store, "ns/certificates/svc/d.com/site.json", b"{}", None).await;
        put(&store, "ns/certificates/svc/d.com/site.key", b"", None).await;
        put(&store, "ns/certificates/svc/d.com/site.crt", b"CRT", None).await;

        assert!(grouper(&store).assemble().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn role_selection_prefers_latest_then_first_key() {
        let store = MemoryKeyValueStore::new();
        let a = StorageReader::new(Arc::new(store.clone()), "ns", "ns/a.crt").unwrap();
        let b = StorageReader::new(Arc::new(store.clone()), "ns", "ns/b.crt").unwrap();
        let c = StorageReader::new(Arc::new(store.clone()), "ns", "ns/c.crt").unwrap();
        put(&store, "ns/a.crt", b"A", None).await;
        put(&store, "ns/b.crt", b"B", Some("2024-01-01T00:00:00Z")).await;
        put(&store, "ns/c.crt", b"C", Some("2024-01-01T00:00:00Z")).await;

        let picked = select_role(&[&a, &b, &c], "crt").await.unwrap().unwrap();
        assert_eq!(picked.value, b"B");

        let none_dated = select_role(&[&a], "crt").await.unwrap().unwrap();
        assert_eq!(none_dated.value, b"A");
        assert!(select_role(&[&a], "key").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn current_is_sorted_latest_first() {
        let store = MemoryKeyValueStore::new();
        for (name, modified) in [("old", "2023-01-01T00:00:00Z"), ("new", "2024-01-01T00:00:00Z")] {
            for ext in ["json", "key", "crt"] {
                put(
                    &store,
                    &format!("ns/certificates/svc/d.com/{}.{}", name, ext),
                    b"x",
                    Some(modified),
                )
                .await;
            }
        }

        let grouper = grouper(&store);
        grouper.poll_once().await.unwrap();
        let names: Vec<String> = grouper
            .current()
            .await
            .iter()
            .map(|g| g.key().name.clone())
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }
}
