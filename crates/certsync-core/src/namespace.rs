//! Process-wide key namespace allocation
//!
//! Every read in certsync is scoped to one key prefix. The prefix is either
//! configured statically or allocated once per host and persisted as a
//! [`StatValue`] so that every process on that host (and every restart)
//! converges on the same value.
//!
//! ## Allocation
//!
//! 1. Static prefix configured: use it, no coordination
//! 2. Stored stat value usable: use it
//! 3. Otherwise take the allocation lock, re-check step 2, and only then
//!    generate and write a fresh value
//!
//! Uniqueness comes from the lock, not from the write: the store's `set` is
//! a blind overwrite. The lease is checked before and after the write, and
//! a write that may have raced after the lease lapsed is reported as
//! `Error::LockAcquisition` instead of being used.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::NamespaceConfig;
use crate::error::Result;
use crate::lock::{LeaseGuard, random_hex};
use crate::traits::{KeyValueStore, LockService};

/// Version component of the stat key; bump to force reallocation everywhere
pub const STAT_VERSION: u32 = 1;

/// Timestamped value persisted for the namespace token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatValue {
    /// The stored value
    #[serde(default)]
    pub value: String,
    /// When the value was created
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl StatValue {
    /// Create a stat value stamped with the current time
    pub fn now(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            created_at: Some(Utc::now()),
        }
    }

    /// Whether the value can be used as-is
    ///
    /// Requires a non-blank value, a creation time, and a creation time not
    /// before `refresh_before` (when configured).
    pub fn is_usable(&self, refresh_before: Option<DateTime<Utc>>) -> bool {
        if self.value.trim().is_empty() {
            return false;
        }
        match (self.created_at, refresh_before) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(created), Some(cutoff)) => created >= cutoff,
        }
    }
}

/// Allocates and memoizes the namespace prefix
pub struct KeyNamespaceAllocator {
    store: Arc<dyn KeyValueStore>,
    locks: Arc<dyn LockService>,
    config: NamespaceConfig,
    prefix: OnceCell<String>,
}

impl KeyNamespaceAllocator {
    /// Create a new allocator
    ///
    /// Fails with `Error::Validation` if the namespace config is invalid.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        locks: Arc<dyn LockService>,
        config: NamespaceConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            locks,
            config,
            prefix: OnceCell::new(),
        })
    }

    /// Store key holding the stat value for this host
    pub fn stat_key(&self) -> String {
        format!("{}:key:prefix:namespace:v{}", self.config.host, STAT_VERSION)
    }

    fn lock_resource(&self) -> String {
        format!("{}:lock", self.stat_key())
    }

    /// The namespace prefix, allocated on first call
    ///
    /// Concurrent first calls on one allocator share a single allocation. A
    /// failed allocation is not memoized; the next call tries again.
    pub async fn prefix(&self) -> Result<&str> {
        self.prefix
            .get_or_try_init(|| self.allocate())
            .await
            .map(String::as_str)
    }

    async fn allocate(&self) -> Result<String> {
        if let Some(prefix) = &self.config.static_prefix {
            info!("Using static key prefix {}", prefix);
            return Ok(prefix.clone());
        }

        if let Some(existing) = self.read_usable().await? {
            info!("Using stored key prefix {}", existing);
            return Ok(existing);
        }

        let guard = LeaseGuard::acquire(
            Arc::clone(&self.locks),
            self.lock_resource(),
            self.config.lock_lease(),
            self.config.lock_retry_delay(),
            self.config.lock_acquire_timeout(),
        )
        .await?;

        let outcome = self.create_if_absent(&guard).await;

        if let Err(e) = guard.release().await {
            warn!("Failed to release namespace lock: {}", e);
        }

        outcome
    }

    async fn create_if_absent(&self, guard: &LeaseGuard) -> Result<String> {
        // Another process may have written while we waited for the lock
        if let Some(existing) = self.read_usable().await? {
            info!("Using key prefix {} allocated by another process", existing);
            return Ok(existing);
        }

        let stat = StatValue::now(format!("{}-{}", self.config.host, random_hex(12)));
        guard.ensure_held()?;
        self.store
            .set(&self.stat_key(), &serde_json::to_vec(&stat)?)
            .await?;
        // A lease that lapsed mid-write may have let another writer in
        guard.ensure_held()?;
        info!("Allocated new key prefix {}", stat.value);
        Ok(stat.value)
    }

    async fn read_usable(&self) -> Result<Option<String>> {
        let Some(bytes) = self.store.get(&self.stat_key()).await? else {
            return Ok(None);
        };
        let stat: StatValue = match serde_json::from_slice(&bytes) {
            Ok(stat) => stat,
            Err(e) => {
                debug!("Ignoring unreadable stat value at {}: {}", self.stat_key(), e);
                return Ok(None);
            }
        };
        Ok(stat
            .is_usable(self.config.refresh_before)
            .then_some(stat.value))
    }
}

impl std::fmt::Debug for KeyNamespaceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyNamespaceAllocator")
            .field("stat_key", &self.stat_key())
            .field("prefix", &self.prefix.get())
            .finish()
    }
}
