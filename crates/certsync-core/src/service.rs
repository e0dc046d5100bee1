//! Top-level wiring
//!
//! [`CertSync`] is what a host process embeds:
//!
//! 1. [`CertSync::new`] validates the config, allocates the namespace and
//!    builds both synchronizers over one shared reader source
//! 2. the host registers listeners on [`CertSync::record_events`] /
//!    [`CertSync::group_events`]
//! 3. [`CertSync::start`] spawns both poll loops
//! 4. [`CertSync::shutdown`] stops them and waits for in-flight steps
//!
//! Registering before `start` guarantees listeners see the first poll.

use std::sync::Arc;

use tracing::info;

use crate::bus::ChangeEventBus;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::namespace::KeyNamespaceAllocator;
use crate::reader::{DecryptErrorHandler, DecryptErrorLog, ReaderSource};
use crate::sync::groups::GroupChangeSet;
use crate::sync::records::RecordChangeSet;
use crate::sync::{EntityGrouper, PollHandle, RecordSynchronizer};
use crate::traits::{KeyValueStore, LockService};

/// Embedded certificate sync service
pub struct CertSync {
    config: SyncConfig,
    namespace: String,
    source: ReaderSource,
    records: Arc<RecordSynchronizer>,
    groups: Arc<EntityGrouper>,
    decrypt_errors: Arc<DecryptErrorLog>,
    loops: Vec<PollHandle>,
}

impl CertSync {
    /// Build the service
    ///
    /// # Parameters
    ///
    /// - `store`: Key-value store holding the records
    /// - `locks`: Lock service used for namespace allocation
    /// - `config`: Service configuration
    ///
    /// # Returns
    ///
    /// - `Ok(CertSync)`: Namespace allocated, synchronizers ready, not polling
    /// - `Err(Error::Validation)`: Invalid configuration
    /// - `Err(Error::LockAcquisition)`: Namespace lock could not be taken
    pub async fn new(
        store: Arc<dyn KeyValueStore>,
        locks: Arc<dyn LockService>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;

        let allocator =
            KeyNamespaceAllocator::new(Arc::clone(&store), locks, config.namespace.clone())?;
        let namespace = allocator.prefix().await?.to_string();

        let crypto = config.crypto.build()?.map(Arc::new);
        let decrypt_errors = Arc::new(DecryptErrorLog::new(config.decrypt_error_log_interval()));
        let source = ReaderSource::new(store, crypto, namespace.clone()).with_decrypt_error_handler(
            DecryptErrorHandler::rate_limited(Arc::clone(&decrypt_errors)),
        );

        let records = Arc::new(RecordSynchronizer::new(source.clone()));
        let groups = Arc::new(EntityGrouper::new(source.clone(), config.groups.clone())?);

        info!(
            "certsync ready: namespace={}, encrypted={}",
            namespace,
            config.crypto.aes_key.is_some()
        );

        Ok(Self {
            config,
            namespace,
            source,
            records,
            groups,
            decrypt_errors,
            loops: Vec::new(),
        })
    }

    /// The allocated namespace prefix
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Reader source scoped to the namespace
    pub fn readers(&self) -> &ReaderSource {
        &self.source
    }

    /// Record-level synchronizer
    pub fn records(&self) -> &Arc<RecordSynchronizer> {
        &self.records
    }

    /// Group-level synchronizer
    pub fn groups(&self) -> &Arc<EntityGrouper> {
        &self.groups
    }

    /// Record change sets
    pub fn record_events(&self) -> &ChangeEventBus<RecordChangeSet> {
        self.records.events()
    }

    /// Group change sets
    pub fn group_events(&self) -> &ChangeEventBus<GroupChangeSet> {
        self.groups.events()
    }

    /// Shared decrypt failure log
    pub fn decrypt_errors(&self) -> &DecryptErrorLog {
        &self.decrypt_errors
    }

    /// Spawn both poll loops; calling again while running does nothing
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        self.loops = vec![
            self.records.spawn(self.config.records.poll_interval()),
            self.groups.spawn(self.config.groups.poll_interval()),
        ];
        info!("certsync started");
    }

    /// Whether both poll loops are alive
    pub fn is_running(&self) -> bool {
        !self.loops.is_empty() && self.loops.iter().all(PollHandle::is_running)
    }

    /// Stop both loops and wait for in-flight steps to finish
    pub async fn shutdown(mut self) -> Result<()> {
        for handle in &self.loops {
            handle.stop();
        }
        for handle in self.loops.drain(..) {
            handle.join().await?;
        }
        info!("certsync stopped");
        Ok(())
    }
}

impl std::fmt::Debug for CertSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertSync")
            .field("namespace", &self.namespace)
            .field("running", &self.is_running())
            .finish()
    }
}
