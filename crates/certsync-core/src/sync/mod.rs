//! Poll-based change detection
//!
//! Both synchronizers follow the same shape:
//!
//! ```text
//! tick ──▶ poll step ──▶ diff(previous snapshot, current) ──▶ ChangeSet ──▶ bus
//!                              ▲                                  │
//!                              └──── replace snapshot ◀───────────┘
//! ```
//!
//! ## Scheduling
//!
//! [`PollHandle::spawn`] runs one task per synchronizer on an interval with
//! `MissedTickBehavior::Delay`. A step is always awaited to completion
//! before the next tick is considered, so steps of one synchronizer never
//! overlap. Stopping wakes the loop between ticks; it never aborts a step
//! that is already running.
//!
//! ## Failure
//!
//! A failed step is logged (with its innermost cause) and the loop carries on
//! with the next tick. Cancellation errors are dropped silently.

pub mod groups;
pub mod records;

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::digest::Versioned;
use crate::error::{Error, Result};

pub use groups::EntityGrouper;
pub use records::RecordSynchronizer;

/// Differences between two consecutive snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet<T, K> {
    /// Entries not present in the previous snapshot
    pub added: Vec<T>,
    /// Entries whose content hash changed
    pub updated: Vec<T>,
    /// Keys present before and missing now
    pub removed: Vec<K>,
}

impl<T, K> ChangeSet<T, K> {
    /// Whether nothing changed
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Total number of changes
    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

impl<T, K> Default for ChangeSet<T, K> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            updated: Vec::new(),
            removed: Vec::new(),
        }
    }
}

/// Compare `current` against `previous` by content hash
///
/// `added` and `updated` keep the order of `current`; `removed` is sorted.
pub fn diff<K, P, T>(previous: &HashMap<K, P>, current: &[(K, T)]) -> ChangeSet<T, K>
where
    K: Eq + Hash + Ord + Clone,
    P: Versioned,
    T: Versioned + Clone,
{
    let mut changes = ChangeSet::default();
    let mut seen = HashSet::with_capacity(current.len());

    for (key, item) in current {
        seen.insert(key);
        match previous.get(key) {
            None => changes.added.push(item.clone()),
            Some(before) if before.content_hash() != item.content_hash() => {
                changes.updated.push(item.clone())
            }
            Some(_) => {}
        }
    }

    changes.removed = previous
        .keys()
        .filter(|key| !seen.contains(key))
        .cloned()
        .collect();
    changes.removed.sort();
    changes
}

/// One scheduled unit of work
#[async_trait]
pub trait PollStep: Send + Sync + 'static {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Run one poll step
    async fn poll_step(&self) -> Result<()>;
}

/// Handle to a running poll loop
///
/// Dropping the handle stops the loop after any in-flight step finishes.
#[derive(Debug)]
pub struct PollHandle {
    name: String,
    stop_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    /// Spawn a loop running `step` every `interval`
    ///
    /// The first step runs immediately.
    pub fn spawn<S: PollStep>(step: Arc<S>, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let name = step.name().to_string();
        let task = tokio::spawn(run_loop(step, interval, stop_rx));
        Self {
            name,
            stop_tx,
            task: Some(task),
        }
    }

    /// Name of the step this loop drives
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop has not been stopped and is still alive
    pub fn is_running(&self) -> bool {
        !*self.stop_tx.borrow() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Prevent further steps from being scheduled
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Stop and wait for the loop (and any in-flight step) to finish
    pub async fn join(mut self) -> Result<()> {
        self.stop();
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| Error::Other(format!("{} poll loop failed: {}", self.name, e))),
            None => Ok(()),
        }
    }
}

async fn run_loop<S: PollStep>(step: Arc<S>, interval: Duration, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!("{} poll loop started ({:?})", step.name(), interval);

    loop {
        if *stop_rx.borrow() {
            break;
        }
        tokio::select! {
            biased;

            changed = stop_rx.changed() => {
                // Sender dropped counts as stop
                if changed.is_err() {
                    break;
                }
            }

            _ = ticker.tick() => {
                if let Err(e) = step.poll_step().await {
                    if !e.is_cancellation() {
                        warn!(
                            "{} poll step failed: {} (cause: {})",
                            step.name(),
                            e,
                            e.root_cause()
                        );
                    }
                }
            }
        }
    }

    debug!("{} poll loop stopped", step.name());
}
