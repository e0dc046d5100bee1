//! Scoped, lease-renewing distributed lock
//!
//! [`LeaseGuard`] wraps a [`LockService`] lease:
//!
//! - acquisition retries until the lease is granted (or an optional timeout)
//! - a background task renews the lease every `lease / 3` while the guard lives
//! - `release().await` stops renewal and releases the lease
//! - dropping an unreleased guard (error path, cancelled future) stops renewal
//!   and schedules a best-effort release on the current runtime
//! - [`LeaseGuard::is_held`] turns false once the service refuses a renewal,
//!   or once renewals have failed for a full lease period
//!
//! The lease never outlives its guard by more than one lease period, even if
//! the best-effort release itself fails.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::RngCore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::traits::LockService;

/// Random lowercase hex string from `bytes` bytes of OS-seeded randomness
pub(crate) fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Lease validity shared between a guard and its renewal task
#[derive(Debug)]
struct LeaseState {
    lost: AtomicBool,
    expires_at: Mutex<Instant>,
}

impl LeaseState {
    fn new(expires_at: Instant) -> Self {
        Self {
            lost: AtomicBool::new(false),
            expires_at: Mutex::new(expires_at),
        }
    }

    fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst) && Instant::now() < self.expires_at()
    }

    fn expires_at(&self) -> Instant {
        *self.expires_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn extend(&self, expires_at: Instant) {
        *self.expires_at.lock().unwrap_or_else(|e| e.into_inner()) = expires_at;
    }

    fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }
}

/// Held lease on one lock resource
pub struct LeaseGuard {
    locks: Arc<dyn LockService>,
    resource: String,
    owner: String,
    state: Arc<LeaseState>,
    renewal: Option<JoinHandle<()>>,
    released: bool,
}

impl LeaseGuard {
    /// Acquire `resource`, retrying every `retry_delay` until granted
    ///
    /// # Parameters
    ///
    /// - `locks`: Lock service backing the lease
    /// - `resource`: Lock resource key
    /// - `lease`: Lease length; renewed every `lease / 3`
    /// - `retry_delay`: Pause between attempts while another owner holds it
    /// - `timeout`: Give up after this long; `None` waits indefinitely
    ///
    /// # Returns
    ///
    /// - `Ok(LeaseGuard)`: Lease held, renewal running
    /// - `Err(Error::LockAcquisition)`: Timed out, or the lock service failed
    pub async fn acquire(
        locks: Arc<dyn LockService>,
        resource: impl Into<String>,
        lease: Duration,
        retry_delay: Duration,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let resource = resource.into();
        let owner = random_hex(16);
        let deadline = timeout.map(|t| Instant::now() + t);

        let mut attempt_started;
        loop {
            attempt_started = Instant::now();
            let granted = locks
                .try_acquire(&resource, &owner, lease)
                .await
                .map_err(|e| {
                    Error::lock_acquisition(format!("{}: {}", resource, e))
                })?;
            if granted {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() + retry_delay > d) {
                return Err(Error::lock_acquisition(format!(
                    "{}: timed out waiting for lease",
                    resource
                )));
            }
            debug!("Lock {} is held elsewhere, retrying in {:?}", resource, retry_delay);
            tokio::time::sleep(retry_delay).await;
        }

        debug!("Acquired lock {} as {}", resource, owner);
        let state = Arc::new(LeaseState::new(attempt_started + lease));
        let renewal = tokio::spawn(renew_loop(
            Arc::clone(&locks),
            resource.clone(),
            owner.clone(),
            lease,
            Arc::clone(&state),
        ));

        Ok(Self {
            locks,
            resource,
            owner,
            state,
            renewal: Some(renewal),
            released: false,
        })
    }

    /// Whether the lease is still known to be held
    ///
    /// Work that relies on exclusion must check this after the fact as well
    /// as before: a lease can lapse while a slow write is in flight.
    pub fn is_held(&self) -> bool {
        !self.released && self.state.is_held()
    }

    /// Fail with `Error::LockAcquisition` unless the lease is still held
    pub fn ensure_held(&self) -> Result<()> {
        if self.is_held() {
            Ok(())
        } else {
            Err(Error::lock_acquisition(format!(
                "{}: lease lost while held",
                self.resource
            )))
        }
    }

    /// The locked resource key
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// This guard's owner token
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Stop renewal and release the lease
    pub async fn release(mut self) -> Result<()> {
        self.stop_renewal();
        self.released = true;
        self.locks.release(&self.resource, &self.owner).await?;
        debug!("Released lock {}", self.resource);
        Ok(())
    }

    fn stop_renewal(&mut self) {
        if let Some(handle) = self.renewal.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("resource", &self.resource)
            .field("owner", &self.owner)
            .field("held", &self.is_held())
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.stop_renewal();
        if self.released {
            return;
        }
        let locks = Arc::clone(&self.locks);
        let resource = std::mem::take(&mut self.resource);
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = locks.release(&resource, &owner).await {
                        warn!("Failed to release dropped lock {}: {}", resource, e);
                    }
                });
            }
            Err(_) => {
                warn!("Lock {} dropped outside a runtime; lease will expire", resource);
            }
        }
    }
}

async fn renew_loop(
    locks: Arc<dyn LockService>,
    resource: String,
    owner: String,
    lease: Duration,
    state: Arc<LeaseState>,
) {
    let period = (lease / 3).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let attempt_started = Instant::now();
        match locks.renew(&resource, &owner, lease).await {
            Ok(true) => {
                state.extend(attempt_started + lease);
                debug!("Renewed lock {}", resource);
            }
            Ok(false) => {
                state.mark_lost();
                error!("Lost lease on lock {}", resource);
                return;
            }
            Err(e) if Instant::now() >= state.expires_at() => {
                state.mark_lost();
                error!("Lease on lock {} expired, last renewal failed: {}", resource, e);
                return;
            }
            Err(e) => warn!("Failed to renew lock {}: {}", resource, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKeyValueStore;

    #[tokio::test]
    async fn lease_outlives_its_period_while_held() {
        let store = MemoryKeyValueStore::new();
        let guard = LeaseGuard::acquire(
            Arc::new(store.clone()),
            "res",
            Duration::from_millis(60),
            Duration::from_millis(5),
            None,
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.lease_owner("res").await.as_deref(), Some(guard.owner()));

        guard.release().await.unwrap();
        assert_eq!(store.lease_owner("res").await, None);
    }

    #[tokio::test]
    async fn second_owner_waits_then_times_out() {
        let store = MemoryKeyValueStore::new();
        let locks: Arc<dyn LockService> = Arc::new(store.clone());
        let _held = LeaseGuard::acquire(
            Arc::clone(&locks),
            "res",
            Duration::from_secs(10),
            Duration::from_millis(5),
            None,
        )
        .await
        .unwrap();

        let result = LeaseGuard::acquire(
            locks,
            "res",
            Duration::from_secs(10),
            Duration::from_millis(5),
            Some(Duration::from_millis(50)),
        )
        .await;
        assert!(matches!(result, Err(Error::LockAcquisition(_))));
    }

    #[tokio::test]
    async fn refused_renewal_marks_lease_lost() {
        let store = MemoryKeyValueStore::new();
        let guard = LeaseGuard::acquire(
            Arc::new(store.clone()),
            "res",
            Duration::from_millis(60),
            Duration::from_millis(5),
            None,
        )
        .await
        .unwrap();
        assert!(guard.is_held());
        assert!(guard.ensure_held().is_ok());

        // Someone else takes over the resource behind our back
        store.release("res", guard.owner()).await.unwrap();
        assert!(store.try_acquire("res", "other", Duration::from_secs(10)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!guard.is_held());
        assert!(matches!(guard.ensure_held(), Err(Error::LockAcquisition(_))));
    }

    #[tokio::test]
    async fn dropped_guard_releases_lease() {
        let store = MemoryKeyValueStore::new();
        let guard = LeaseGuard::acquire(
            Arc::new(store.clone()),
            "res",
            Duration::from_secs(10),
            Duration::from_millis(5),
            None,
        )
        .await
        .unwrap();
        drop(guard);

        for _ in 0..50 {
            if store.lease_owner("res").await.is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("dropped guard did not release its lease");
    }

    #[test]
    fn random_hex_has_requested_length() {
        let token = random_hex(8);
        assert_eq!(token.len(), 16);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_hex(8), token);
    }
}
