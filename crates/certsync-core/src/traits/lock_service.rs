// # Lock Service Trait
//
// Defines the distributed mutual-exclusion primitive certsync consumes.
//
// The primitive is lease based: a grant expires unless renewed. certsync
// wraps it in [`LeaseGuard`](crate::lock::LeaseGuard), which owns the
// renewal timer and guarantees release on every exit path.

use async_trait::async_trait;
use std::time::Duration;

/// Trait for lease-based distributed lock services
///
/// A lease is identified by `(resource, owner)`. `owner` is a random token
/// generated per acquisition so a stale holder can never renew or release
/// somebody else's lease.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the lease on `resource` once
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: The lease is now held by `owner` for `lease`
    /// - `Ok(false)`: Another owner holds an unexpired lease
    /// - `Err(Error)`: Transport error
    async fn try_acquire(
        &self,
        resource: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool, crate::Error>;

    /// Extend a lease held by `owner`
    ///
    /// Returns `Ok(false)` if the lease expired or belongs to someone else.
    async fn renew(&self, resource: &str, owner: &str, lease: Duration)
    -> Result<bool, crate::Error>;

    /// Release a lease held by `owner`
    ///
    /// Releasing a lease that is not held by `owner` is a no-op.
    async fn release(&self, resource: &str, owner: &str) -> Result<(), crate::Error>;
}
