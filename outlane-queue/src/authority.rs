use std::time::Duration;

use async_trait::async_trait;

use crate::{Bounce, Delivery, Lease, Result};

/// The owner of queue state.
///
/// The delivery engine only ever checks deliveries out and reports on them;
/// storage, scheduling and locking belong to the implementor.
#[async_trait]
pub trait QueueAuthority: Send + Sync {
    /// Checks out the next deliverable unit for `zone`, granting a lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority cannot be reached.
    async fn get(&self, zone: &str) -> Result<Option<Delivery>>;

    /// Marks a delivery as finished.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LockMismatch`](crate::QueueError::LockMismatch)
    /// if the lease no longer owns the delivery, or a transport error.
    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Returns a delivery to the queue, not to be retried before `ttl`.
    ///
    /// # Errors
    ///
    /// Same as [`QueueAuthority::release`].
    async fn defer(&self, lease: &Lease, ttl: Duration) -> Result<()>;

    /// Records a terminal failure for downstream notification.
    ///
    /// # Errors
    ///
    /// Returns an error if the authority cannot be reached.
    async fn bounce(&self, bounce: &Bounce) -> Result<()>;
}
