//! Durable TTL lock guarding refreshes of one resource.
//!
//! Acquisition is an insert against a unique lock id. An expired record is
//! reclaimed with an update conditioned on its old deadline, so among
//! concurrent reclaimers exactly one wins. Storage errors always reject.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::{duration_ms, Clock};
use crate::error::Result;
use crate::models::{LockRecord, ResourceKey};
use crate::store::LockStore;

/// Why a lock could not be taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockRejection {
    /// Another holder's lock is still live.
    Held,
    /// The lock had expired but another contender reclaimed it first.
    ReclaimLost,
    /// The record kept changing under us; treat as held.
    Contended,
    /// Storage could not confirm ownership.
    Storage(String),
}

impl fmt::Display for LockRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held => f.write_str("held by another holder"),
            Self::ReclaimLost => f.write_str("expired lock reclaimed by another holder"),
            Self::Contended => f.write_str("lock record contended"),
            Self::Storage(error) => write!(f, "storage error: {error}"),
        }
    }
}

pub enum LockAcquisition {
    Held(LockLease),
    Rejected {
        reason: LockRejection,
        existing: Option<LockRecord>,
    },
}

impl LockAcquisition {
    fn rejected(reason: LockRejection, existing: Option<LockRecord>) -> Self {
        Self::Rejected { reason, existing }
    }

    pub const fn is_held(&self) -> bool {
        matches!(self, Self::Held(_))
    }
}

impl fmt::Debug for LockAcquisition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Held(lease) => f.debug_tuple("Held").field(lease.record()).finish(),
            Self::Rejected { reason, existing } => f
                .debug_struct("Rejected")
                .field("reason", reason)
                .field("existing", existing)
                .finish(),
        }
    }
}

pub struct ResourceLockService {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ResourceLockService {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn acquire(&self, key: ResourceKey, holder_id: &str) -> LockAcquisition {
        self.acquire_with_ttl(key, holder_id, self.ttl).await
    }

    pub async fn acquire_with_ttl(
        &self,
        key: ResourceKey,
        holder_id: &str,
        ttl: Duration,
    ) -> LockAcquisition {
        let now = self.clock.now_ms();
        let record = LockRecord::new(key, holder_id, now, duration_ms(ttl));

        // A second pass only happens when the conflicting row vanished between
        // the insert and the read.
        for _ in 0..2 {
            match self.store.insert_lock_if_absent(&record).await {
                Ok(true) => {
                    debug!(resource = %key, holder = holder_id, "lock acquired");
                    return LockAcquisition::Held(self.lease(record));
                }
                Ok(false) => {}
                Err(error) => return storage_rejection(key, &error),
            }

            let existing = match self.store.read_lock(&record.lock_id).await {
                Ok(Some(existing)) => existing,
                Ok(None) => continue,
                Err(error) => return storage_rejection(key, &error),
            };
            if !existing.is_expired(now) {
                debug!(
                    resource = %key,
                    holder = %existing.holder_id,
                    expires_at = existing.expires_at,
                    "lock held elsewhere"
                );
                return LockAcquisition::rejected(LockRejection::Held, Some(existing));
            }

            return match self
                .store
                .replace_lock_if_expired(existing.expires_at, &record)
                .await
            {
                Ok(true) => {
                    info!(
                        resource = %key,
                        holder = holder_id,
                        previous = %existing.holder_id,
                        "reclaimed expired lock"
                    );
                    LockAcquisition::Held(self.lease(record))
                }
                Ok(false) => LockAcquisition::rejected(LockRejection::ReclaimLost, Some(existing)),
                Err(error) => storage_rejection(key, &error),
            };
        }

        LockAcquisition::rejected(LockRejection::Contended, None)
    }

    /// Deletes the lock if `holder_id` still owns it. Releasing someone
    /// else's lock, or one that is gone, does nothing.
    pub async fn release(&self, key: ResourceKey, holder_id: &str) -> bool {
        release_lock(self.store.as_ref(), &key.lock_id(), holder_id).await
    }

    /// Removes locks nobody reclaimed after their deadline.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let removed = self
            .store
            .delete_expired_locks(self.clock.now_ms())
            .await?;
        if removed > 0 {
            info!(removed, "swept expired sync locks");
        }
        Ok(removed)
    }

    pub async fn current(&self, key: ResourceKey) -> Result<Option<LockRecord>> {
        let now = self.clock.now_ms();
        Ok(self
            .store
            .read_lock(&key.lock_id())
            .await?
            .filter(|record| !record.is_expired(now)))
    }

    fn lease(&self, record: LockRecord) -> LockLease {
        LockLease {
            store: Arc::clone(&self.store),
            record,
            released: false,
        }
    }
}

fn storage_rejection(key: ResourceKey, error: &crate::Error) -> LockAcquisition {
    warn!(resource = %key, %error, "lock acquisition failed closed");
    LockAcquisition::rejected(LockRejection::Storage(error.to_string()), None)
}

async fn release_lock(store: &dyn LockStore, lock_id: &str, holder_id: &str) -> bool {
    match store.delete_lock_if_held(lock_id, holder_id).await {
        Ok(true) => {
            debug!(lock_id, holder = holder_id, "lock released");
            true
        }
        Ok(false) => {
            debug!(lock_id, holder = holder_id, "lock already gone or reclaimed");
            false
        }
        Err(error) => {
            warn!(lock_id, holder = holder_id, %error, "lock release failed; it will expire");
            false
        }
    }
}

/// Proof of holding a resource lock.
///
/// Call [`LockLease::release`] when done. A lease dropped without release
/// schedules the delete on the current runtime.
pub struct LockLease {
    store: Arc<dyn LockStore>,
    record: LockRecord,
    released: bool,
}

impl LockLease {
    pub const fn record(&self) -> &LockRecord {
        &self.record
    }

    pub async fn release(mut self) -> bool {
        self.released = true;
        release_lock(self.store.as_ref(), &self.record.lock_id, &self.record.holder_id).await
    }
}

impl fmt::Debug for LockLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockLease")
            .field("record", &self.record)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                lock_id = %self.record.lock_id,
                "lease dropped outside a runtime; lock will expire"
            );
            return;
        };
        let store = Arc::clone(&self.store);
        let lock_id = self.record.lock_id.clone();
        let holder_id = self.record.holder_id.clone();
        handle.spawn(async move {
            release_lock(store.as_ref(), &lock_id, &holder_id).await;
        });
    }
}
