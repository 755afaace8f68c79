//! Durable storage contracts.
//!
//! Every cross-process guarantee (one live lock per resource, monotonic
//! freshness, all-or-nothing snapshots) lives behind these traits as a
//! conditioned statement. [`crate::db::LibSqlStore`] implements them on libSQL.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{FreshnessRecord, LockRecord, ResourceKey, RoomSnapshot, RoomWinner};

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Inserts `record` unless a row with the same lock id exists.
    /// Returns `false` on conflict.
    async fn insert_lock_if_absent(&self, record: &LockRecord) -> Result<bool>;

    async fn read_lock(&self, lock_id: &str) -> Result<Option<LockRecord>>;

    /// Overwrites the row only while its `expires_at` still equals
    /// `expected_expires_at`. Returns `false` when another writer got there first.
    async fn replace_lock_if_expired(
        &self,
        expected_expires_at: i64,
        record: &LockRecord,
    ) -> Result<bool>;

    /// Deletes the row only if `holder_id` still owns it.
    async fn delete_lock_if_held(&self, lock_id: &str, holder_id: &str) -> Result<bool>;

    /// Deletes every lock whose deadline is before `now`. Returns rows removed.
    async fn delete_expired_locks(&self, now: i64) -> Result<u64>;
}

#[async_trait]
pub trait FreshnessStore: Send + Sync {
    async fn read_freshness(&self, key: &ResourceKey) -> Result<Option<FreshnessRecord>>;

    /// Stores `MAX(current, record.last_updated)`; never moves time backwards.
    async fn write_freshness(&self, record: &FreshnessRecord) -> Result<()>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn read_usage_aggregate(&self, period: &str) -> Result<Option<String>>;

    async fn write_usage_aggregate(&self, period: &str, payload: &str, updated_at: i64)
        -> Result<()>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Writes room, playlist, participants, scores and the freshness record
    /// in one transaction. Either everything is visible afterwards or nothing is.
    async fn upsert_atomic(&self, key: &ResourceKey, snapshot: &RoomSnapshot) -> Result<()>;

    async fn record_winner(&self, winner: &RoomWinner) -> Result<()>;
}

/// Everything the sync engine needs from one backing store.
pub trait SyncStore: LockStore + FreshnessStore + UsageStore + SnapshotStore {}

impl<T> SyncStore for T where T: LockStore + FreshnessStore + UsageStore + SnapshotStore {}
