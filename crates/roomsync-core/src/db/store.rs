//! libSQL implementation of the storage contracts

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{params, Connection};
use tokio::sync::Mutex;

use super::Database;
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{FreshnessRecord, LockRecord, ResourceKey, RoomSnapshot, RoomWinner};
use crate::store::{FreshnessStore, LockStore, SnapshotStore, UsageStore};

/// Counts describing what the mirror currently holds for one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSummary {
    pub room_id: i64,
    pub name: String,
    pub is_active: bool,
    pub fetched_at: i64,
    pub playlist_items: i64,
    pub scores: i64,
    pub participants: i64,
    pub winner: Option<RoomWinner>,
}

/// Shared handle over one database connection.
///
/// Statements are serialised in-process by the mutex; exclusivity between
/// processes comes only from the conditioned statements themselves.
#[derive(Clone)]
pub struct LibSqlStore {
    db: Arc<Mutex<Database>>,
}

impl LibSqlStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Opens a local file, creating its parent directory if needed.
    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(Database::open(path).await?))
    }

    /// Remote when a URL is configured, otherwise the configured path or `default_path`.
    pub async fn from_config(config: &DatabaseConfig, default_path: &Path) -> Result<Self> {
        if let Some(url) = config.remote_url.as_deref() {
            let token = config.remote_auth_token.as_deref().unwrap_or_default();
            tracing::info!(url, "using remote store");
            return Self::open_remote(url, token).await;
        }
        let path = config.path.as_deref().unwrap_or(default_path);
        tracing::info!(path = %path.display(), "using local store");
        Self::open_path(path).await
    }

    pub async fn open_remote(url: &str, auth_token: &str) -> Result<Self> {
        Ok(Self::new(Database::open_remote(url, auth_token).await?))
    }

    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?))
    }

    pub async fn room_summary(&self, room_id: i64) -> Result<Option<RoomSummary>> {
        let db = self.db.lock().await;
        let conn = db.connection();

        let mut rows = conn
            .query(
                "SELECT name, is_active, fetched_at,
                    (SELECT COUNT(*) FROM playlist_items WHERE room_id = rooms.id),
                    (SELECT COUNT(*) FROM scores WHERE room_id = rooms.id),
                    (SELECT COUNT(*) FROM room_participants WHERE room_id = rooms.id)
                 FROM rooms WHERE id = ?",
                params![room_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let mut summary = RoomSummary {
            room_id,
            name: row.get(0)?,
            is_active: row.get::<i64>(1)? != 0,
            fetched_at: row.get(2)?,
            playlist_items: row.get(3)?,
            scores: row.get(4)?,
            participants: row.get(5)?,
            winner: None,
        };

        let mut rows = conn
            .query(
                "SELECT user_id, total_score, computed_at FROM room_winners WHERE room_id = ?",
                params![room_id],
            )
            .await?;
        if let Some(row) = rows.next().await? {
            summary.winner = Some(RoomWinner {
                room_id,
                user_id: row.get(0)?,
                total_score: row.get(1)?,
                computed_at: row.get(2)?,
            });
        }
        Ok(Some(summary))
    }

    fn parse_lock(row: &libsql::Row) -> Result<LockRecord> {
        let kind: String = row.get(4)?;
        Ok(LockRecord {
            lock_id: row.get(0)?,
            holder_id: row.get(1)?,
            created_at: row.get(2)?,
            expires_at: row.get(3)?,
            resource_kind: kind.parse()?,
            resource_id: row.get(5)?,
        })
    }
}

#[async_trait]
impl LockStore for LibSqlStore {
    async fn insert_lock_if_absent(&self, record: &LockRecord) -> Result<bool> {
        let db = self.db.lock().await;
        let inserted = db
            .connection()
            .execute(
                "INSERT INTO sync_locks
                    (lock_id, holder_id, created_at, expires_at, resource_kind, resource_id)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(lock_id) DO NOTHING",
                params![
                    record.lock_id.as_str(),
                    record.holder_id.as_str(),
                    record.created_at,
                    record.expires_at,
                    record.resource_kind.as_str(),
                    record.resource_id
                ],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn read_lock(&self, lock_id: &str) -> Result<Option<LockRecord>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT lock_id, holder_id, created_at, expires_at, resource_kind, resource_id
                 FROM sync_locks WHERE lock_id = ?",
                params![lock_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(Self::parse_lock(&row)?)),
            None => Ok(None),
        }
    }

    async fn replace_lock_if_expired(
        &self,
        expected_expires_at: i64,
        record: &LockRecord,
    ) -> Result<bool> {
        let db = self.db.lock().await;
        let replaced = db
            .connection()
            .execute(
                "UPDATE sync_locks
                 SET holder_id = ?, created_at = ?, expires_at = ?
                 WHERE lock_id = ? AND expires_at = ?",
                params![
                    record.holder_id.as_str(),
                    record.created_at,
                    record.expires_at,
                    record.lock_id.as_str(),
                    expected_expires_at
                ],
            )
            .await?;
        Ok(replaced == 1)
    }

    async fn delete_lock_if_held(&self, lock_id: &str, holder_id: &str) -> Result<bool> {
        let db = self.db.lock().await;
        let deleted = db
            .connection()
            .execute(
                "DELETE FROM sync_locks WHERE lock_id = ? AND holder_id = ?",
                params![lock_id, holder_id],
            )
            .await?;
        Ok(deleted == 1)
    }

    async fn delete_expired_locks(&self, now: i64) -> Result<u64> {
        let db = self.db.lock().await;
        let deleted = db
            .connection()
            .execute("DELETE FROM sync_locks WHERE expires_at < ?", params![now])
            .await?;
        Ok(deleted)
    }
}

#[async_trait]
impl FreshnessStore for LibSqlStore {
    async fn read_freshness(&self, key: &ResourceKey) -> Result<Option<FreshnessRecord>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT last_updated, is_active FROM resource_freshness
                 WHERE resource_kind = ? AND resource_id = ?",
                params![key.kind.as_str(), key.id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(FreshnessRecord {
                key: *key,
                last_updated: row.get(0)?,
                is_active: row.get::<i64>(1)? != 0,
            })),
            None => Ok(None),
        }
    }

    async fn write_freshness(&self, record: &FreshnessRecord) -> Result<()> {
        let db = self.db.lock().await;
        upsert_freshness(db.connection(), record).await
    }
}

#[async_trait]
impl UsageStore for LibSqlStore {
    async fn read_usage_aggregate(&self, period: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT payload FROM usage_aggregates WHERE period = ?",
                params![period],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn write_usage_aggregate(
        &self,
        period: &str,
        payload: &str,
        updated_at: i64,
    ) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO usage_aggregates (period, payload, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(period) DO UPDATE SET
                    payload = excluded.payload,
                    updated_at = excluded.updated_at",
                params![period, payload, updated_at],
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for LibSqlStore {
    async fn upsert_atomic(&self, key: &ResourceKey, snapshot: &RoomSnapshot) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();

        conn.execute("BEGIN IMMEDIATE", ()).await?;
        if let Err(e) = write_snapshot(conn, key, snapshot).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e);
        }
        if let Err(e) = conn.execute("COMMIT", ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }

        tracing::debug!(
            resource = %key,
            scores = snapshot.scores.len(),
            participants = snapshot.participants.len(),
            "snapshot committed"
        );
        Ok(())
    }

    async fn record_winner(&self, winner: &RoomWinner) -> Result<()> {
        let db = self.db.lock().await;
        db.connection()
            .execute(
                "INSERT INTO room_winners (room_id, user_id, total_score, computed_at)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(room_id) DO UPDATE SET
                    user_id = excluded.user_id,
                    total_score = excluded.total_score,
                    computed_at = excluded.computed_at",
                params![
                    winner.room_id,
                    winner.user_id,
                    winner.total_score,
                    winner.computed_at
                ],
            )
            .await?;
        Ok(())
    }
}

async fn write_snapshot(conn: &Connection, key: &ResourceKey, snapshot: &RoomSnapshot) -> Result<()> {
    let room = &snapshot.room;
    if room.id != key.id {
        return Err(Error::InvalidInput(format!(
            "snapshot for room {} does not belong to {key}",
            room.id
        )));
    }

    if let Some(host) = &room.host {
        upsert_participant(conn, host, snapshot.fetched_at).await?;
    }

    conn.execute(
        "INSERT INTO rooms
            (id, kind, name, category, host_id, starts_at, ends_at, is_active, fetched_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            name = excluded.name,
            category = excluded.category,
            host_id = excluded.host_id,
            starts_at = excluded.starts_at,
            ends_at = excluded.ends_at,
            is_active = excluded.is_active,
            fetched_at = MAX(rooms.fetched_at, excluded.fetched_at)",
        params![
            room.id,
            key.kind.as_str(),
            room.name.as_str(),
            room.category.clone(),
            room.host.as_ref().map(|host| host.id),
            millis(room.starts_at),
            millis(room.ends_at),
            i64::from(snapshot.is_active),
            snapshot.fetched_at
        ],
    )
    .await?;

    for item in &room.playlist {
        conn.execute(
            "INSERT INTO playlist_items (id, room_id, beatmap_id, ruleset_id, owner_id, expired)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                beatmap_id = excluded.beatmap_id,
                ruleset_id = excluded.ruleset_id,
                owner_id = excluded.owner_id,
                expired = excluded.expired",
            params![
                item.id,
                room.id,
                item.beatmap_id,
                item.ruleset_id,
                item.owner_id,
                i64::from(item.expired)
            ],
        )
        .await?;
    }

    for participant in &snapshot.participants {
        upsert_participant(conn, participant, snapshot.fetched_at).await?;
        conn.execute(
            "INSERT OR IGNORE INTO room_participants (room_id, user_id) VALUES (?, ?)",
            params![room.id, participant.id],
        )
        .await?;
    }

    for score in &snapshot.scores {
        conn.execute(
            "INSERT INTO scores
                (id, room_id, playlist_item_id, user_id, total_score, accuracy,
                 max_combo, passed, rank, ended_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                total_score = excluded.total_score,
                accuracy = excluded.accuracy,
                max_combo = excluded.max_combo,
                passed = excluded.passed,
                rank = excluded.rank,
                ended_at = excluded.ended_at",
            params![
                score.id,
                room.id,
                score.playlist_item_id,
                score.user_id,
                score.total_score,
                score.accuracy,
                score.max_combo,
                i64::from(score.passed),
                score.rank.clone(),
                millis(score.ended_at)
            ],
        )
        .await?;
    }

    upsert_freshness(
        conn,
        &FreshnessRecord {
            key: *key,
            last_updated: snapshot.fetched_at,
            is_active: snapshot.is_active,
        },
    )
    .await
}

async fn upsert_participant(
    conn: &Connection,
    participant: &crate::models::Participant,
    updated_at: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (id, username, country_code, avatar_url, updated_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            username = excluded.username,
            country_code = excluded.country_code,
            avatar_url = excluded.avatar_url,
            updated_at = excluded.updated_at",
        params![
            participant.id,
            participant.username.as_str(),
            participant.country_code.clone(),
            participant.avatar_url.clone(),
            updated_at
        ],
    )
    .await?;
    Ok(())
}

/// The stored timestamp only moves forward; `is_active` follows the newest write.
async fn upsert_freshness(conn: &Connection, record: &FreshnessRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO resource_freshness (resource_kind, resource_id, last_updated, is_active)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(resource_kind, resource_id) DO UPDATE SET
            is_active = CASE WHEN excluded.last_updated >= resource_freshness.last_updated
                THEN excluded.is_active ELSE resource_freshness.is_active END,
            last_updated = MAX(resource_freshness.last_updated, excluded.last_updated)",
        params![
            record.key.kind.as_str(),
            record.key.id,
            record.last_updated,
            i64::from(record.is_active)
        ],
    )
    .await?;
    Ok(())
}

fn millis(value: Option<DateTime<Utc>>) -> Option<i64> {
    value.map(|time| time.timestamp_millis())
}
