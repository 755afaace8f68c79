//! Database migrations

use crate::error::Result;
use libsql::Connection;

/// Current schema version
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
pub async fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn).await?;

    if version < 1 {
        migrate_v1(conn).await?;
    }
    if version < 2 {
        migrate_v2(conn).await?;
    }

    Ok(())
}

/// Get the current schema version
async fn get_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn
        .query(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
            (),
        )
        .await?;

    let exists: bool = if let Some(row) = rows.next().await? {
        row.get::<i32>(0)? != 0
    } else {
        false
    };

    if !exists {
        return Ok(0);
    }

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await?;

    let version: i32 = if let Some(row) = rows.next().await? {
        row.get(0)?
    } else {
        0
    };

    Ok(version)
}

/// Migration to version 1: mirrored room graph
async fn migrate_v1(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        "CREATE TABLE IF NOT EXISTS rooms (
            id INTEGER PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            category TEXT,
            host_id INTEGER,
            starts_at INTEGER,
            ends_at INTEGER,
            is_active INTEGER NOT NULL DEFAULT 1,
            fetched_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS playlist_items (
            id INTEGER PRIMARY KEY,
            room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            beatmap_id INTEGER NOT NULL,
            ruleset_id INTEGER NOT NULL DEFAULT 0,
            owner_id INTEGER,
            expired INTEGER NOT NULL DEFAULT 0
        )",
        "CREATE INDEX IF NOT EXISTS idx_playlist_items_room ON playlist_items(room_id)",
        "CREATE TABLE IF NOT EXISTS participants (
            id INTEGER PRIMARY KEY,
            username TEXT NOT NULL,
            country_code TEXT,
            avatar_url TEXT,
            updated_at INTEGER NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS room_participants (
            room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL REFERENCES participants(id) ON DELETE CASCADE,
            PRIMARY KEY (room_id, user_id)
        )",
        "CREATE TABLE IF NOT EXISTS scores (
            id INTEGER PRIMARY KEY,
            room_id INTEGER NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            playlist_item_id INTEGER NOT NULL REFERENCES playlist_items(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL,
            total_score INTEGER NOT NULL,
            accuracy REAL NOT NULL DEFAULT 0,
            max_combo INTEGER NOT NULL DEFAULT 0,
            passed INTEGER NOT NULL DEFAULT 0,
            rank TEXT,
            ended_at INTEGER
        )",
        "CREATE INDEX IF NOT EXISTS idx_scores_item ON scores(playlist_item_id)",
        "CREATE INDEX IF NOT EXISTS idx_scores_room_user ON scores(room_id, user_id)",
        "CREATE TABLE IF NOT EXISTS room_winners (
            room_id INTEGER PRIMARY KEY REFERENCES rooms(id) ON DELETE CASCADE,
            user_id INTEGER NOT NULL,
            total_score INTEGER NOT NULL,
            computed_at INTEGER NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (1)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("migrated database to version 1");
    Ok(())
}

/// Migration to version 2: sync bookkeeping
async fn migrate_v2(conn: &Connection) -> Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS resource_freshness (
            resource_kind TEXT NOT NULL,
            resource_id INTEGER NOT NULL,
            last_updated INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (resource_kind, resource_id)
        )",
        "CREATE TABLE IF NOT EXISTS sync_locks (
            lock_id TEXT PRIMARY KEY,
            holder_id TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            expires_at INTEGER NOT NULL,
            resource_kind TEXT NOT NULL,
            resource_id INTEGER NOT NULL
        )",
        "CREATE INDEX IF NOT EXISTS idx_sync_locks_expires ON sync_locks(expires_at)",
        "CREATE TABLE IF NOT EXISTS usage_aggregates (
            period TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        "INSERT INTO schema_version (version) VALUES (2)",
    ];

    apply(conn, &statements).await?;
    tracing::info!("migrated database to version 2");
    Ok(())
}

/// Runs `statements` in one transaction, rolling back on the first failure.
async fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    conn.execute("BEGIN TRANSACTION", ()).await?;

    for stmt in statements {
        if let Err(e) = conn.execute(stmt, ()).await {
            conn.execute("ROLLBACK", ()).await.ok();
            return Err(e.into());
        }
    }

    if let Err(e) = conn.execute("COMMIT", ()).await {
        conn.execute("ROLLBACK", ()).await.ok();
        return Err(e.into());
    }
    Ok(())
}
