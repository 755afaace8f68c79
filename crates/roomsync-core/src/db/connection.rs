//! Database connection management

use crate::error::{Error, Result};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use std::path::Path;

use super::migrations;

/// Where the connection points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    InMemory,
    Remote,
}

/// Database wrapper for libSQL connections
pub struct Database {
    // Keeps the underlying database alive for as long as the connection.
    _db: LibSqlDatabase,
    conn: Connection,
    location: Location,
}

impl Database {
    /// Open a local database file, creating it if it doesn't exist
    ///
    /// Runs migrations automatically. Several processes may open the same
    /// file; lock and freshness writes are conditioned statements, so they
    /// stay correct across processes.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::connect(db, Location::Local).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::connect(db, Location::InMemory).await
    }

    /// Open a remote libSQL database shared by every instance
    pub async fn open_remote(url: &str, auth_token: &str) -> Result<Self> {
        if url.trim().is_empty() {
            return Err(Error::InvalidInput("Remote database URL is required".into()));
        }
        if auth_token.trim().is_empty() {
            return Err(Error::InvalidInput("Auth token is required".into()));
        }
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await?;
        Self::connect(db, Location::Remote).await
    }

    async fn connect(db: LibSqlDatabase, location: Location) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self {
            _db: db,
            conn,
            location,
        };
        database.configure().await?;
        database.migrate().await?;
        tracing::debug!(?location, "database ready");
        Ok(database)
    }

    /// Configure `SQLite` pragmas; remote connections ignore most of them
    async fn configure(&self) -> Result<()> {
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA busy_timeout = 5000;", ())
            .await
            .ok();
        let foreign_keys = self.conn.execute("PRAGMA foreign_keys = ON;", ()).await;
        if self.location != Location::Remote {
            foreign_keys?;
        }
        Ok(())
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    pub const fn location(&self) -> Location {
        self.location
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        assert_eq!(db.location(), Location::InMemory);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_file_twice_reuses_schema() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mirror.db");

        let first = Database::open(&path).await.unwrap();
        drop(first);
        let second = Database::open(&path).await.unwrap();

        let mut rows = second
            .connection()
            .query("SELECT COUNT(*) FROM schema_version", ())
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        let versions: i64 = row.get(0).unwrap();
        assert_eq!(versions, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_remote_requires_credentials() {
        let err = Database::open_remote("libsql://mirror.turso.io", " ")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Auth token is required"));
    }
}
