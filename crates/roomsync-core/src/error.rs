//! Error types for roomsync-core

use thiserror::Error;

use crate::upstream::UpstreamError;

/// Result type alias using roomsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in roomsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream API error
    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Ingestion run could not produce a committable snapshot
    #[error("Ingestion failed: {0}")]
    Ingest(String),
}

impl Error {
    /// Whether a storage failure is worth retrying (lock contention, busy database).
    pub fn is_transient_storage(&self) -> bool {
        let message = match self {
            Self::Database(_) | Self::LibSql(_) | Self::Io(_) => self.to_string(),
            _ => return false,
        };
        let message = message.to_ascii_lowercase();
        message.contains("database is locked")
            || message.contains("database busy")
            || message.contains("sqlite_busy")
            || message.contains("temporarily unavailable")
            || message.contains("connection reset")
    }
}
