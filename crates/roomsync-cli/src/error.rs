use std::io;

use roomsync_core::config::ConfigError;
use roomsync_core::upstream::UpstreamError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] roomsync_core::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Upstream client setup failed: {0}")]
    Upstream(#[from] UpstreamError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Sync of {resource} failed: {error}")]
    SyncFailed { resource: String, error: String },
    #[error("Sync of {0} ended without reporting an outcome")]
    SyncAbandoned(String),
}
