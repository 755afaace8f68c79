//! Upstream multiplayer API collaborator.
//!
//! The sync engine only needs two calls: fetch a room, and fetch one page of
//! a playlist item's scores. [`HttpUpstream`] talks to the real API;
//! [`TrackedUpstream`] wraps any implementation and reports every call to the
//! usage ledger.

mod http;
mod tracked;

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::models::{Room, Score};

pub use http::HttpUpstream;
pub use tracked::TrackedUpstream;

/// Upstream failures, split by whether a retry can help.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("upstream server error: HTTP {0}")]
    Server(u16),
    #[error("upstream request timed out")]
    Timeout,
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream resource not found: {0}")]
    NotFound(String),
    #[error("upstream rejected request with HTTP {status}: {body}")]
    Client { status: u16, body: String },
    #[error("invalid upstream payload: {0}")]
    Decode(String),
}

impl UpstreamError {
    /// Timeouts, 5xx, 429 and connection failures are worth retrying.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server(_) | Self::Timeout | Self::Transport(_)
        )
    }

    /// Server-provided delay before the next attempt, if any.
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// A decoded response together with its size on the wire.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub size_bytes: u64,
}

impl<T> Fetched<T> {
    pub const fn new(value: T, size_bytes: u64) -> Self {
        Self { value, size_bytes }
    }
}

/// One page of a playlist item's scores.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScorePage {
    #[serde(default, rename = "scores")]
    pub items: Vec<Score>,
    /// Opaque cursor for the next page; absent on the last page.
    #[serde(default, rename = "cursor_string")]
    pub next_cursor: Option<String>,
}

/// Narrow contract the ingestion pipeline consumes.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    async fn fetch_room(&self, room_id: i64) -> UpstreamResult<Fetched<Room>>;

    async fn fetch_scores_page(
        &self,
        room_id: i64,
        playlist_item_id: i64,
        cursor: Option<&str>,
    ) -> UpstreamResult<Fetched<ScorePage>>;
}
