//! Usage-reporting wrapper around any [`UpstreamApi`].

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::debug;

use super::{Fetched, ScorePage, UpstreamApi, UpstreamResult};
use crate::models::Room;
use crate::usage::{CallClass, UsageAccountant};

const ROOM_ENDPOINT: &str = "rooms/{id}";
const SCORES_ENDPOINT: &str = "rooms/{id}/playlist/{item}/scores";

/// Measures every upstream call and records it as an external call.
///
/// Endpoint keys are templated so one busy room does not grow the ledger.
#[derive(Clone)]
pub struct TrackedUpstream {
    inner: Arc<dyn UpstreamApi>,
    usage: Arc<UsageAccountant>,
}

impl TrackedUpstream {
    pub fn new(inner: Arc<dyn UpstreamApi>, usage: Arc<UsageAccountant>) -> Self {
        Self { inner, usage }
    }

    fn track<T>(&self, endpoint: &str, started: Instant, result: &UpstreamResult<Fetched<T>>) {
        let (success, size_bytes) = match result {
            Ok(fetched) => (true, fetched.size_bytes),
            Err(_) => (false, 0),
        };
        let count = self.usage.record_call(
            CallClass::External,
            endpoint,
            started.elapsed(),
            success,
            size_bytes,
        );
        debug!(endpoint, success, size_bytes, count, "upstream call");
    }
}

#[async_trait]
impl UpstreamApi for TrackedUpstream {
    async fn fetch_room(&self, room_id: i64) -> UpstreamResult<Fetched<Room>> {
        let started = Instant::now();
        let result = self.inner.fetch_room(room_id).await;
        self.track(ROOM_ENDPOINT, started, &result);
        result
    }

    async fn fetch_scores_page(
        &self,
        room_id: i64,
        playlist_item_id: i64,
        cursor: Option<&str>,
    ) -> UpstreamResult<Fetched<ScorePage>> {
        let started = Instant::now();
        let result = self
            .inner
            .fetch_scores_page(room_id, playlist_item_id, cursor)
            .await;
        self.track(SCORES_ENDPOINT, started, &result);
        result
    }
}
