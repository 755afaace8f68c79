//! Test fixtures: a scripted upstream, stores that fail on demand, and builders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::db::LibSqlStore;
use crate::error::{Error, Result};
use crate::models::{
    FreshnessRecord, LockRecord, Participant, PlaylistItem, ResourceKey, Room, RoomSnapshot,
    RoomWinner, Score,
};
use crate::store::{FreshnessStore, LockStore, SnapshotStore, UsageStore};
use crate::upstream::{Fetched, ScorePage, UpstreamApi, UpstreamError, UpstreamResult};

pub(crate) fn participant(id: i64) -> Participant {
    Participant {
        id,
        username: format!("player{id}"),
        country_code: Some("JP".to_string()),
        avatar_url: None,
    }
}

pub(crate) fn score(id: i64, user_id: i64, playlist_item_id: i64, total_score: i64) -> Score {
    Score {
        id,
        user_id,
        playlist_item_id,
        total_score,
        accuracy: 0.95,
        max_combo: 300,
        passed: true,
        rank: Some("A".to_string()),
        ended_at: None,
        user: Some(participant(user_id)),
    }
}

pub(crate) fn room_with_playlist(room_id: i64, item_ids: &[i64]) -> Room {
    Room {
        id: room_id,
        name: format!("Daily Challenge #{room_id}"),
        category: Some("daily_challenge".to_string()),
        active: None,
        starts_at: None,
        ends_at: None,
        host: Some(participant(1)),
        playlist: item_ids
            .iter()
            .map(|&id| PlaylistItem {
                id,
                room_id,
                beatmap_id: id * 10,
                ruleset_id: 0,
                owner_id: Some(1),
                expired: false,
            })
            .collect(),
    }
}

/// Upstream whose responses are scripted per playlist item and page.
///
/// Cursors are `page-N`. The room fetch waits while the gate is closed,
/// which keeps a run in flight for as long as a test needs.
pub(crate) struct FakeUpstream {
    room: Mutex<Room>,
    pages: Mutex<HashMap<i64, Vec<Vec<Score>>>>,
    one_shot: Mutex<HashMap<(i64, usize), VecDeque<UpstreamError>>>,
    broken: Mutex<HashSet<i64>>,
    endless: Mutex<HashSet<i64>>,
    room_failures: Mutex<VecDeque<UpstreamError>>,
    gate: watch::Sender<bool>,
    room_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl FakeUpstream {
    pub(crate) fn new(room: Room) -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            room: Mutex::new(room),
            pages: Mutex::new(HashMap::new()),
            one_shot: Mutex::new(HashMap::new()),
            broken: Mutex::new(HashSet::new()),
            endless: Mutex::new(HashSet::new()),
            room_failures: Mutex::new(VecDeque::new()),
            gate,
            room_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_pages(&self, playlist_item_id: i64, pages: Vec<Vec<Score>>) {
        self.pages.lock().unwrap().insert(playlist_item_id, pages);
    }

    pub(crate) fn set_room(&self, room: Room) {
        *self.room.lock().unwrap() = room;
    }

    /// Fails the next request for one page with `error`.
    pub(crate) fn fail_page(&self, playlist_item_id: i64, page: usize, error: UpstreamError) {
        self.one_shot
            .lock()
            .unwrap()
            .entry((playlist_item_id, page))
            .or_default()
            .push_back(error);
    }

    /// Every request for this playlist fails with a 503.
    pub(crate) fn break_playlist(&self, playlist_item_id: i64) {
        self.broken.lock().unwrap().insert(playlist_item_id);
    }

    /// This playlist always hands out another cursor.
    pub(crate) fn endless_cursor(&self, playlist_item_id: i64) {
        self.endless.lock().unwrap().insert(playlist_item_id);
    }

    pub(crate) fn fail_room(&self, error: UpstreamError) {
        self.room_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    pub(crate) fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    pub(crate) fn room_calls(&self) -> usize {
        self.room_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn fetch_room(&self, _room_id: i64) -> UpstreamResult<Fetched<Room>> {
        let mut gate = self.gate.subscribe();
        gate.wait_for(|open| *open).await.ok();

        self.room_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.room_failures.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(Fetched::new(self.room.lock().unwrap().clone(), 512))
    }

    async fn fetch_scores_page(
        &self,
        _room_id: i64,
        playlist_item_id: i64,
        cursor: Option<&str>,
    ) -> UpstreamResult<Fetched<ScorePage>> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        let page = cursor
            .and_then(|cursor| cursor.strip_prefix("page-"))
            .and_then(|index| index.parse::<usize>().ok())
            .unwrap_or(0);

        if self.broken.lock().unwrap().contains(&playlist_item_id) {
            return Err(UpstreamError::Server(503));
        }
        if let Some(error) = self
            .one_shot
            .lock()
            .unwrap()
            .get_mut(&(playlist_item_id, page))
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }
        if self.endless.lock().unwrap().contains(&playlist_item_id) {
            let page_data = ScorePage {
                items: Vec::new(),
                next_cursor: Some(format!("page-{}", page + 1)),
            };
            return Ok(Fetched::new(page_data, 64));
        }

        let pages = self.pages.lock().unwrap();
        let scripted = pages.get(&playlist_item_id);
        let items = scripted
            .and_then(|pages| pages.get(page))
            .cloned()
            .unwrap_or_default();
        let has_more = scripted.is_some_and(|pages| page + 1 < pages.len());
        let size = 128 * (items.len() as u64 + 1);
        Ok(Fetched::new(
            ScorePage {
                items,
                next_cursor: has_more.then(|| format!("page-{}", page + 1)),
            },
            size,
        ))
    }
}

/// Store whose every operation fails, for fail-closed checks.
pub(crate) struct FailingStore;

fn unavailable() -> Error {
    Error::Database("disk I/O error".to_string())
}

#[async_trait]
impl LockStore for FailingStore {
    async fn insert_lock_if_absent(&self, _record: &LockRecord) -> Result<bool> {
        Err(unavailable())
    }

    async fn read_lock(&self, _lock_id: &str) -> Result<Option<LockRecord>> {
        Err(unavailable())
    }

    async fn replace_lock_if_expired(&self, _expected: i64, _record: &LockRecord) -> Result<bool> {
        Err(unavailable())
    }

    async fn delete_lock_if_held(&self, _lock_id: &str, _holder_id: &str) -> Result<bool> {
        Err(unavailable())
    }

    async fn delete_expired_locks(&self, _now: i64) -> Result<u64> {
        Err(unavailable())
    }
}

#[async_trait]
impl FreshnessStore for FailingStore {
    async fn read_freshness(&self, _key: &ResourceKey) -> Result<Option<FreshnessRecord>> {
        Err(unavailable())
    }

    async fn write_freshness(&self, _record: &FreshnessRecord) -> Result<()> {
        Err(unavailable())
    }
}

#[async_trait]
impl UsageStore for FailingStore {
    async fn read_usage_aggregate(&self, _period: &str) -> Result<Option<String>> {
        Err(unavailable())
    }

    async fn write_usage_aggregate(&self, _period: &str, _payload: &str, _at: i64) -> Result<()> {
        Err(unavailable())
    }
}

#[async_trait]
impl SnapshotStore for FailingStore {
    async fn upsert_atomic(&self, _key: &ResourceKey, _snapshot: &RoomSnapshot) -> Result<()> {
        Err(unavailable())
    }

    async fn record_winner(&self, _winner: &RoomWinner) -> Result<()> {
        Err(unavailable())
    }
}

/// Real libSQL store with scripted failures layered over some writes.
pub(crate) struct FlakyStore {
    inner: Arc<LibSqlStore>,
    busy_commits: AtomicUsize,
    commit_calls: AtomicUsize,
    winners_broken: AtomicBool,
    usage_broken: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new(inner: Arc<LibSqlStore>) -> Self {
        Self {
            inner,
            busy_commits: AtomicUsize::new(0),
            commit_calls: AtomicUsize::new(0),
            winners_broken: AtomicBool::new(false),
            usage_broken: AtomicBool::new(false),
        }
    }

    /// The next `count` snapshot commits fail with a locked database.
    pub(crate) fn busy_commits(&self, count: usize) {
        self.busy_commits.store(count, Ordering::SeqCst);
    }

    pub(crate) fn break_winners(&self) {
        self.winners_broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn break_usage_writes(&self) {
        self.usage_broken.store(true, Ordering::SeqCst);
    }

    pub(crate) fn commit_calls(&self) -> usize {
        self.commit_calls.load(Ordering::SeqCst)
    }
}

fn busy() -> Error {
    Error::Database("database is locked".to_string())
}

#[async_trait]
impl LockStore for FlakyStore {
    async fn insert_lock_if_absent(&self, record: &LockRecord) -> Result<bool> {
        self.inner.insert_lock_if_absent(record).await
    }

    async fn read_lock(&self, lock_id: &str) -> Result<Option<LockRecord>> {
        self.inner.read_lock(lock_id).await
    }

    async fn replace_lock_if_expired(&self, expected: i64, record: &LockRecord) -> Result<bool> {
        self.inner.replace_lock_if_expired(expected, record).await
    }

    async fn delete_lock_if_held(&self, lock_id: &str, holder_id: &str) -> Result<bool> {
        self.inner.delete_lock_if_held(lock_id, holder_id).await
    }

    async fn delete_expired_locks(&self, now: i64) -> Result<u64> {
        self.inner.delete_expired_locks(now).await
    }
}

#[async_trait]
impl FreshnessStore for FlakyStore {
    async fn read_freshness(&self, key: &ResourceKey) -> Result<Option<FreshnessRecord>> {
        self.inner.read_freshness(key).await
    }

    async fn write_freshness(&self, record: &FreshnessRecord) -> Result<()> {
        self.inner.write_freshness(record).await
    }
}

#[async_trait]
impl UsageStore for FlakyStore {
    async fn read_usage_aggregate(&self, period: &str) -> Result<Option<String>> {
        self.inner.read_usage_aggregate(period).await
    }

    async fn write_usage_aggregate(&self, period: &str, payload: &str, at: i64) -> Result<()> {
        if self.usage_broken.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.write_usage_aggregate(period, payload, at).await
    }
}

#[async_trait]
impl SnapshotStore for FlakyStore {
    async fn upsert_atomic(&self, key: &ResourceKey, snapshot: &RoomSnapshot) -> Result<()> {
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        let busy_now = self
            .busy_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if busy_now {
            return Err(busy());
        }
        self.inner.upsert_atomic(key, snapshot).await
    }

    async fn record_winner(&self, winner: &RoomWinner) -> Result<()> {
        if self.winners_broken.load(Ordering::SeqCst) {
            return Err(unavailable());
        }
        self.inner.record_winner(winner).await
    }
}
