//! Ingestion pipeline: lock, fetch the room and every playlist's scores,
//! commit one atomic snapshot, release.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncTuning;
use crate::error::{Error, Result};
use crate::lock::{LockAcquisition, LockLease, LockRejection, ResourceLockService};
use crate::models::{JobId, Participant, ResourceKey, Room, RoomSnapshot, RoomWinner, Score};
use crate::store::SnapshotStore;
use crate::upstream::{UpstreamApi, UpstreamResult};

/// Where a run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Queued,
    Locked,
    FetchingParent,
    FetchingChildren,
    Committing,
    Finalizing,
}

impl JobStage {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Locked => "locked",
            Self::FetchingParent => "fetching_parent",
            Self::FetchingChildren => "fetching_children",
            Self::Committing => "committing",
            Self::Finalizing => "finalizing",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One playlist whose scores could not be fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistFailure {
    pub playlist_item_id: i64,
    pub error: String,
}

/// What a successful run committed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub key: ResourceKey,
    pub job_id: JobId,
    pub fetched_at: i64,
    pub is_active: bool,
    pub playlists: usize,
    pub pages: usize,
    pub scores: usize,
    pub participants: usize,
    /// Playlists that contributed no scores because every attempt failed.
    pub failed_playlists: Vec<PlaylistFailure>,
    pub commit_attempts: u32,
    pub winner: Option<RoomWinner>,
}

impl IngestReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_playlists.is_empty()
    }
}

/// Result of [`IngestionPipeline::run`].
#[derive(Debug)]
pub enum IngestRun {
    Completed(IngestReport),
    /// Another holder owns the resource lock.
    InProgress(LockRejection),
}

struct PlaylistScores {
    playlist_item_id: i64,
    scores: Vec<Score>,
    pages: usize,
}

pub struct IngestionPipeline {
    upstream: Arc<dyn UpstreamApi>,
    store: Arc<dyn SnapshotStore>,
    locks: Arc<ResourceLockService>,
    clock: Arc<dyn Clock>,
    tuning: SyncTuning,
}

impl IngestionPipeline {
    pub fn new(
        upstream: Arc<dyn UpstreamApi>,
        store: Arc<dyn SnapshotStore>,
        locks: Arc<ResourceLockService>,
        clock: Arc<dyn Clock>,
        tuning: SyncTuning,
    ) -> Self {
        Self {
            upstream,
            store,
            locks,
            clock,
            tuning,
        }
    }

    /// Takes the resource lock for `job_id`. Nothing else is touched on rejection.
    pub async fn acquire(&self, key: ResourceKey, job_id: JobId) -> LockAcquisition {
        self.locks.acquire(key, &job_id.to_string()).await
    }

    /// Drops the lock `job_id` holds on `key`, if it still does.
    pub async fn release(&self, key: ResourceKey, job_id: JobId) -> bool {
        self.locks.release(key, &job_id.to_string()).await
    }

    /// Locks, ingests and releases in one call.
    pub async fn run(&self, key: ResourceKey, job_id: JobId) -> Result<IngestRun> {
        match self.acquire(key, job_id).await {
            LockAcquisition::Held(lease) => {
                let (progress, _) = watch::channel(JobStage::Locked);
                self.run_locked(key, job_id, lease, &progress)
                    .await
                    .map(IngestRun::Completed)
            }
            LockAcquisition::Rejected { reason, .. } => Ok(IngestRun::InProgress(reason)),
        }
    }

    /// Runs the fetch and commit under an already held lease.
    ///
    /// The lease is released on every path, including a panic inside the run.
    pub async fn run_locked(
        &self,
        key: ResourceKey,
        job_id: JobId,
        lease: LockLease,
        progress: &watch::Sender<JobStage>,
    ) -> Result<IngestReport> {
        progress.send_replace(JobStage::Locked);
        let outcome = AssertUnwindSafe(self.ingest(key, job_id, &lease, progress))
            .catch_unwind()
            .await;
        lease.release().await;

        match outcome {
            Ok(Ok(report)) => {
                info!(
                    resource = %key,
                    %job_id,
                    scores = report.scores,
                    failed_playlists = report.failed_playlists.len(),
                    "ingestion committed"
                );
                Ok(report)
            }
            Ok(Err(error)) => {
                error!(resource = %key, %job_id, %error, "ingestion failed");
                Err(error)
            }
            Err(_) => {
                error!(resource = %key, %job_id, "ingestion panicked");
                Err(Error::Ingest(format!("ingestion of {key} panicked")))
            }
        }
    }

    async fn ingest(
        &self,
        key: ResourceKey,
        job_id: JobId,
        lease: &LockLease,
        progress: &watch::Sender<JobStage>,
    ) -> Result<IngestReport> {
        progress.send_replace(JobStage::FetchingParent);
        let upstream = &self.upstream;
        let room = self
            .with_retries("room", move || upstream.fetch_room(key.id))
            .await?
            .value;
        if room.id != key.id {
            return Err(Error::Ingest(format!(
                "upstream returned room {} for {key}",
                room.id
            )));
        }

        progress.send_replace(JobStage::FetchingChildren);
        let (fetched, failed_playlists) = self.fetch_playlists(&room).await;
        if !room.playlist.is_empty() && fetched.is_empty() {
            return Err(Error::Ingest(format!(
                "every playlist of {key} failed to fetch"
            )));
        }
        for failure in &failed_playlists {
            warn!(
                resource = %key,
                playlist_item_id = failure.playlist_item_id,
                error = %failure.error,
                "playlist skipped"
            );
        }

        let pages: usize = fetched.iter().map(|playlist| playlist.pages).sum();
        let scores = dedupe_scores(fetched.into_iter().flat_map(|playlist| playlist.scores));
        let participants = dedupe_participants(&scores);

        progress.send_replace(JobStage::Committing);
        self.ensure_still_held(key, lease).await?;
        let now = self.clock.now();
        let snapshot = RoomSnapshot {
            is_active: room.is_active_at(now),
            fetched_at: now.timestamp_millis(),
            room,
            scores,
            participants,
        };
        let commit_attempts = self.commit(key, &snapshot).await?;

        progress.send_replace(JobStage::Finalizing);
        let winner = self.record_winner(key, &snapshot).await;

        Ok(IngestReport {
            key,
            job_id,
            fetched_at: snapshot.fetched_at,
            is_active: snapshot.is_active,
            playlists: snapshot.room.playlist.len(),
            pages,
            scores: snapshot.scores.len(),
            participants: snapshot.participants.len(),
            failed_playlists,
            commit_attempts,
            winner,
        })
    }

    /// Fetches playlists in fixed-size batches, at most
    /// `max_concurrent_fetches` in flight, pausing between batches.
    async fn fetch_playlists(&self, room: &Room) -> (Vec<PlaylistScores>, Vec<PlaylistFailure>) {
        let semaphore = Arc::new(Semaphore::new(self.tuning.max_concurrent_fetches.max(1)));
        let item_ids: Vec<i64> = room.playlist.iter().map(|item| item.id).collect();
        let batches: Vec<&[i64]> = item_ids.chunks(self.tuning.batch_size.max(1)).collect();
        let mut fetched = Vec::with_capacity(item_ids.len());
        let mut failed = Vec::new();

        for (index, batch) in batches.iter().enumerate() {
            if index > 0 && !self.tuning.batch_pause.is_zero() {
                tokio::time::sleep(self.tuning.batch_pause).await;
            }

            let mut in_flight: FuturesUnordered<_> = batch
                .iter()
                .map(|&playlist_item_id| {
                    let semaphore = Arc::clone(&semaphore);
                    async move {
                        let _permit = semaphore.acquire().await;
                        (
                            playlist_item_id,
                            self.fetch_playlist(room.id, playlist_item_id).await,
                        )
                    }
                })
                .collect();

            while let Some((playlist_item_id, result)) = in_flight.next().await {
                match result {
                    Ok(playlist) => fetched.push(playlist),
                    Err(error) => failed.push(PlaylistFailure {
                        playlist_item_id,
                        error: error.to_string(),
                    }),
                }
            }
        }

        fetched.sort_by_key(|playlist| playlist.playlist_item_id);
        failed.sort_by_key(|failure| failure.playlist_item_id);
        (fetched, failed)
    }

    /// Follows the cursor chain of one playlist up to the pagination cap.
    async fn fetch_playlist(
        &self,
        room_id: i64,
        playlist_item_id: i64,
    ) -> UpstreamResult<PlaylistScores> {
        let upstream = &self.upstream;
        let mut scores = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let current = cursor.clone();
            let page = self
                .with_retries("scores", move || {
                    let current = current.clone();
                    async move {
                        upstream
                            .fetch_scores_page(room_id, playlist_item_id, current.as_deref())
                            .await
                    }
                })
                .await?
                .value;
            pages += 1;
            scores.extend(page.items.into_iter().map(|mut score| {
                score.playlist_item_id = playlist_item_id;
                score
            }));

            match page.next_cursor {
                Some(next) if pages >= self.tuning.max_pagination_rounds => {
                    warn!(
                        room_id,
                        playlist_item_id,
                        pages,
                        cursor = %next,
                        "pagination cap reached, keeping scores fetched so far"
                    );
                    break;
                }
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        debug!(room_id, playlist_item_id, pages, scores = scores.len(), "playlist fetched");
        Ok(PlaylistScores {
            playlist_item_id,
            scores,
            pages: usize::try_from(pages).unwrap_or(usize::MAX),
        })
    }

    /// Retries transient upstream failures with linear backoff.
    async fn with_retries<T, F, Fut>(&self, what: &str, mut call: F) -> UpstreamResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = UpstreamResult<T>>,
    {
        let max_attempts = self.tuning.max_retry_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < max_attempts => {
                    let backoff = self.tuning.retry_delay.saturating_mul(attempt);
                    let delay = error.retry_after().map_or(backoff, |after| after.max(backoff));
                    warn!(what, attempt, max_attempts, %error, ?delay, "retrying upstream call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn ensure_still_held(&self, key: ResourceKey, lease: &LockLease) -> Result<()> {
        let holder = &lease.record().holder_id;
        match self.locks.current(key).await? {
            Some(current) if &current.holder_id == holder => Ok(()),
            _ => Err(Error::Ingest(format!(
                "lock on {key} expired before commit; not writing"
            ))),
        }
    }

    /// Commits with exponential backoff on transient storage errors.
    async fn commit(&self, key: ResourceKey, snapshot: &RoomSnapshot) -> Result<u32> {
        let max_attempts = self.tuning.commit_max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.upsert_atomic(&key, snapshot).await {
                Ok(()) => return Ok(attempt),
                Err(error) if error.is_transient_storage() && attempt < max_attempts => {
                    let delay = self
                        .tuning
                        .commit_backoff
                        .saturating_mul(1 << (attempt - 1).min(16));
                    warn!(resource = %key, attempt, %error, ?delay, "commit failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    error!(resource = %key, attempt, %error, "commit failed");
                    return Err(error);
                }
            }
        }
    }

    async fn record_winner(&self, key: ResourceKey, snapshot: &RoomSnapshot) -> Option<RoomWinner> {
        let winner = compute_winner(snapshot.room.id, &snapshot.scores, snapshot.fetched_at)?;
        match self.store.record_winner(&winner).await {
            Ok(()) => Some(winner),
            Err(error) => {
                warn!(resource = %key, %error, "winner recomputation failed");
                None
            }
        }
    }
}

/// Keeps one entry per score id; a later duplicate replaces an earlier one.
fn dedupe_scores(scores: impl IntoIterator<Item = Score>) -> Vec<Score> {
    let mut positions: HashMap<i64, usize> = HashMap::new();
    let mut unique: Vec<Score> = Vec::new();
    for score in scores {
        if let Some(&position) = positions.get(&score.id) {
            unique[position] = score;
        } else {
            positions.insert(score.id, unique.len());
            unique.push(score);
        }
    }
    unique
}

/// One participant per user id, in first-seen order with last-seen attributes.
fn dedupe_participants(scores: &[Score]) -> Vec<Participant> {
    let mut positions: HashMap<i64, usize> = HashMap::new();
    let mut unique: Vec<Participant> = Vec::new();
    for user in scores.iter().filter_map(|score| score.user.as_ref()) {
        if let Some(&position) = positions.get(&user.id) {
            unique[position] = user.clone();
        } else {
            positions.insert(user.id, unique.len());
            unique.push(user.clone());
        }
    }
    unique
}

/// Highest sum of each user's best score per playlist item. Ties go to the lower user id.
pub fn compute_winner(room_id: i64, scores: &[Score], computed_at: i64) -> Option<RoomWinner> {
    let mut best: HashMap<(i64, i64), i64> = HashMap::new();
    for score in scores {
        let entry = best
            .entry((score.user_id, score.playlist_item_id))
            .or_insert(score.total_score);
        *entry = (*entry).max(score.total_score);
    }

    let mut totals: HashMap<i64, i64> = HashMap::new();
    for ((user_id, _), total) in best {
        *totals.entry(user_id).or_default() += total;
    }

    totals
        .into_iter()
        .max_by(|(a_user, a_total), (b_user, b_total)| {
            a_total.cmp(b_total).then(b_user.cmp(a_user))
        })
        .map(|(user_id, total_score)| RoomWinner {
            room_id,
            user_id,
            total_score,
            computed_at,
        })
}
