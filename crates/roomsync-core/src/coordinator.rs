//! Decides whether a resource may be refreshed and runs accepted refreshes
//! in the background.
//!
//! The in-flight job map and the cooldown map are process-local. They keep a
//! single process from doing redundant work; exclusivity across processes
//! comes from the resource lock the pipeline takes before any write.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{duration_ms, Clock};
use crate::error::Error;
use crate::ingest::{IngestReport, IngestionPipeline, JobStage};
use crate::lock::LockAcquisition;
use crate::models::{JobId, ResourceKey};
use crate::staleness::{Staleness, StalenessEvaluator};
use crate::usage::{QuotaStatus, UsageAccountant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncReason {
    GlobalCooldown,
    NotStale,
    QuotaCritical,
    Ready,
}

impl SyncReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GlobalCooldown => "global_cooldown",
            Self::NotStale => "not_stale",
            Self::QuotaCritical => "quota_critical",
            Self::Ready => "ready",
        }
    }
}

impl fmt::Display for SyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to "may this resource be refreshed now?".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncDecision {
    pub can_sync: bool,
    pub reason: SyncReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staleness: Option<Staleness>,
}

impl SyncDecision {
    const fn refuse(reason: SyncReason) -> Self {
        Self {
            can_sync: false,
            reason,
            cooldown_remaining_ms: None,
            staleness: None,
        }
    }
}

/// Why a queue request did not start a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    GlobalCooldown,
    NotStale,
    QuotaCritical,
    /// A job for the resource is already running here or in another instance.
    InProgress,
}

impl RejectReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GlobalCooldown => "global_cooldown",
            Self::NotStale => "not_stale",
            Self::QuotaCritical => "quota_critical",
            Self::InProgress => "in_progress",
        }
    }

    const fn from_decision(reason: SyncReason) -> Option<Self> {
        match reason {
            SyncReason::GlobalCooldown => Some(Self::GlobalCooldown),
            SyncReason::NotStale => Some(Self::NotStale),
            SyncReason::QuotaCritical => Some(Self::QuotaCritical),
            SyncReason::Ready => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(Error::InvalidInput(format!("unknown priority: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRequest {
    pub priority: Priority,
    /// Skip the cooldown and staleness checks. Quota is still enforced.
    pub force: bool,
}

/// How a background job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(IngestReport),
    Failed { error: String },
}

#[derive(Debug)]
pub enum QueueOutcome {
    Queued {
        job_id: JobId,
        /// Resolves when the job ends. Dropping it does not cancel the job.
        completion: oneshot::Receiver<JobOutcome>,
    },
    Rejected {
        reason: RejectReason,
        detail: Option<String>,
    },
}

impl QueueOutcome {
    const fn rejected(reason: RejectReason) -> Self {
        Self::Rejected {
            reason,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncStatus {
    InProgress {
        job_id: JobId,
        stage: JobStage,
        started_at: i64,
        priority: Priority,
    },
    Idle {
        last_synced_at: Option<i64>,
        cooldown_remaining_ms: Option<i64>,
    },
}

#[derive(Debug)]
struct InFlightJob {
    job_id: JobId,
    priority: Priority,
    started_at: i64,
    stage: watch::Receiver<JobStage>,
    task: Option<JoinHandle<()>>,
}

pub struct SyncCoordinator {
    staleness: Arc<StalenessEvaluator>,
    usage: Arc<UsageAccountant>,
    pipeline: Arc<IngestionPipeline>,
    clock: Arc<dyn Clock>,
    cooldown: Duration,
    /// Last completed sync per resource; the oldest completion is evicted first.
    cooldowns: Mutex<LruCache<ResourceKey, i64>>,
    jobs: Mutex<HashMap<ResourceKey, InFlightJob>>,
}

impl SyncCoordinator {
    pub fn new(
        staleness: Arc<StalenessEvaluator>,
        usage: Arc<UsageAccountant>,
        pipeline: Arc<IngestionPipeline>,
        clock: Arc<dyn Clock>,
        cooldown: Duration,
        cooldown_capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cooldown_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            staleness,
            usage,
            pipeline,
            clock,
            cooldown,
            cooldowns: Mutex::new(LruCache::new(capacity)),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Quota first, then the advisory cooldown, then durable staleness.
    /// `force` skips the last two.
    pub async fn can_sync(&self, key: ResourceKey, force: bool) -> SyncDecision {
        if self.usage.check_quota_status() == QuotaStatus::Critical {
            return SyncDecision::refuse(SyncReason::QuotaCritical);
        }
        if force {
            return SyncDecision {
                can_sync: true,
                reason: SyncReason::Ready,
                cooldown_remaining_ms: None,
                staleness: None,
            };
        }

        if let Some(remaining) = self.cooldown_remaining(key) {
            return SyncDecision {
                cooldown_remaining_ms: Some(remaining),
                ..SyncDecision::refuse(SyncReason::GlobalCooldown)
            };
        }

        let staleness = match self.staleness.is_stale(key).await {
            Ok(staleness) => Some(staleness),
            Err(error) => {
                warn!(resource = %key, %error, "freshness unavailable, treating as stale");
                None
            }
        };
        if let Some(staleness) = staleness.filter(|staleness| !staleness.stale) {
            return SyncDecision {
                staleness: Some(staleness),
                ..SyncDecision::refuse(SyncReason::NotStale)
            };
        }

        SyncDecision {
            can_sync: true,
            reason: SyncReason::Ready,
            cooldown_remaining_ms: None,
            staleness,
        }
    }

    /// Starts a background refresh if one is allowed.
    ///
    /// Returns once the resource lock is held (or refused); the fetch and
    /// commit continue on a spawned task.
    pub async fn queue_sync(self: &Arc<Self>, key: ResourceKey, request: SyncRequest) -> QueueOutcome {
        let decision = self.can_sync(key, request.force).await;
        if let Some(reason) = RejectReason::from_decision(decision.reason) {
            debug!(resource = %key, %reason, "sync rejected");
            return QueueOutcome::rejected(reason);
        }

        let job_id = JobId::new();
        let (progress, stage) = watch::channel(JobStage::Queued);
        let Some(slot) = self.reserve(key, job_id, request.priority, stage) else {
            return QueueOutcome::rejected(RejectReason::InProgress);
        };

        let lease = match self.pipeline.acquire(key, job_id).await {
            LockAcquisition::Held(lease) => lease,
            LockAcquisition::Rejected { reason, existing } => {
                info!(
                    resource = %key,
                    %reason,
                    holder = existing.as_ref().map(|lock| lock.holder_id.as_str()),
                    "sync already in progress elsewhere"
                );
                drop(slot);
                return QueueOutcome::Rejected {
                    reason: RejectReason::InProgress,
                    detail: Some(reason.to_string()),
                };
            }
        };

        let (completion_tx, completion) = oneshot::channel();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = coordinator
                .pipeline
                .run_locked(key, job_id, lease, &progress)
                .await;
            let outcome = match result {
                Ok(report) => {
                    coordinator.complete(key, &report).await;
                    JobOutcome::Succeeded(report)
                }
                Err(error) => JobOutcome::Failed {
                    error: error.to_string(),
                },
            };
            drop(slot);
            completion_tx.send(outcome).ok();
        });
        {
            let mut jobs = self.jobs();
            if let Some(job) = jobs.get_mut(&key).filter(|job| job.job_id == job_id) {
                job.task = Some(task);
            }
        }

        info!(resource = %key, %job_id, priority = %request.priority, "sync queued");
        QueueOutcome::Queued { job_id, completion }
    }

    pub fn sync_status(&self, key: ResourceKey) -> SyncStatus {
        if let Some(job) = self.jobs().get(&key) {
            return SyncStatus::InProgress {
                job_id: job.job_id,
                stage: *job.stage.borrow(),
                started_at: job.started_at,
                priority: job.priority,
            };
        }
        let last_synced_at = self.cooldowns().peek(&key).copied();
        SyncStatus::Idle {
            last_synced_at,
            cooldown_remaining_ms: self.cooldown_remaining(key),
        }
    }

    /// Resources with a job running in this process.
    pub fn in_flight(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self.jobs().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Waits up to `grace` for this process's running syncs. Any still running
    /// after that are aborted and their resource locks released, so other
    /// instances do not wait out the lock TTL. Returns how many were abandoned.
    pub async fn drain(&self, grace: Duration) -> usize {
        let running: Vec<(ResourceKey, JobId, JoinHandle<()>)> = self
            .jobs()
            .iter_mut()
            .filter_map(|(key, job)| job.task.take().map(|task| (*key, job.job_id, task)))
            .collect();
        if running.is_empty() {
            return 0;
        }

        info!(jobs = running.len(), ?grace, "waiting for in-flight syncs");
        let deadline = tokio::time::Instant::now() + grace;
        let mut abandoned = 0;
        for (key, job_id, mut task) in running {
            if tokio::time::timeout_at(deadline, &mut task).await.is_ok() {
                continue;
            }
            task.abort();
            if task.await.is_ok() {
                continue;
            }
            let released = self.pipeline.release(key, job_id).await;
            warn!(resource = %key, %job_id, released, "sync abandoned at shutdown");
            abandoned += 1;
        }
        abandoned
    }

    pub(crate) fn record_cooldown(&self, key: ResourceKey, completed_at: i64) {
        self.cooldowns().put(key, completed_at);
    }

    fn cooldown_remaining(&self, key: ResourceKey) -> Option<i64> {
        let completed_at = self.cooldowns().peek(&key).copied()?;
        let elapsed = self.clock.now_ms().saturating_sub(completed_at);
        let remaining = duration_ms(self.cooldown).saturating_sub(elapsed);
        (remaining > 0).then_some(remaining)
    }

    async fn complete(&self, key: ResourceKey, report: &IngestReport) {
        self.record_cooldown(key, self.clock.now_ms());
        if let Err(error) = self
            .staleness
            .mark_fresh(key, report.fetched_at, report.is_active)
            .await
        {
            warn!(resource = %key, %error, "failed to mark resource fresh");
        }
    }

    fn reserve(
        self: &Arc<Self>,
        key: ResourceKey,
        job_id: JobId,
        priority: Priority,
        stage: watch::Receiver<JobStage>,
    ) -> Option<JobSlot> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&key) {
            debug!(resource = %key, "sync already in flight in this process");
            return None;
        }
        jobs.insert(
            key,
            InFlightJob {
                job_id,
                priority,
                started_at: self.clock.now_ms(),
                stage,
                task: None,
            },
        );
        Some(JobSlot {
            coordinator: Arc::clone(self),
            key,
            job_id,
        })
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<ResourceKey, InFlightJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            warn!("job map mutex poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }

    fn cooldowns(&self) -> MutexGuard<'_, LruCache<ResourceKey, i64>> {
        self.cooldowns.lock().unwrap_or_else(|poisoned| {
            warn!("cooldown map mutex poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }
}

/// Removes the job's in-flight entry when dropped, on every exit path.
struct JobSlot {
    coordinator: Arc<SyncCoordinator>,
    key: ResourceKey,
    job_id: JobId,
}

impl Drop for JobSlot {
    fn drop(&mut self) {
        let mut jobs = self.coordinator.jobs();
        if jobs.get(&self.key).is_some_and(|job| job.job_id == self.job_id) {
            jobs.remove(&self.key);
        }
    }
}
