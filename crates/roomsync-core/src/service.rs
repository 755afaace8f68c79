//! Process-wide composition of the sync engine.
//!
//! One [`SyncService`] per process owns the usage ledger, the cooldown map
//! and the freshness mirror. Nothing here is global; the binary builds it
//! once and shares it behind an `Arc`.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{AppConfig, MaintenanceSchedule};
use crate::coordinator::{QueueOutcome, SyncCoordinator, SyncDecision, SyncRequest, SyncStatus};
use crate::error::Result;
use crate::ingest::IngestionPipeline;
use crate::lock::ResourceLockService;
use crate::models::ResourceKey;
use crate::staleness::StalenessEvaluator;
use crate::store::{SyncStore, UsageStore};
use crate::upstream::{TrackedUpstream, UpstreamApi};
use crate::usage::{CallClass, QuotaUsage, UsageAccountant, UsageReport};

pub struct SyncService {
    usage_store: Arc<dyn UsageStore>,
    usage: Arc<UsageAccountant>,
    locks: Arc<ResourceLockService>,
    staleness: Arc<StalenessEvaluator>,
    coordinator: Arc<SyncCoordinator>,
    schedule: MaintenanceSchedule,
}

impl SyncService {
    /// Wires every component over one store and one upstream client.
    ///
    /// Upstream calls are wrapped so each one is reported to the usage ledger.
    pub fn new<S>(
        config: &AppConfig,
        store: Arc<S>,
        upstream: Arc<dyn UpstreamApi>,
        clock: Arc<dyn Clock>,
    ) -> Self
    where
        S: SyncStore + 'static,
    {
        let tuning = config.sync.clone();
        let usage = Arc::new(UsageAccountant::new(
            config.usage,
            config.plan,
            Arc::clone(&clock),
        ));
        let locks = Arc::new(ResourceLockService::new(
            store.clone(),
            Arc::clone(&clock),
            tuning.lock_ttl,
        ));
        let staleness = Arc::new(
            StalenessEvaluator::new(
                store.clone(),
                Arc::clone(&clock),
                tuning.staleness_threshold,
                tuning.freshness_cache_capacity,
            )
            .with_cache_path(tuning.freshness_cache_path.clone()),
        );
        let tracked = Arc::new(TrackedUpstream::new(upstream, Arc::clone(&usage)));
        let pipeline = Arc::new(IngestionPipeline::new(
            tracked,
            store.clone(),
            Arc::clone(&locks),
            Arc::clone(&clock),
            tuning.clone(),
        ));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::clone(&staleness),
            Arc::clone(&usage),
            pipeline,
            clock,
            tuning.global_cooldown,
            tuning.cooldown_capacity,
        ));

        Self {
            usage_store: store,
            usage,
            locks,
            staleness,
            coordinator,
            schedule: config.maintenance,
        }
    }

    /// Reloads the month's usage and the freshness mirror from a previous run.
    pub async fn restore(&self) -> Result<()> {
        self.usage.restore(self.usage_store.as_ref()).await?;
        let cached = self.staleness.load_cache();
        info!(cached, "sync service restored");
        Ok(())
    }

    pub async fn request_sync(&self, key: ResourceKey, request: SyncRequest) -> QueueOutcome {
        let started = Instant::now();
        let outcome = self.coordinator.queue_sync(key, request).await;
        self.track("request_sync", started);
        outcome
    }

    pub async fn can_sync(&self, key: ResourceKey, force: bool) -> SyncDecision {
        let started = Instant::now();
        let decision = self.coordinator.can_sync(key, force).await;
        self.track("can_sync", started);
        decision
    }

    pub fn sync_status(&self, key: ResourceKey) -> SyncStatus {
        let started = Instant::now();
        let status = self.coordinator.sync_status(key);
        self.track("sync_status", started);
        status
    }

    pub fn usage_report(&self) -> UsageReport {
        let started = Instant::now();
        let report = self.usage.usage_report();
        self.track("usage_report", started);
        report
    }

    pub fn quota_status(&self) -> QuotaUsage {
        let started = Instant::now();
        let quota = self.usage.quota_usage();
        self.track("quota_status", started);
        quota
    }

    /// Saves the freshness mirror and writes dirty usage aggregates.
    pub async fn flush(&self) -> Result<usize> {
        self.staleness.persist_cache();
        self.usage.flush(self.usage_store.as_ref()).await
    }

    /// Lets in-flight syncs finish within the grace period, releases the
    /// locks of any that do not, then flushes. Failures are logged.
    pub async fn shutdown(&self) {
        let abandoned = self.coordinator.drain(self.schedule.shutdown_grace).await;
        if abandoned > 0 {
            warn!(abandoned, "shutting down with unfinished syncs");
        }
        match self.flush().await {
            Ok(written) => info!(written, "usage flushed on shutdown"),
            Err(error) => warn!(%error, "final usage flush failed"),
        }
    }

    pub fn usage(&self) -> &Arc<UsageAccountant> {
        &self.usage
    }

    pub fn locks(&self) -> &Arc<ResourceLockService> {
        &self.locks
    }

    pub fn staleness(&self) -> &Arc<StalenessEvaluator> {
        &self.staleness
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub const fn schedule(&self) -> MaintenanceSchedule {
        self.schedule
    }

    fn track(&self, endpoint: &str, started: Instant) {
        let count =
            self.usage
                .record_call(CallClass::Internal, endpoint, started.elapsed(), true, 0);
        debug!(endpoint, count, "internal call");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::coordinator::{JobOutcome, RejectReason};
    use crate::db::LibSqlStore;
    use crate::staleness::FreshnessCache;
    use crate::store::LockStore;
    use crate::testing::{room_with_playlist, score, FakeUpstream, FlakyStore};
    use crate::usage::QuotaStatus;
    use std::time::Duration;
    use pretty_assertions::assert_eq;

    const NOW: i64 = 1_760_000_000_000;

    fn service_with(config: &AppConfig, store: &Arc<LibSqlStore>) -> (SyncService, Arc<FakeUpstream>) {
        let upstream = Arc::new(FakeUpstream::new(room_with_playlist(300, &[1])));
        upstream.set_pages(1, vec![vec![score(1, 5, 0, 700)], vec![score(2, 6, 0, 800)]]);
        let clock = Arc::new(ManualClock::new(NOW));
        let service = SyncService::new(config, store.clone(), upstream.clone(), clock);
        (service, upstream)
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.sync.batch_pause = Duration::ZERO;
        config.sync.retry_delay = Duration::from_millis(1);
        config
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_sync_runs_and_tracks_both_call_classes() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let (service, _) = service_with(&fast_config(), &store);
        let key = ResourceKey::challenge(300);

        let QueueOutcome::Queued { completion, .. } =
            service.request_sync(key, SyncRequest::default()).await
        else {
            panic!("never-synced resource should be queued");
        };
        let JobOutcome::Succeeded(report) = completion.await.unwrap() else {
            panic!("sync should succeed");
        };
        assert_eq!(report.scores, 2);
        assert_eq!(report.pages, 2);

        let totals = service.usage().month_totals();
        assert_eq!(totals.internal_calls, 1);
        assert_eq!(totals.external_calls, 3);
        assert!(totals.bandwidth_bytes > 0);

        let summary = store.room_summary(300).await.unwrap().unwrap();
        assert_eq!(summary.scores, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn usage_survives_restart_through_the_store() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let mut config = fast_config();
        config.plan.invocations = 10;
        config.plan.external_calls = 0;
        config.plan.bandwidth_bytes = 0;
        config.plan.compute_seconds = 0;

        let (first, _) = service_with(&config, &store);
        for _ in 0..8 {
            first.sync_status(ResourceKey::challenge(300));
        }
        assert_eq!(first.quota_status().status, QuotaStatus::Caution);
        first.shutdown().await;

        let (second, upstream) = service_with(&config, &store);
        second.restore().await.unwrap();
        assert_eq!(second.usage().month_totals().internal_calls, 9);
        second.sync_status(ResourceKey::challenge(300));

        match second.request_sync(ResourceKey::challenge(300), SyncRequest::default()).await {
            QueueOutcome::Rejected { reason, .. } => assert_eq!(reason, RejectReason::QuotaCritical),
            QueueOutcome::Queued { .. } => panic!("restored quota should block new work"),
        }
        assert_eq!(upstream.room_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_is_idempotent_without_new_calls() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let (service, _) = service_with(&fast_config(), &store);
        service.usage_report();

        assert!(service.flush().await.unwrap() > 0);
        assert_eq!(service.flush().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_releases_locks_of_unfinished_syncs() {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let mut config = fast_config();
        config.maintenance.shutdown_grace = Duration::from_millis(50);
        let (service, upstream) = service_with(&config, &store);
        let key = ResourceKey::challenge(300);

        upstream.close_gate();
        let QueueOutcome::Queued { completion, .. } =
            service.request_sync(key, SyncRequest::default()).await
        else {
            panic!("never-synced resource should be queued");
        };
        assert!(store.read_lock(&key.lock_id()).await.unwrap().is_some());

        service.shutdown().await;

        assert!(store.read_lock(&key.lock_id()).await.unwrap().is_none());
        assert!(completion.await.is_err());
        assert!(service.coordinator().in_flight().is_empty());
        assert!(!service.usage().is_dirty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn flush_saves_freshness_cache_when_usage_write_fails() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("freshness.json");
        let mut config = fast_config();
        config.sync.freshness_cache_path = Some(cache_path.clone());

        let inner = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let store = Arc::new(FlakyStore::new(inner));
        let upstream = Arc::new(FakeUpstream::new(room_with_playlist(301, &[1])));
        upstream.set_pages(1, vec![vec![score(1, 5, 0, 700)]]);
        let service = SyncService::new(&config, store.clone(), upstream, Arc::new(ManualClock::new(NOW)));

        let QueueOutcome::Queued { completion, .. } = service
            .request_sync(ResourceKey::challenge(301), SyncRequest::default())
            .await
        else {
            panic!("never-synced resource should be queued");
        };
        assert!(matches!(completion.await.unwrap(), JobOutcome::Succeeded(_)));
        assert_eq!(service.staleness().cache().len(), 1);

        store.break_usage_writes();
        assert!(service.flush().await.is_err());

        let restored = FreshnessCache::new(8);
        assert_eq!(restored.load(&cache_path).unwrap(), 1);
        assert_eq!(restored.get(&ResourceKey::challenge(301)), Some(NOW));
    }
}
