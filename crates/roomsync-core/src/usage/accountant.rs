//! Process-wide usage accountant.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::ledger::{
    next_month_start, CallEntry, CallSample, DailyRollup, EndpointsSnapshot, Ledger,
    MonthlyAggregate, Persisted,
};
use super::report::{QuotaUsage, UsageReport};
use super::{CallClass, QuotaStatus};
use crate::clock::Clock;
use crate::config::{PlanLimits, UsageCaps};
use crate::error::Result;
use crate::store::UsageStore;

const DAILY_PERIOD: &str = "daily";

fn month_period(period: &str) -> String {
    format!("month:{period}")
}

fn endpoints_period(period: &str) -> String {
    format!("endpoints:{period}")
}

/// One aggregate that needs writing, and the flag it clears on success.
#[derive(Debug)]
struct PendingWrite {
    period: String,
    payload: String,
    target: FlushTarget,
}

#[derive(Debug, Clone, Copy)]
enum FlushTarget {
    Monthly(u64),
    Daily(u64),
    Endpoints(u64),
    ClosedMonth,
}

/// Bounded in-memory ledger of calls made by and through this process.
///
/// Recording never fails the caller. Aggregates are written out by
/// [`UsageAccountant::flush`], which only touches dimensions that changed
/// since the previous successful write.
pub struct UsageAccountant {
    ledger: Mutex<Ledger>,
    /// Unix ms at which the current month ends.
    reset_at: AtomicI64,
    caps: UsageCaps,
    plan: PlanLimits,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for UsageAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageAccountant")
            .field("reset_at", &self.reset_at.load(Ordering::Relaxed))
            .field("caps", &self.caps)
            .field("plan", &self.plan)
            .finish_non_exhaustive()
    }
}

impl UsageAccountant {
    pub fn new(caps: UsageCaps, plan: PlanLimits, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            ledger: Mutex::new(Ledger::new(now)),
            reset_at: AtomicI64::new(next_month_start(now).timestamp_millis()),
            caps,
            plan,
            clock,
        }
    }

    pub const fn plan(&self) -> PlanLimits {
        self.plan
    }

    /// Records one call and returns the endpoint's running count for this month.
    pub fn record_call(
        &self,
        class: CallClass,
        endpoint: &str,
        duration: Duration,
        success: bool,
        size_bytes: u64,
    ) -> u64 {
        if endpoint.trim().is_empty() {
            warn!(%class, "ignoring usage record without an endpoint key");
            return 0;
        }

        let now = self.clock.now();
        let sample = CallSample {
            at: now.timestamp_millis(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            success,
            size_bytes,
        };
        let mut ledger = self.lock_ledger(now);
        ledger.record(
            CallEntry {
                class,
                endpoint,
                sample,
            },
            self.caps,
            now.date_naive(),
        )
    }

    pub fn check_quota_status(&self) -> QuotaStatus {
        self.quota_usage().status
    }

    /// Per-dimension percentages behind [`Self::check_quota_status`].
    pub fn quota_usage(&self) -> QuotaUsage {
        let ledger = self.lock_ledger(self.clock.now());
        QuotaUsage::compute(&ledger.month, self.plan)
    }

    pub fn usage_report(&self) -> UsageReport {
        let now = self.clock.now();
        let ledger = self.lock_ledger(now);
        UsageReport::build(&ledger, self.plan, now)
    }

    pub fn month_totals(&self) -> MonthlyAggregate {
        self.lock_ledger(self.clock.now()).month.clone()
    }

    /// Whether any aggregate has changed since the last successful flush.
    pub fn is_dirty(&self) -> bool {
        let ledger = self.lock_ledger(self.clock.now());
        let dirty = ledger.dirty;
        dirty.monthly.is_dirty()
            || dirty.daily.is_dirty()
            || dirty.endpoints.is_dirty()
            || !ledger.closed_months.is_empty()
    }

    /// Trims every bounded collection back to its cap.
    ///
    /// Safe to run at any time; a second pass with no new calls removes nothing.
    pub fn run_maintenance(&self) -> usize {
        let removed = self.lock_ledger(self.clock.now()).enforce_caps(self.caps);
        if removed > 0 {
            debug!(removed, "usage ledger trimmed to caps");
        }
        removed
    }

    /// Writes every dirty aggregate. Returns how many writes succeeded.
    ///
    /// Each aggregate is written independently; a failed write leaves its
    /// dirty flag set for the next cycle and the first failure is returned
    /// after the remaining writes have been attempted.
    pub async fn flush(&self, store: &dyn UsageStore) -> Result<usize> {
        let pending = self.pending_writes();
        if pending.is_empty() {
            return Ok(0);
        }

        let updated_at = self.clock.now_ms();
        let mut written = 0;
        let mut first_error = None;
        for write in pending {
            match store
                .write_usage_aggregate(&write.period, &write.payload, updated_at)
                .await
            {
                Ok(()) => {
                    self.confirm(&write);
                    written += 1;
                }
                Err(error) => {
                    warn!(period = %write.period, %error, "usage flush failed, will retry");
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => {
                debug!(written, "usage aggregates flushed");
                Ok(written)
            }
        }
    }

    /// Seeds the ledger from durable storage so a restart keeps the month's quota.
    pub async fn restore(&self, store: &dyn UsageStore) -> Result<()> {
        let period = self.lock_ledger(self.clock.now()).month.period.clone();
        let persisted = Persisted {
            month: read_json::<MonthlyAggregate>(store, &month_period(&period)).await?,
            daily: read_json::<Vec<DailyRollup>>(store, DAILY_PERIOD)
                .await?
                .unwrap_or_default(),
            endpoints: read_json::<EndpointsSnapshot>(store, &endpoints_period(&period)).await?,
        };

        let mut ledger = self.lock_ledger(self.clock.now());
        ledger.absorb_persisted(persisted, self.caps);
        info!(
            period = %ledger.month.period,
            total_calls = ledger.month.total_calls,
            "usage ledger restored"
        );
        Ok(())
    }

    fn pending_writes(&self) -> Vec<PendingWrite> {
        let ledger = self.lock_ledger(self.clock.now());
        let mut pending = Vec::new();
        let period = ledger.month.period.clone();

        for closed in &ledger.closed_months {
            push_json(
                &mut pending,
                month_period(&closed.period),
                closed,
                FlushTarget::ClosedMonth,
            );
        }
        if ledger.dirty.monthly.is_dirty() {
            let version = ledger.dirty.monthly.version();
            push_json(
                &mut pending,
                month_period(&period),
                &ledger.month,
                FlushTarget::Monthly(version),
            );
        }
        if ledger.dirty.daily.is_dirty() {
            let version = ledger.dirty.daily.version();
            let daily: Vec<&DailyRollup> = ledger.daily.values().collect();
            push_json(
                &mut pending,
                DAILY_PERIOD.to_string(),
                &daily,
                FlushTarget::Daily(version),
            );
        }
        if ledger.dirty.endpoints.is_dirty() {
            let version = ledger.dirty.endpoints.version();
            push_json(
                &mut pending,
                endpoints_period(&period),
                &ledger.endpoints_snapshot(),
                FlushTarget::Endpoints(version),
            );
        }
        pending
    }

    fn confirm(&self, write: &PendingWrite) {
        let mut ledger = self.lock_ledger(self.clock.now());
        match write.target {
            FlushTarget::Monthly(version) => ledger.dirty.monthly.confirm(version),
            FlushTarget::Daily(version) => ledger.dirty.daily.confirm(version),
            FlushTarget::Endpoints(version) => ledger.dirty.endpoints.confirm(version),
            FlushTarget::ClosedMonth => ledger
                .closed_months
                .retain(|closed| month_period(&closed.period) != write.period),
        }
    }

    /// Locks the ledger, rolling the month over first if its boundary has passed.
    fn lock_ledger(&self, now: DateTime<Utc>) -> MutexGuard<'_, Ledger> {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| {
            warn!("usage ledger mutex poisoned, continuing with recovered state");
            poisoned.into_inner()
        });
        self.roll_over_if_due(&mut ledger, now);
        ledger
    }

    fn roll_over_if_due(&self, ledger: &mut Ledger, now: DateTime<Utc>) {
        let boundary = self.reset_at.load(Ordering::Acquire);
        if now.timestamp_millis() < boundary {
            return;
        }
        let next = next_month_start(now).timestamp_millis();
        if self
            .reset_at
            .compare_exchange(boundary, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(closed = %ledger.month.period, "usage month rolled over");
            ledger.roll_over(now);
        }
    }
}

fn push_json<T: serde::Serialize + ?Sized>(
    pending: &mut Vec<PendingWrite>,
    period: String,
    value: &T,
    target: FlushTarget,
) {
    match serde_json::to_string(value) {
        Ok(payload) => pending.push(PendingWrite {
            period,
            payload,
            target,
        }),
        Err(error) => warn!(%period, %error, "failed to serialize usage aggregate"),
    }
}

async fn read_json<T: DeserializeOwned>(
    store: &dyn UsageStore,
    period: &str,
) -> Result<Option<T>> {
    let Some(payload) = store.read_usage_aggregate(period).await? else {
        return Ok(None);
    };
    match serde_json::from_str(&payload) {
        Ok(value) => Ok(Some(value)),
        Err(error) => {
            warn!(%period, %error, "ignoring unreadable usage aggregate");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;
    use crate::error::Error;

    #[derive(Default)]
    struct RecordingStore {
        rows: StdMutex<HashMap<String, String>>,
        writes: StdMutex<Vec<String>>,
        failing_prefix: StdMutex<Option<&'static str>>,
    }

    impl RecordingStore {
        fn writes(&self) -> Vec<String> {
            self.writes.lock().unwrap().clone()
        }

        fn fail_on(&self, prefix: Option<&'static str>) {
            *self.failing_prefix.lock().unwrap() = prefix;
        }
    }

    #[async_trait]
    impl UsageStore for RecordingStore {
        async fn read_usage_aggregate(&self, period: &str) -> Result<Option<String>> {
            Ok(self.rows.lock().unwrap().get(period).cloned())
        }

        async fn write_usage_aggregate(
            &self,
            period: &str,
            payload: &str,
            _updated_at: i64,
        ) -> Result<()> {
            if let Some(prefix) = *self.failing_prefix.lock().unwrap() {
                if period.starts_with(prefix) {
                    return Err(Error::Database("disk I/O error".to_string()));
                }
            }
            self.writes.lock().unwrap().push(period.to_string());
            self.rows
                .lock()
                .unwrap()
                .insert(period.to_string(), payload.to_string());
            Ok(())
        }
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    fn accountant(clock: Arc<ManualClock>, plan: PlanLimits) -> UsageAccountant {
        UsageAccountant::new(UsageCaps::default(), plan, clock)
    }

    fn invocations_plan(limit: u64) -> PlanLimits {
        PlanLimits {
            invocations: limit,
            external_calls: 0,
            bandwidth_bytes: 0,
            compute_seconds: 0,
        }
    }

    #[test]
    fn record_call_counts_per_endpoint() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let usage = accountant(clock, PlanLimits::default());

        assert_eq!(
            usage.record_call(CallClass::External, "rooms/{id}", Duration::from_millis(40), true, 512),
            1
        );
        assert_eq!(
            usage.record_call(CallClass::External, "rooms/{id}", Duration::from_millis(60), false, 0),
            2
        );
        usage.record_call(CallClass::Internal, "sync_status", Duration::from_millis(5), true, 64);

        let totals = usage.month_totals();
        assert_eq!(totals.total_calls, 3);
        assert_eq!(totals.external_calls, 2);
        assert_eq!(totals.internal_calls, 1);
        assert_eq!(totals.error_count, 1);
        assert_eq!(totals.bandwidth_bytes, 576);
        assert_eq!(totals.compute_ms, 5);
    }

    #[test]
    fn empty_endpoint_is_a_no_op() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let usage = accountant(clock, PlanLimits::default());
        assert_eq!(usage.record_call(CallClass::Internal, "  ", Duration::ZERO, true, 0), 0);
        assert_eq!(usage.month_totals().total_calls, 0);
        assert!(!usage.is_dirty());
    }

    #[test]
    fn ninety_six_percent_of_invocations_is_critical() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let usage = accountant(clock, invocations_plan(100));

        for _ in 0..84 {
            usage.record_call(CallClass::Internal, "request_sync", Duration::ZERO, true, 0);
        }
        assert_eq!(usage.check_quota_status(), QuotaStatus::Caution);

        for _ in 84..96 {
            usage.record_call(CallClass::Internal, "request_sync", Duration::ZERO, true, 0);
        }
        assert_eq!(usage.check_quota_status(), QuotaStatus::Critical);
    }

    #[test]
    fn monthly_rollover_resets_counters_once() {
        let clock = Arc::new(ManualClock::at(at("2026-10-31T23:59:00Z")));
        let usage = accountant(clock.clone(), invocations_plan(100));
        for _ in 0..96 {
            usage.record_call(CallClass::Internal, "request_sync", Duration::ZERO, true, 0);
        }
        assert_eq!(usage.check_quota_status(), QuotaStatus::Critical);

        clock.set(at("2026-11-01T00:00:30Z").timestamp_millis());
        assert_eq!(usage.check_quota_status(), QuotaStatus::Ok);
        usage.record_call(CallClass::Internal, "request_sync", Duration::ZERO, true, 0);

        let totals = usage.month_totals();
        assert_eq!(totals.period, "2026-11");
        assert_eq!(totals.total_calls, 1);
        assert_eq!(usage.lock_ledger(clock.now()).closed_months.len(), 1);
    }

    #[tokio::test]
    async fn flush_is_idempotent() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let usage = accountant(clock, PlanLimits::default());
        let store = RecordingStore::default();

        usage.record_call(CallClass::External, "rooms/{id}", Duration::from_millis(10), true, 100);
        assert_eq!(usage.flush(&store).await.unwrap(), 3);
        assert_eq!(usage.flush(&store).await.unwrap(), 0);
        assert!(!usage.is_dirty());

        let mut writes = store.writes();
        writes.sort();
        assert_eq!(
            writes,
            vec!["daily", "endpoints:2026-10", "month:2026-10"]
        );
    }

    #[tokio::test]
    async fn failed_write_stays_dirty_until_retried() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let usage = accountant(clock, PlanLimits::default());
        let store = RecordingStore::default();

        usage.record_call(CallClass::External, "rooms/{id}", Duration::from_millis(10), true, 100);
        store.fail_on(Some("daily"));
        assert!(usage.flush(&store).await.is_err());
        assert_eq!(store.writes().len(), 2);
        assert!(usage.is_dirty());

        store.fail_on(None);
        assert_eq!(usage.flush(&store).await.unwrap(), 1);
        assert_eq!(store.writes().last().map(String::as_str), Some("daily"));
        assert!(!usage.is_dirty());
    }

    #[tokio::test]
    async fn closed_month_is_flushed_under_its_own_period() {
        let clock = Arc::new(ManualClock::at(at("2026-10-31T23:00:00Z")));
        let usage = accountant(clock.clone(), PlanLimits::default());
        let store = RecordingStore::default();

        usage.record_call(CallClass::Internal, "usage_report", Duration::ZERO, true, 0);
        clock.set(at("2026-11-01T01:00:00Z").timestamp_millis());
        usage.record_call(CallClass::Internal, "usage_report", Duration::ZERO, true, 0);

        usage.flush(&store).await.unwrap();
        let writes = store.writes();
        assert!(writes.contains(&"month:2026-10".to_string()));
        assert!(writes.contains(&"month:2026-11".to_string()));
        assert!(!usage.is_dirty());
    }

    #[tokio::test]
    async fn restore_keeps_quota_across_restart() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let store = RecordingStore::default();

        let first = accountant(clock.clone(), invocations_plan(100));
        for _ in 0..90 {
            first.record_call(CallClass::Internal, "request_sync", Duration::ZERO, true, 0);
        }
        first.flush(&store).await.unwrap();

        let second = accountant(clock, invocations_plan(100));
        second.restore(&store).await.unwrap();
        for _ in 0..6 {
            second.record_call(CallClass::Internal, "request_sync", Duration::ZERO, true, 0);
        }

        assert_eq!(second.month_totals().internal_calls, 96);
        assert_eq!(second.check_quota_status(), QuotaStatus::Critical);
        assert_eq!(second.usage_report().totals.internal_calls, 96);
    }

    #[test]
    fn maintenance_is_idempotent() {
        let clock = Arc::new(ManualClock::at(at("2026-10-16T12:00:00Z")));
        let usage = accountant(clock, PlanLimits::default());
        usage.record_call(CallClass::External, "rooms/{id}", Duration::ZERO, true, 0);

        assert_eq!(usage.run_maintenance(), 0);
        assert_eq!(usage.run_maintenance(), 0);
        assert_eq!(usage.month_totals().total_calls, 1);
    }

    #[test]
    fn report_projects_and_ranks_endpoints() {
        let clock = Arc::new(ManualClock::at(at("2026-10-10T12:00:00Z")));
        let usage = accountant(clock, PlanLimits::default());

        for _ in 0..10 {
            usage.record_call(CallClass::External, "rooms/{id}", Duration::from_millis(300), true, 0);
            usage.record_call(CallClass::Internal, "sync_status", Duration::from_millis(2), true, 0);
        }
        usage.record_call(CallClass::External, "scores", Duration::from_millis(20), false, 0);

        let report = usage.usage_report();
        assert_eq!(report.days_elapsed, 10);
        assert_eq!(report.days_in_month, 31);
        assert!((report.projected.total_calls - 21.0 * 3.1).abs() < 1e-9);
        assert_eq!(report.slowest_endpoints[0].endpoint, "rooms/{id}");
        assert_eq!(report.error_prone_endpoints.len(), 1);
        assert_eq!(report.error_prone_endpoints[0].endpoint, "scores");
        assert_eq!(report.quota.status, QuotaStatus::Ok);
    }
}
