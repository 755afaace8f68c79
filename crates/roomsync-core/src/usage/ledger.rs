//! Bounded in-memory usage ledger.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::CallClass;
use crate::config::UsageCaps;

/// One recorded call, kept for short-term inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSample {
    pub at: i64,
    pub duration_ms: u64,
    pub success: bool,
    pub size_bytes: u64,
}

/// Per-endpoint counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub count: u64,
    pub error_count: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub last_called_at: i64,
    /// Most recent calls, oldest first.
    #[serde(skip)]
    pub recent: VecDeque<CallSample>,
}

impl EndpointStats {
    fn record(&mut self, sample: CallSample, max_samples: usize) {
        self.count = self.count.saturating_add(1);
        if !sample.success {
            self.error_count = self.error_count.saturating_add(1);
        }
        self.total_duration_ms = self.total_duration_ms.saturating_add(sample.duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(sample.duration_ms);
        self.last_called_at = sample.at;
        self.recent.push_back(sample);
        trim_samples(&mut self.recent, max_samples);
    }

    fn absorb(&mut self, other: &Self) {
        self.count = self.count.saturating_add(other.count);
        self.error_count = self.error_count.saturating_add(other.error_count);
        self.total_duration_ms = self.total_duration_ms.saturating_add(other.total_duration_ms);
        self.max_duration_ms = self.max_duration_ms.max(other.max_duration_ms);
        self.last_called_at = self.last_called_at.max(other.last_called_at);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn avg_duration_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.count as f64
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn error_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.count as f64
        }
    }
}

/// Totals for one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyRollup {
    pub date: NaiveDate,
    pub total_calls: u64,
    pub external_calls: u64,
    pub error_count: u64,
    pub bandwidth_bytes: u64,
    pub compute_ms: u64,
}

impl DailyRollup {
    const fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            total_calls: 0,
            external_calls: 0,
            error_count: 0,
            bandwidth_bytes: 0,
            compute_ms: 0,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.total_calls = self.total_calls.saturating_add(other.total_calls);
        self.external_calls = self.external_calls.saturating_add(other.external_calls);
        self.error_count = self.error_count.saturating_add(other.error_count);
        self.bandwidth_bytes = self.bandwidth_bytes.saturating_add(other.bandwidth_bytes);
        self.compute_ms = self.compute_ms.saturating_add(other.compute_ms);
    }
}

/// Totals for the current billing month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    /// `YYYY-MM`
    pub period: String,
    pub started_at: i64,
    pub total_calls: u64,
    pub internal_calls: u64,
    pub external_calls: u64,
    pub error_count: u64,
    pub bandwidth_bytes: u64,
    /// Execution time of internal invocations.
    pub compute_ms: u64,
}

impl MonthlyAggregate {
    pub fn starting(now: DateTime<Utc>) -> Self {
        Self {
            period: period_key(now),
            started_at: month_start(now).timestamp_millis(),
            total_calls: 0,
            internal_calls: 0,
            external_calls: 0,
            error_count: 0,
            bandwidth_bytes: 0,
            compute_ms: 0,
        }
    }

    fn absorb(&mut self, other: &Self) {
        self.total_calls = self.total_calls.saturating_add(other.total_calls);
        self.internal_calls = self.internal_calls.saturating_add(other.internal_calls);
        self.external_calls = self.external_calls.saturating_add(other.external_calls);
        self.error_count = self.error_count.saturating_add(other.error_count);
        self.bandwidth_bytes = self.bandwidth_bytes.saturating_add(other.bandwidth_bytes);
        self.compute_ms = self.compute_ms.saturating_add(other.compute_ms);
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn compute_unit_seconds(&self) -> f64 {
        self.compute_ms as f64 / 1_000.0
    }
}

/// Version counter that tells a flush what changed since the last write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct DirtyFlag {
    version: u64,
    flushed: u64,
}

impl DirtyFlag {
    pub(crate) fn mark(&mut self) {
        self.version = self.version.wrapping_add(1);
    }

    pub(crate) const fn is_dirty(self) -> bool {
        self.version != self.flushed
    }

    pub(crate) const fn version(self) -> u64 {
        self.version
    }

    /// Records that everything up to `version` is durable.
    pub(crate) fn confirm(&mut self, version: u64) {
        if version > self.flushed {
            self.flushed = version;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct DirtySet {
    pub(crate) monthly: DirtyFlag,
    pub(crate) daily: DirtyFlag,
    pub(crate) endpoints: DirtyFlag,
}

impl DirtySet {
    pub(crate) fn mark_all(&mut self) {
        self.monthly.mark();
        self.daily.mark();
        self.endpoints.mark();
    }
}

/// Stored shape of both endpoint maps for one month.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct EndpointsSnapshot {
    #[serde(default)]
    pub(crate) internal: HashMap<String, EndpointStats>,
    #[serde(default)]
    pub(crate) external: HashMap<String, EndpointStats>,
}

/// Aggregates read back from durable storage on start.
#[derive(Debug, Default)]
pub(crate) struct Persisted {
    pub(crate) month: Option<MonthlyAggregate>,
    pub(crate) daily: Vec<DailyRollup>,
    pub(crate) endpoints: Option<EndpointsSnapshot>,
}

/// What a single `record` call contributes to the ledger.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallEntry<'a> {
    pub(crate) class: CallClass,
    pub(crate) endpoint: &'a str,
    pub(crate) sample: CallSample,
}

/// The mutable state behind the accountant's mutex.
#[derive(Debug)]
pub(crate) struct Ledger {
    pub(crate) internal: HashMap<String, EndpointStats>,
    pub(crate) external: HashMap<String, EndpointStats>,
    pub(crate) daily: BTreeMap<NaiveDate, DailyRollup>,
    pub(crate) month: MonthlyAggregate,
    /// Months closed by a rollover and not yet written out.
    pub(crate) closed_months: Vec<MonthlyAggregate>,
    pub(crate) dirty: DirtySet,
}

impl Ledger {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            internal: HashMap::new(),
            external: HashMap::new(),
            daily: BTreeMap::new(),
            month: MonthlyAggregate::starting(now),
            closed_months: Vec::new(),
            dirty: DirtySet::default(),
        }
    }

    pub(crate) const fn endpoints(&self, class: CallClass) -> &HashMap<String, EndpointStats> {
        match class {
            CallClass::Internal => &self.internal,
            CallClass::External => &self.external,
        }
    }

    /// Applies one call and returns the endpoint's running count.
    pub(crate) fn record(&mut self, entry: CallEntry<'_>, caps: UsageCaps, day: NaiveDate) -> u64 {
        let CallEntry {
            class,
            endpoint,
            sample,
        } = entry;

        let endpoints = match class {
            CallClass::Internal => &mut self.internal,
            CallClass::External => &mut self.external,
        };
        if !endpoints.contains_key(endpoint) {
            while endpoints.len() >= caps.max_endpoints {
                if !evict_lowest(endpoints) {
                    break;
                }
            }
        }
        let stats = endpoints.entry(endpoint.to_string()).or_default();
        stats.record(sample, caps.max_recent_samples);
        let count = stats.count;

        let compute_ms = match class {
            CallClass::Internal => sample.duration_ms,
            CallClass::External => 0,
        };
        let failed = u64::from(!sample.success);

        let month = &mut self.month;
        month.total_calls = month.total_calls.saturating_add(1);
        match class {
            CallClass::Internal => month.internal_calls = month.internal_calls.saturating_add(1),
            CallClass::External => month.external_calls = month.external_calls.saturating_add(1),
        }
        month.error_count = month.error_count.saturating_add(failed);
        month.bandwidth_bytes = month.bandwidth_bytes.saturating_add(sample.size_bytes);
        month.compute_ms = month.compute_ms.saturating_add(compute_ms);

        let rollup = self
            .daily
            .entry(day)
            .or_insert_with(|| DailyRollup::empty(day));
        rollup.total_calls = rollup.total_calls.saturating_add(1);
        if class == CallClass::External {
            rollup.external_calls = rollup.external_calls.saturating_add(1);
        }
        rollup.error_count = rollup.error_count.saturating_add(failed);
        rollup.bandwidth_bytes = rollup.bandwidth_bytes.saturating_add(sample.size_bytes);
        rollup.compute_ms = rollup.compute_ms.saturating_add(compute_ms);
        trim_daily(&mut self.daily, caps.max_daily_rollups);

        self.dirty.mark_all();
        count
    }

    /// Starts a new month: counters and endpoint maps reset, daily history is kept.
    pub(crate) fn roll_over(&mut self, now: DateTime<Utc>) {
        let closed = std::mem::replace(&mut self.month, MonthlyAggregate::starting(now));
        if closed.total_calls > 0 {
            self.closed_months.push(closed);
        }
        self.internal.clear();
        self.external.clear();
        self.dirty.mark_all();
    }

    /// Folds previously persisted aggregates into the live ledger.
    pub(crate) fn absorb_persisted(&mut self, persisted: Persisted, caps: UsageCaps) {
        if let Some(month) = persisted.month {
            if month.period == self.month.period {
                self.month.absorb(&month);
            }
        }
        for rollup in persisted.daily {
            self.daily
                .entry(rollup.date)
                .and_modify(|current| current.absorb(&rollup))
                .or_insert(rollup);
        }
        if let Some(endpoints) = persisted.endpoints {
            for (target, stored) in [
                (&mut self.internal, endpoints.internal),
                (&mut self.external, endpoints.external),
            ] {
                for (key, stats) in stored {
                    target
                        .entry(key)
                        .and_modify(|current| current.absorb(&stats))
                        .or_insert(stats);
                }
            }
        }
        self.enforce_caps(caps);
    }

    pub(crate) fn endpoints_snapshot(&self) -> EndpointsSnapshot {
        EndpointsSnapshot {
            internal: self.internal.clone(),
            external: self.external.clone(),
        }
    }

    /// Trims every bounded collection back to its cap; returns entries removed.
    pub(crate) fn enforce_caps(&mut self, caps: UsageCaps) -> usize {
        let mut removed = 0;
        for endpoints in [&mut self.internal, &mut self.external] {
            while endpoints.len() > caps.max_endpoints {
                if !evict_lowest(endpoints) {
                    break;
                }
                removed += 1;
            }
            for stats in endpoints.values_mut() {
                removed += trim_samples(&mut stats.recent, caps.max_recent_samples);
                stats.recent.shrink_to_fit();
            }
            endpoints.shrink_to_fit();
        }
        removed += trim_daily(&mut self.daily, caps.max_daily_rollups);
        if removed > 0 {
            self.dirty.endpoints.mark();
            self.dirty.daily.mark();
        }
        removed
    }
}

/// Removes the endpoint with the lowest count (oldest call breaks ties).
fn evict_lowest(endpoints: &mut HashMap<String, EndpointStats>) -> bool {
    let victim = endpoints
        .iter()
        .min_by(|(a_key, a), (b_key, b)| {
            a.count
                .cmp(&b.count)
                .then(a.last_called_at.cmp(&b.last_called_at))
                .then(a_key.cmp(b_key))
        })
        .map(|(key, _)| key.clone());
    victim.is_some_and(|key| endpoints.remove(&key).is_some())
}

fn trim_samples(samples: &mut VecDeque<CallSample>, max: usize) -> usize {
    let excess = samples.len().saturating_sub(max);
    samples.drain(..excess);
    excess
}

fn trim_daily(daily: &mut BTreeMap<NaiveDate, DailyRollup>, max: usize) -> usize {
    let mut removed = 0;
    while daily.len() > max {
        daily.pop_first();
        removed += 1;
    }
    removed
}

/// `YYYY-MM` billing period containing `now`.
pub fn period_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

/// First instant of the month containing `now`.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    first_instant(now.year(), now.month())
}

/// First instant of the calendar month after the one containing `now`.
pub fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    if now.month() == 12 {
        first_instant(now.year() + 1, 1)
    } else {
        first_instant(now.year(), now.month() + 1)
    }
}

pub fn days_in_month(now: DateTime<Utc>) -> u32 {
    let days = (next_month_start(now) - month_start(now)).num_days();
    u32::try_from(days).unwrap_or(30)
}

fn first_instant(year: i32, month: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}
