//! Read-only usage views: quota percentages and the month-end report.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ledger::{days_in_month, month_start, EndpointStats, Ledger, MonthlyAggregate};
use super::{CallClass, QuotaStatus};
use crate::config::PlanLimits;

const TOP_ENDPOINTS: usize = 5;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;
const COST_PER_MILLION_INVOCATIONS: f64 = 0.60;
const COST_PER_GB: f64 = 0.15;
const COST_PER_COMPUTE_HOUR: f64 = 0.18;

/// Usage of one quota dimension against its plan limit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionUsage {
    pub dimension: &'static str,
    pub used: f64,
    pub limit: u64,
    pub percent: f64,
    pub status: QuotaStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub status: QuotaStatus,
    pub dimensions: Vec<DimensionUsage>,
}

impl QuotaUsage {
    pub(crate) fn compute(month: &MonthlyAggregate, plan: PlanLimits) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let candidates = [
            ("invocations", month.internal_calls as f64, plan.invocations),
            ("external_calls", month.external_calls as f64, plan.external_calls),
            ("bandwidth_bytes", month.bandwidth_bytes as f64, plan.bandwidth_bytes),
            ("compute_seconds", month.compute_unit_seconds(), plan.compute_seconds),
        ];
        let dimensions: Vec<DimensionUsage> = candidates
            .into_iter()
            .filter(|(_, _, limit)| *limit > 0)
            .map(|(dimension, used, limit)| {
                #[allow(clippy::cast_precision_loss)]
                let percent = used / limit as f64 * 100.0;
                DimensionUsage {
                    dimension,
                    used,
                    limit,
                    percent,
                    status: QuotaStatus::from_percent(percent),
                }
            })
            .collect();
        let status = dimensions
            .iter()
            .map(|dimension| dimension.status)
            .max()
            .unwrap_or(QuotaStatus::Ok);
        Self { status, dimensions }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectedTotals {
    pub total_calls: f64,
    pub internal_calls: f64,
    pub external_calls: f64,
    pub bandwidth_bytes: f64,
    pub compute_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EndpointSummary {
    pub class: CallClass,
    pub endpoint: String,
    pub count: u64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
    pub error_rate: f64,
}

/// Estimated cost beyond the plan, in dollars, for the projected month.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverageCost {
    pub invocations: f64,
    pub bandwidth: f64,
    pub compute: f64,
    pub total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageReport {
    pub generated_at: DateTime<Utc>,
    pub period: String,
    pub days_elapsed: u32,
    pub days_in_month: u32,
    pub totals: MonthlyAggregate,
    pub projected: ProjectedTotals,
    pub quota: QuotaUsage,
    pub slowest_endpoints: Vec<EndpointSummary>,
    pub error_prone_endpoints: Vec<EndpointSummary>,
    pub overage: OverageCost,
}

impl UsageReport {
    pub(crate) fn build(ledger: &Ledger, plan: PlanLimits, now: DateTime<Utc>) -> Self {
        let month = &ledger.month;
        let days_total = days_in_month(now);
        let elapsed = (now - month_start(now)).num_days() + 1;
        let days_elapsed = u32::try_from(elapsed.max(1))
            .unwrap_or(1)
            .min(days_total);
        let factor = f64::from(days_total) / f64::from(days_elapsed);

        #[allow(clippy::cast_precision_loss)]
        let projected = ProjectedTotals {
            total_calls: month.total_calls as f64 * factor,
            internal_calls: month.internal_calls as f64 * factor,
            external_calls: month.external_calls as f64 * factor,
            bandwidth_bytes: month.bandwidth_bytes as f64 * factor,
            compute_seconds: month.compute_unit_seconds() * factor,
        };

        let summaries = endpoint_summaries(ledger);
        let slowest_endpoints = top_by(&summaries, |a, b| {
            b.avg_duration_ms.total_cmp(&a.avg_duration_ms)
        });
        let error_prone: Vec<EndpointSummary> = summaries
            .iter()
            .filter(|summary| summary.error_rate > 0.0)
            .cloned()
            .collect();
        let error_prone_endpoints = top_by(&error_prone, |a, b| {
            b.error_rate
                .total_cmp(&a.error_rate)
                .then(b.count.cmp(&a.count))
        });

        Self {
            generated_at: now,
            period: month.period.clone(),
            days_elapsed,
            days_in_month: days_total,
            totals: month.clone(),
            overage: overage_cost(&projected, plan),
            projected,
            quota: QuotaUsage::compute(month, plan),
            slowest_endpoints,
            error_prone_endpoints,
        }
    }
}

fn endpoint_summaries(ledger: &Ledger) -> Vec<EndpointSummary> {
    [CallClass::Internal, CallClass::External]
        .into_iter()
        .flat_map(|class| {
            ledger
                .endpoints(class)
                .iter()
                .map(move |(endpoint, stats)| summarize(class, endpoint, stats))
        })
        .collect()
}

fn summarize(class: CallClass, endpoint: &str, stats: &EndpointStats) -> EndpointSummary {
    EndpointSummary {
        class,
        endpoint: endpoint.to_string(),
        count: stats.count,
        avg_duration_ms: stats.avg_duration_ms(),
        max_duration_ms: stats.max_duration_ms,
        error_rate: stats.error_rate(),
    }
}

fn top_by(
    summaries: &[EndpointSummary],
    order: impl Fn(&EndpointSummary, &EndpointSummary) -> Ordering,
) -> Vec<EndpointSummary> {
    let mut sorted = summaries.to_vec();
    sorted.sort_by(|a, b| order(a, b).then_with(|| a.endpoint.cmp(&b.endpoint)));
    sorted.truncate(TOP_ENDPOINTS);
    sorted
}

#[allow(clippy::cast_precision_loss)]
fn overage_cost(projected: &ProjectedTotals, plan: PlanLimits) -> OverageCost {
    let over = |used: f64, limit: u64| {
        if limit == 0 {
            0.0
        } else {
            (used - limit as f64).max(0.0)
        }
    };

    let invocations =
        over(projected.internal_calls, plan.invocations) / 1_000_000.0 * COST_PER_MILLION_INVOCATIONS;
    let bandwidth = over(projected.bandwidth_bytes, plan.bandwidth_bytes) / GB * COST_PER_GB;
    let compute =
        over(projected.compute_seconds, plan.compute_seconds) / 3_600.0 * COST_PER_COMPUTE_HOUR;

    OverageCost {
        invocations,
        bandwidth,
        compute,
        total: invocations + bandwidth + compute,
    }
}
