//! Usage accounting: call counters, quota status and usage reports.

mod accountant;
mod ledger;
mod report;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use accountant::UsageAccountant;
pub use ledger::{
    days_in_month, month_start, next_month_start, period_key, CallSample, DailyRollup,
    EndpointStats, MonthlyAggregate,
};
pub use report::{
    DimensionUsage, EndpointSummary, OverageCost, ProjectedTotals, QuotaUsage, UsageReport,
};

/// Who made the call being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallClass {
    /// An invocation of this service (counts against the hosting plan).
    Internal,
    /// A call this service made to the upstream API.
    External,
}

impl CallClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

impl fmt::Display for CallClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worst-case quota level across all tracked dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Ok,
    Caution,
    Warning,
    Critical,
}

impl QuotaStatus {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= 95.0 {
            Self::Critical
        } else if percent >= 85.0 {
            Self::Warning
        } else if percent >= 70.0 {
            Self::Caution
        } else {
            Self::Ok
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Caution => "caution",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
