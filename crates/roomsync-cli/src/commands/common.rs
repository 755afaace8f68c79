use std::path::PathBuf;
use std::sync::Arc;

use roomsync_core::db::LibSqlStore;
use roomsync_core::upstream::HttpUpstream;
use roomsync_core::usage::{DimensionUsage, QuotaUsage, UsageReport};
use roomsync_core::{AppConfig, SyncDecision, SyncService, SyncStatus, SystemClock};

use crate::error::CliError;

/// Builds the one service this process uses and reloads persisted state.
pub async fn open_service(cli_db_path: Option<PathBuf>) -> Result<Arc<SyncService>, CliError> {
    let mut config = AppConfig::from_env()?;
    config.database.path = Some(resolve_db_path(cli_db_path, config.database.path.take()));
    tracing::debug!(?config, "configuration loaded");

    let store = Arc::new(LibSqlStore::from_config(&config.database, &default_db_path()).await?);
    let upstream = Arc::new(HttpUpstream::new(&config.upstream)?);
    let service = Arc::new(SyncService::new(
        &config,
        store,
        upstream,
        Arc::new(SystemClock),
    ));

    if let Err(error) = service.restore().await {
        tracing::warn!(%error, "starting with an empty usage ledger");
    }
    Ok(service)
}

/// `--db-path`, then `ROOMSYNC_DB_PATH`, then the platform data directory.
pub fn resolve_db_path(cli_db_path: Option<PathBuf>, env_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or(env_db_path)
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("roomsync")
        .join("roomsync.db")
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn format_timestamp(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || timestamp_ms.to_string(),
        |date_time| date_time.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else {
        format!("{}d ago", diff / day)
    }
}

pub fn format_duration_ms(duration_ms: i64) -> String {
    let seconds = (duration_ms.max(0) + 999) / 1_000;
    if seconds < 60 {
        format!("{seconds}s")
    } else {
        format!("{}m {:02}s", seconds / 60, seconds % 60)
    }
}

pub fn format_bytes(bytes: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0} {}", UNITS[unit])
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

pub fn format_decision(decision: &SyncDecision) -> String {
    let mut line = format!("decision: {}", decision.reason);
    if let Some(remaining) = decision.cooldown_remaining_ms {
        line.push_str(&format!(" (cooldown {} left)", format_duration_ms(remaining)));
    }
    if let Some(staleness) = decision.staleness {
        if let Some(age) = staleness.age_ms {
            line.push_str(&format!(" (age {})", format_duration_ms(age)));
        }
    }
    line
}

pub fn format_status_lines(status: &SyncStatus, now_ms: i64) -> Vec<String> {
    match status {
        SyncStatus::InProgress {
            job_id,
            stage,
            started_at,
            priority,
        } => vec![
            format!("in progress: {stage}"),
            format!("job: {job_id} ({priority})"),
            format!("started: {}", format_relative_time(*started_at, now_ms)),
        ],
        SyncStatus::Idle {
            last_synced_at,
            cooldown_remaining_ms,
        } => {
            let mut lines = vec!["idle".to_string()];
            match last_synced_at {
                Some(at) => lines.push(format!(
                    "last synced by this process: {} ({})",
                    format_timestamp(*at),
                    format_relative_time(*at, now_ms)
                )),
                None => lines.push("not synced by this process yet".to_string()),
            }
            if let Some(remaining) = cooldown_remaining_ms {
                lines.push(format!("cooldown: {} left", format_duration_ms(*remaining)));
            }
            lines
        }
    }
}

fn format_dimension(dimension: &DimensionUsage) -> String {
    let used = if dimension.dimension == "bandwidth_bytes" {
        format_bytes(dimension.used)
    } else {
        format!("{:.0}", dimension.used)
    };
    let limit = if dimension.dimension == "bandwidth_bytes" {
        #[allow(clippy::cast_precision_loss)]
        let limit = dimension.limit as f64;
        format_bytes(limit)
    } else {
        dimension.limit.to_string()
    };
    format!(
        "{:<16} {:>12} / {:<12} {:>6.1}%  {}",
        dimension.dimension,
        used,
        limit,
        dimension.percent,
        dimension.status
    )
}

pub fn format_quota_lines(quota: &QuotaUsage) -> Vec<String> {
    let mut lines = vec![format!("quota: {}", quota.status)];
    lines.extend(quota.dimensions.iter().map(format_dimension));
    lines
}

pub fn format_usage_lines(report: &UsageReport) -> Vec<String> {
    let totals = &report.totals;
    #[allow(clippy::cast_precision_loss)]
    let bandwidth = totals.bandwidth_bytes as f64;
    let mut lines = vec![
        format!(
            "period: {} (day {} of {})",
            report.period, report.days_elapsed, report.days_in_month
        ),
        format!(
            "calls: {} total, {} internal, {} external, {} errors",
            totals.total_calls, totals.internal_calls, totals.external_calls, totals.error_count
        ),
        format!(
            "bandwidth: {} (projected {})",
            format_bytes(bandwidth),
            format_bytes(report.projected.bandwidth_bytes)
        ),
        format!(
            "compute: {:.1}s (projected {:.1}s)",
            totals.compute_unit_seconds(),
            report.projected.compute_seconds
        ),
    ];
    lines.extend(format_quota_lines(&report.quota));

    if !report.slowest_endpoints.is_empty() {
        lines.push("slowest endpoints:".to_string());
        lines.extend(report.slowest_endpoints.iter().map(|endpoint| {
            format!(
                "  {:<8} {:<40} avg {:.0}ms max {}ms",
                endpoint.class.as_str(),
                endpoint.endpoint,
                endpoint.avg_duration_ms,
                endpoint.max_duration_ms
            )
        }));
    }
    if !report.error_prone_endpoints.is_empty() {
        lines.push("error-prone endpoints:".to_string());
        lines.extend(report.error_prone_endpoints.iter().map(|endpoint| {
            format!(
                "  {:<8} {:<40} {:.1}% of {}",
                endpoint.class.as_str(),
                endpoint.endpoint,
                endpoint.error_rate * 100.0,
                endpoint.count
            )
        }));
    }
    if report.overage.total > 0.0 {
        lines.push(format!("projected overage: ${:.2}", report.overage.total));
    }
    lines
}
