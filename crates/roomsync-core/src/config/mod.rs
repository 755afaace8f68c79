//! Environment-style runtime configuration.
//!
//! Every option has a default so a bare environment yields a working
//! local-only setup. Numeric options are range-checked at load time; an
//! out-of-range value is a startup error rather than a silent clamp.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_UPSTREAM_URL: &str = "https://osu.ppy.sh/api/v2";
const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the durable store lives.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Local database file; `None` lets the binary pick a platform default.
    pub path: Option<PathBuf>,
    /// Remote libSQL URL shared by every instance.
    pub remote_url: Option<String>,
    pub remote_auth_token: Option<String>,
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DatabaseConfig")
            .field("path", &self.path)
            .field("remote_url", &self.remote_url)
            .field(
                "remote_auth_token",
                &self.remote_auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(15),
        }
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Knobs for staleness, cooldown, locking and the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTuning {
    pub staleness_threshold: Duration,
    pub global_cooldown: Duration,
    pub lock_ttl: Duration,
    pub max_concurrent_fetches: usize,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub max_pagination_rounds: u32,
    pub max_retry_attempts: u32,
    pub retry_delay: Duration,
    pub commit_max_attempts: u32,
    pub commit_backoff: Duration,
    pub cooldown_capacity: usize,
    pub freshness_cache_capacity: usize,
    pub freshness_cache_path: Option<PathBuf>,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(5 * 60),
            global_cooldown: Duration::from_secs(2 * 60),
            lock_ttl: Duration::from_secs(10 * 60),
            max_concurrent_fetches: 4,
            batch_size: 8,
            batch_pause: Duration::from_millis(250),
            max_pagination_rounds: 20,
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(500),
            commit_max_attempts: 3,
            commit_backoff: Duration::from_millis(200),
            cooldown_capacity: 1_000,
            freshness_cache_capacity: 500,
            freshness_cache_path: None,
        }
    }
}

/// Size caps for the in-memory usage ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageCaps {
    pub max_endpoints: usize,
    pub max_daily_rollups: usize,
    pub max_recent_samples: usize,
}

impl Default for UsageCaps {
    fn default() -> Self {
        Self {
            max_endpoints: 200,
            max_daily_rollups: 62,
            max_recent_samples: 20,
        }
    }
}

/// Monthly plan limits per quota dimension. A zero limit disables the dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanLimits {
    pub invocations: u64,
    pub external_calls: u64,
    pub bandwidth_bytes: u64,
    pub compute_seconds: u64,
}

impl Default for PlanLimits {
    fn default() -> Self {
        Self {
            invocations: 1_000_000,
            external_calls: 100_000,
            bandwidth_bytes: 100 * GIB,
            compute_seconds: 360_000,
        }
    }
}

/// Intervals for the background maintenance loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceSchedule {
    pub flush_interval: Duration,
    pub eviction_interval: Duration,
    pub lock_sweep_interval: Duration,
    /// How long shutdown waits for in-flight syncs before abandoning them.
    pub shutdown_grace: Duration,
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(300),
            lock_sweep_interval: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub upstream: UpstreamConfig,
    pub sync: SyncTuning,
    pub usage: UsageCaps,
    pub plan: PlanLimits,
    pub maintenance: MaintenanceSchedule,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = &lookup;
        let defaults = Self::default();

        let remote_url = optional_trimmed(lookup, "ROOMSYNC_DB_URL");
        let remote_auth_token = optional_trimmed(lookup, "ROOMSYNC_DB_AUTH_TOKEN");
        if remote_url.is_some() && remote_auth_token.is_none() {
            return Err(ConfigError::MissingVar("ROOMSYNC_DB_AUTH_TOKEN"));
        }
        let database = DatabaseConfig {
            path: optional_trimmed(lookup, "ROOMSYNC_DB_PATH").map(PathBuf::from),
            remote_url,
            remote_auth_token,
        };

        let base_url = value_or_default(lookup, "ROOMSYNC_UPSTREAM_URL", DEFAULT_UPSTREAM_URL);
        if !is_http_url(&base_url) {
            return Err(ConfigError::Invalid(
                "ROOMSYNC_UPSTREAM_URL must start with http:// or https://".to_string(),
            ));
        }
        let upstream = UpstreamConfig {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: optional_trimmed(lookup, "ROOMSYNC_UPSTREAM_TOKEN"),
            timeout: Duration::from_secs(bounded(
                lookup,
                "ROOMSYNC_UPSTREAM_TIMEOUT_SECS",
                defaults.upstream.timeout.as_secs(),
                1..=120,
            )?),
        };

        let sync = SyncTuning {
            staleness_threshold: millis(
                lookup,
                "ROOMSYNC_STALENESS_THRESHOLD_MS",
                defaults.sync.staleness_threshold,
                1_000..=86_400_000,
            )?,
            global_cooldown: millis(
                lookup,
                "ROOMSYNC_GLOBAL_COOLDOWN_MS",
                defaults.sync.global_cooldown,
                0..=86_400_000,
            )?,
            lock_ttl: millis(
                lookup,
                "ROOMSYNC_LOCK_TTL_MS",
                defaults.sync.lock_ttl,
                10_000..=3_600_000,
            )?,
            max_concurrent_fetches: bounded(
                lookup,
                "ROOMSYNC_MAX_CONCURRENT_FETCHES",
                defaults.sync.max_concurrent_fetches,
                1..=32,
            )?,
            batch_size: bounded(
                lookup,
                "ROOMSYNC_BATCH_SIZE",
                defaults.sync.batch_size,
                1..=100,
            )?,
            batch_pause: millis(
                lookup,
                "ROOMSYNC_BATCH_PAUSE_MS",
                defaults.sync.batch_pause,
                0..=60_000,
            )?,
            max_pagination_rounds: bounded(
                lookup,
                "ROOMSYNC_MAX_PAGINATION_ROUNDS",
                defaults.sync.max_pagination_rounds,
                1..=1_000,
            )?,
            max_retry_attempts: bounded(
                lookup,
                "ROOMSYNC_MAX_RETRY_ATTEMPTS",
                defaults.sync.max_retry_attempts,
                1..=10,
            )?,
            retry_delay: millis(
                lookup,
                "ROOMSYNC_RETRY_DELAY_MS",
                defaults.sync.retry_delay,
                0..=60_000,
            )?,
            commit_max_attempts: bounded(
                lookup,
                "ROOMSYNC_COMMIT_MAX_ATTEMPTS",
                defaults.sync.commit_max_attempts,
                1..=10,
            )?,
            commit_backoff: millis(
                lookup,
                "ROOMSYNC_COMMIT_BACKOFF_MS",
                defaults.sync.commit_backoff,
                0..=60_000,
            )?,
            cooldown_capacity: bounded(
                lookup,
                "ROOMSYNC_COOLDOWN_CAPACITY",
                defaults.sync.cooldown_capacity,
                1..=1_000_000,
            )?,
            freshness_cache_capacity: bounded(
                lookup,
                "ROOMSYNC_FRESHNESS_CACHE_CAPACITY",
                defaults.sync.freshness_cache_capacity,
                1..=1_000_000,
            )?,
            freshness_cache_path: optional_trimmed(lookup, "ROOMSYNC_FRESHNESS_CACHE_PATH")
                .map(PathBuf::from),
        };
        if sync.lock_ttl <= sync.retry_delay {
            return Err(ConfigError::Invalid(
                "ROOMSYNC_LOCK_TTL_MS must exceed ROOMSYNC_RETRY_DELAY_MS".to_string(),
            ));
        }

        let usage = UsageCaps {
            max_endpoints: bounded(
                lookup,
                "ROOMSYNC_USAGE_MAX_ENDPOINTS",
                defaults.usage.max_endpoints,
                1..=10_000,
            )?,
            max_daily_rollups: bounded(
                lookup,
                "ROOMSYNC_USAGE_MAX_DAILY",
                defaults.usage.max_daily_rollups,
                1..=3_660,
            )?,
            max_recent_samples: bounded(
                lookup,
                "ROOMSYNC_USAGE_MAX_SAMPLES",
                defaults.usage.max_recent_samples,
                1..=1_000,
            )?,
        };

        let plan = PlanLimits {
            invocations: bounded(
                lookup,
                "ROOMSYNC_PLAN_INVOCATIONS",
                defaults.plan.invocations,
                0..=u64::MAX,
            )?,
            external_calls: bounded(
                lookup,
                "ROOMSYNC_PLAN_EXTERNAL_CALLS",
                defaults.plan.external_calls,
                0..=u64::MAX,
            )?,
            bandwidth_bytes: bounded(
                lookup,
                "ROOMSYNC_PLAN_BANDWIDTH_BYTES",
                defaults.plan.bandwidth_bytes,
                0..=u64::MAX,
            )?,
            compute_seconds: bounded(
                lookup,
                "ROOMSYNC_PLAN_COMPUTE_SECONDS",
                defaults.plan.compute_seconds,
                0..=u64::MAX,
            )?,
        };

        let maintenance = MaintenanceSchedule {
            flush_interval: Duration::from_secs(bounded(
                lookup,
                "ROOMSYNC_FLUSH_INTERVAL_SECS",
                defaults.maintenance.flush_interval.as_secs(),
                5..=3_600,
            )?),
            eviction_interval: Duration::from_secs(bounded(
                lookup,
                "ROOMSYNC_EVICTION_INTERVAL_SECS",
                defaults.maintenance.eviction_interval.as_secs(),
                10..=86_400,
            )?),
            lock_sweep_interval: Duration::from_secs(bounded(
                lookup,
                "ROOMSYNC_LOCK_SWEEP_INTERVAL_SECS",
                defaults.maintenance.lock_sweep_interval.as_secs(),
                10..=86_400,
            )?),
            shutdown_grace: Duration::from_secs(bounded(
                lookup,
                "ROOMSYNC_SHUTDOWN_GRACE_SECS",
                defaults.maintenance.shutdown_grace.as_secs(),
                0..=600,
            )?),
        };

        Ok(Self {
            database,
            upstream,
            sync,
            usage,
            plan,
            maintenance,
        })
    }
}

fn millis(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: Duration,
    range: RangeInclusive<u64>,
) -> Result<Duration, ConfigError> {
    let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    bounded(lookup, name, default, range).map(Duration::from_millis)
}

fn bounded<T>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
    range: RangeInclusive<T>,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + fmt::Display + Copy,
{
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<T>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.sync.staleness_threshold, Duration::from_secs(300));
    }

    #[test]
    fn config_parses_overrides() {
        let config = load(&[
            ("ROOMSYNC_STALENESS_THRESHOLD_MS", "60000"),
            ("ROOMSYNC_MAX_CONCURRENT_FETCHES", " 8 "),
            ("ROOMSYNC_PLAN_INVOCATIONS", "100"),
            ("ROOMSYNC_UPSTREAM_URL", "http://localhost:9000/api/"),
            ("ROOMSYNC_SHUTDOWN_GRACE_SECS", "0"),
        ])
        .unwrap();
        assert_eq!(config.maintenance.shutdown_grace, Duration::ZERO);
        assert_eq!(config.sync.staleness_threshold, Duration::from_secs(60));
        assert_eq!(config.sync.max_concurrent_fetches, 8);
        assert_eq!(config.plan.invocations, 100);
        assert_eq!(config.upstream.base_url, "http://localhost:9000/api");
    }

    #[test]
    fn config_rejects_out_of_range_values() {
        let err = load(&[("ROOMSYNC_MAX_CONCURRENT_FETCHES", "0")]).unwrap_err();
        assert!(err.to_string().contains("ROOMSYNC_MAX_CONCURRENT_FETCHES"));

        let err = load(&[("ROOMSYNC_BATCH_SIZE", "many")]).unwrap_err();
        assert!(err.to_string().contains("must be an integer"));
    }

    #[test]
    fn remote_database_requires_token() {
        let err = load(&[("ROOMSYNC_DB_URL", "libsql://mirror.turso.io")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("ROOMSYNC_DB_AUTH_TOKEN")));
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = load(&[
            ("ROOMSYNC_DB_URL", "libsql://mirror.turso.io"),
            ("ROOMSYNC_DB_AUTH_TOKEN", "sensitive-db-token"),
            ("ROOMSYNC_UPSTREAM_TOKEN", "sensitive-api-token"),
        ])
        .unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-db-token"));
        assert!(!debug_output.contains("sensitive-api-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
