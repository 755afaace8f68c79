//! Staleness decisions backed by durable freshness records.
//!
//! A bounded LRU mirror of recent freshness timestamps answers the common
//! "still fresh" case without a storage round trip. The mirror is never
//! authoritative: anything it cannot vouch for falls through to storage.

use std::fs;
use std::io;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{duration_ms, Clock};
use crate::error::Result;
use crate::models::{FreshnessRecord, ResourceKey};
use crate::store::FreshnessStore;

/// Where a staleness answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshnessSource {
    Cache,
    Store,
    /// Nothing stored yet: the resource has never been synced.
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Staleness {
    pub stale: bool,
    pub last_updated: Option<i64>,
    pub age_ms: Option<i64>,
    pub is_active: bool,
    pub source: FreshnessSource,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    key: ResourceKey,
    last_seen: i64,
}

/// Bounded in-process mirror of `resource -> last seen freshness timestamp`.
pub struct FreshnessCache {
    entries: Mutex<LruCache<ResourceKey, i64>>,
}

impl FreshnessCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<ResourceKey, i64>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            warn!("freshness cache mutex poisoned, continuing with recovered state");
            poisoned.into_inner()
        })
    }

    pub fn get(&self, key: &ResourceKey) -> Option<i64> {
        self.entries().get(key).copied()
    }

    /// Records `last_seen`, keeping the newer value if one is cached.
    pub fn remember(&self, key: ResourceKey, last_seen: i64) {
        let mut entries = self.entries();
        let newest = entries
            .peek(&key)
            .map_or(last_seen, |current| (*current).max(last_seen));
        entries.put(key, newest);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Writes the mirror as JSON, least recently used first.
    pub fn save(&self, path: &Path) -> io::Result<usize> {
        let snapshot: Vec<CacheEntry> = self
            .entries()
            .iter()
            .rev()
            .map(|(key, last_seen)| CacheEntry {
                key: *key,
                last_seen: *last_seen,
            })
            .collect();
        let payload = serde_json::to_vec(&snapshot).map_err(io::Error::other)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, path)?;
        Ok(snapshot.len())
    }

    /// Loads a saved mirror. Returns how many entries were restored.
    pub fn load(&self, path: &Path) -> io::Result<usize> {
        let payload = match fs::read(path) {
            Ok(payload) => payload,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error),
        };
        let snapshot: Vec<CacheEntry> =
            serde_json::from_slice(&payload).map_err(io::Error::other)?;
        let restored = snapshot.len();
        for entry in snapshot {
            self.remember(entry.key, entry.last_seen);
        }
        Ok(restored)
    }
}

pub struct StalenessEvaluator {
    store: Arc<dyn FreshnessStore>,
    cache: FreshnessCache,
    cache_path: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    threshold: Duration,
}

impl StalenessEvaluator {
    pub fn new(
        store: Arc<dyn FreshnessStore>,
        clock: Arc<dyn Clock>,
        threshold: Duration,
        cache_capacity: usize,
    ) -> Self {
        Self {
            store,
            cache: FreshnessCache::new(cache_capacity),
            cache_path: None,
            clock,
            threshold,
        }
    }

    #[must_use]
    pub fn with_cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.cache_path = path;
        self
    }

    pub const fn threshold(&self) -> Duration {
        self.threshold
    }

    pub const fn cache(&self) -> &FreshnessCache {
        &self.cache
    }

    pub async fn is_stale(&self, key: ResourceKey) -> Result<Staleness> {
        let now = self.clock.now_ms();
        let threshold = duration_ms(self.threshold);

        if let Some(last_seen) = self.cache.get(&key) {
            let age = now.saturating_sub(last_seen);
            if age <= threshold {
                return Ok(Staleness {
                    stale: false,
                    last_updated: Some(last_seen),
                    age_ms: Some(age),
                    is_active: true,
                    source: FreshnessSource::Cache,
                });
            }
        }

        let Some(record) = self.store.read_freshness(&key).await? else {
            return Ok(Staleness {
                stale: true,
                last_updated: None,
                age_ms: None,
                is_active: true,
                source: FreshnessSource::Missing,
            });
        };

        if record.is_active {
            self.cache.remember(key, record.last_updated);
        }
        let age = now.saturating_sub(record.last_updated);
        Ok(Staleness {
            stale: record.is_active && age > threshold,
            last_updated: Some(record.last_updated),
            age_ms: Some(age),
            is_active: record.is_active,
            source: FreshnessSource::Store,
        })
    }

    /// Records a successful refresh in storage and in the mirror.
    pub async fn mark_fresh(&self, key: ResourceKey, timestamp: i64, is_active: bool) -> Result<()> {
        self.store
            .write_freshness(&FreshnessRecord {
                key,
                last_updated: timestamp,
                is_active,
            })
            .await?;
        // Only active resources are mirrored, so a cache hit always means active.
        if is_active {
            self.cache.remember(key, timestamp);
        }
        Ok(())
    }

    /// Best-effort restore of the mirror saved by a previous process.
    pub fn load_cache(&self) -> usize {
        let Some(path) = &self.cache_path else {
            return 0;
        };
        match self.cache.load(path) {
            Ok(restored) => {
                debug!(restored, path = %path.display(), "freshness cache loaded");
                restored
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "ignoring unreadable freshness cache");
                0
            }
        }
    }

    /// Best-effort save of the mirror.
    pub fn persist_cache(&self) -> usize {
        let Some(path) = &self.cache_path else {
            return 0;
        };
        match self.cache.save(path) {
            Ok(saved) => saved,
            Err(error) => {
                warn!(path = %path.display(), %error, "failed to persist freshness cache");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::LibSqlStore;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    const THRESHOLD: Duration = Duration::from_secs(300);
    const NOW: i64 = 1_760_000_000_000;

    async fn evaluator() -> (StalenessEvaluator, Arc<LibSqlStore>, Arc<ManualClock>) {
        let store = Arc::new(LibSqlStore::open_in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(NOW));
        let evaluator = StalenessEvaluator::new(store.clone(), clock.clone(), THRESHOLD, 16);
        (evaluator, store, clock)
    }

    async fn seed(store: &LibSqlStore, key: ResourceKey, last_updated: i64, is_active: bool) {
        store
            .write_freshness(&FreshnessRecord {
                key,
                last_updated,
                is_active,
            })
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_synced_resource_is_stale() {
        let (evaluator, _, _) = evaluator().await;
        let staleness = evaluator.is_stale(ResourceKey::challenge(1)).await.unwrap();
        assert!(staleness.stale);
        assert_eq!(staleness.source, FreshnessSource::Missing);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn twenty_minutes_old_is_stale() {
        let (evaluator, store, _) = evaluator().await;
        let key = ResourceKey::challenge(2);
        seed(&store, key, NOW - 20 * 60 * 1_000, true).await;

        let staleness = evaluator.is_stale(key).await.unwrap();
        assert!(staleness.stale);
        assert_eq!(staleness.age_ms, Some(20 * 60 * 1_000));
        assert_eq!(staleness.source, FreshnessSource::Store);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn threshold_is_inclusive() {
        let (evaluator, store, clock) = evaluator().await;
        let key = ResourceKey::challenge(3);
        seed(&store, key, NOW, true).await;

        clock.advance(THRESHOLD);
        assert!(!evaluator.is_stale(key).await.unwrap().stale);
        clock.advance(Duration::from_millis(1));
        assert!(evaluator.is_stale(key).await.unwrap().stale);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_resource_is_never_stale() {
        let (evaluator, store, _) = evaluator().await;
        let key = ResourceKey::challenge(4);
        seed(&store, key, NOW - 30 * 24 * 3_600 * 1_000, false).await;

        let staleness = evaluator.is_stale(key).await.unwrap();
        assert!(!staleness.stale);
        assert!(!staleness.is_active);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_mark_answers_from_cache() {
        let (evaluator, store, _) = evaluator().await;
        let key = ResourceKey::challenge(5);
        evaluator.mark_fresh(key, NOW, true).await.unwrap();

        let staleness = evaluator.is_stale(key).await.unwrap();
        assert!(!staleness.stale);
        assert_eq!(staleness.source, FreshnessSource::Cache);
        assert_eq!(store.read_freshness(&key).await.unwrap().unwrap().last_updated, NOW);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_wins_over_outdated_cache() {
        let (evaluator, store, _) = evaluator().await;
        let key = ResourceKey::challenge(6);
        evaluator.cache().remember(key, NOW - 60 * 60 * 1_000);
        seed(&store, key, NOW - 1_000, true).await;

        let staleness = evaluator.is_stale(key).await.unwrap();
        assert!(!staleness.stale);
        assert_eq!(staleness.source, FreshnessSource::Store);
        assert_eq!(evaluator.cache().get(&key), Some(NOW - 1_000));
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let cache = FreshnessCache::new(2);
        cache.remember(ResourceKey::challenge(1), 1);
        cache.remember(ResourceKey::challenge(2), 2);
        assert_eq!(cache.get(&ResourceKey::challenge(1)), Some(1));
        cache.remember(ResourceKey::challenge(3), 3);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&ResourceKey::challenge(2)), None);
        assert_eq!(cache.get(&ResourceKey::challenge(1)), Some(1));
    }

    #[test]
    fn cache_keeps_newest_timestamp() {
        let cache = FreshnessCache::new(4);
        cache.remember(ResourceKey::challenge(1), 10);
        cache.remember(ResourceKey::challenge(1), 5);
        assert_eq!(cache.get(&ResourceKey::challenge(1)), Some(10));
    }

    #[test]
    fn cache_survives_save_and_load() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("cache").join("freshness.json");

        let cache = FreshnessCache::new(4);
        cache.remember(ResourceKey::challenge(1), 10);
        cache.remember(ResourceKey::new(crate::models::ResourceKind::Room, 2), 20);
        assert_eq!(cache.save(&path).unwrap(), 2);

        let restored = FreshnessCache::new(4);
        assert_eq!(restored.load(&path).unwrap(), 2);
        assert_eq!(restored.get(&ResourceKey::challenge(1)), Some(10));

        let missing = FreshnessCache::new(4);
        assert_eq!(missing.load(&tmp.path().join("absent.json")).unwrap(), 0);
        assert!(missing.is_empty());
    }
}
