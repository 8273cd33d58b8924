//! Per-searcher caches and autowarming.

use crate::error::Result;
use crate::searcher::reader::SnapshotReader;
use crate::types::CacheStats;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Recomputes a cache entry against a new snapshot during warm-up.
///
/// `old` is the entry from the retiring searcher. Returning `Ok(None)` skips
/// the key (no longer computable); errors are logged per-key and swallowed —
/// a failed regeneration only means that key stays cold.
pub trait CacheRegenerator: Send + Sync {
    fn regenerate(
        &self,
        reader: &dyn SnapshotReader,
        key: &str,
        old: &Arc<Value>,
    ) -> Result<Option<Arc<Value>>>;
}

/// Describes one cache every new searcher is built with.
#[derive(Clone)]
pub struct CacheSpec {
    pub name: String,
    pub capacity: usize,
    pub autowarm_count: usize,
    pub regenerator: Option<Arc<dyn CacheRegenerator>>,
}

impl CacheSpec {
    pub fn new(name: impl Into<String>, capacity: usize, autowarm_count: usize) -> Self {
        CacheSpec {
            name: name.into(),
            capacity,
            autowarm_count,
            regenerator: None,
        }
    }

    pub fn with_regenerator(mut self, regenerator: Arc<dyn CacheRegenerator>) -> Self {
        self.regenerator = Some(regenerator);
        self
    }
}

/// A capped, concurrently accessible cache owned by one searcher.
///
/// Entries live exactly as long as the searcher; there is no TTL. When the
/// cache is full an arbitrary entry is evicted to make room. Insertion order
/// is tracked most-recent-first so a successor searcher can replay the
/// hottest keys during warm-up.
pub struct QueryCache {
    name: String,
    map: DashMap<String, Arc<Value>>,
    capacity: usize,
    autowarm_count: usize,
    recent: Mutex<VecDeque<String>>,
    regenerator: Option<Arc<dyn CacheRegenerator>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    warmed: AtomicU64,
    // suppressed until the owning searcher registers, so half-warmed caches
    // don't skew hit rates
    live: AtomicUsize,
}

impl QueryCache {
    pub fn from_spec(spec: &CacheSpec) -> Self {
        QueryCache {
            name: spec.name.clone(),
            map: DashMap::new(),
            capacity: spec.capacity.max(1),
            autowarm_count: spec.autowarm_count,
            recent: Mutex::new(VecDeque::new()),
            regenerator: spec.regenerator.clone(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            warmed: AtomicU64::new(0),
            live: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<Arc<Value>> {
        match self.map.get(key) {
            Some(entry) => {
                if self.live.load(Ordering::Relaxed) > 0 {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                }
                Some(Arc::clone(&entry))
            }
            None => {
                if self.live.load(Ordering::Relaxed) > 0 {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: Arc<Value>) {
        let key = key.into();
        if self.map.len() >= self.capacity && !self.map.contains_key(&key) {
            // select the victim in its own statement: the iterator's shard
            // read guard must be dropped before `remove` takes the write lock
            let evict_key = self.map.iter().next().map(|e| e.key().clone());
            if let Some(evict_key) = evict_key {
                self.map.remove(&evict_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.map.insert(key.clone(), value);

        let mut recent = self.recent.lock().unwrap();
        recent.retain(|k| k != &key);
        recent.push_front(key);
        // keep only as much history as warm-up can use
        let keep = self.autowarm_count.max(1) * 2;
        recent.truncate(keep);
    }

    pub(crate) fn mark_live(&self) {
        self.live.store(1, Ordering::Relaxed);
    }

    /// Replay the most recent entries of `prior` against `reader`.
    ///
    /// Returns how many entries were regenerated. Per-key failures are
    /// logged and skipped. A cache without a regenerator warms nothing.
    pub fn warm_from(&self, prior: &QueryCache, reader: &dyn SnapshotReader) -> Result<usize> {
        let Some(regenerator) = &self.regenerator else {
            return Ok(0);
        };
        let keys: Vec<String> = {
            let recent = prior.recent.lock().unwrap();
            recent.iter().take(self.autowarm_count).cloned().collect()
        };

        let mut warmed = 0usize;
        for key in keys {
            let Some(old) = prior.map.get(&key).map(|e| Arc::clone(&e)) else {
                continue;
            };
            match regenerator.regenerate(reader, &key, &old) {
                Ok(Some(value)) => {
                    self.insert(key, value);
                    warmed += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(cache = %self.name, key = %key, "autowarm regenerate failed: {}", e);
                }
            }
        }
        self.warmed.fetch_add(warmed as u64, Ordering::Relaxed);
        Ok(warmed)
    }

    pub fn clear(&self) {
        self.map.clear();
        self.recent.lock().unwrap().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            name: self.name.clone(),
            size: self.map.len(),
            capacity: self.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            warmed_entries: self.warmed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::searcher::reader::ReaderFactory;
    use serde_json::json;

    struct GenTag;

    impl CacheRegenerator for GenTag {
        fn regenerate(
            &self,
            reader: &dyn SnapshotReader,
            _key: &str,
            _old: &Arc<Value>,
        ) -> Result<Option<Arc<Value>>> {
            Ok(Some(Arc::new(json!({ "gen": reader.generation() }))))
        }
    }

    fn spec_with_regen(capacity: usize, autowarm: usize) -> CacheSpec {
        CacheSpec::new("results", capacity, autowarm).with_regenerator(Arc::new(GenTag))
    }

    #[test]
    fn insert_get_and_eviction_cap() {
        let cache = QueryCache::from_spec(&CacheSpec::new("results", 2, 8));
        cache.insert("a", Arc::new(json!(1)));
        cache.insert("b", Arc::new(json!(2)));
        cache.insert("c", Arc::new(json!(3)));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn stats_suppressed_until_live() {
        let cache = QueryCache::from_spec(&CacheSpec::new("results", 8, 8));
        cache.insert("a", Arc::new(json!(1)));
        cache.get("a");
        cache.get("missing");
        assert_eq!(cache.stats().hits, 0);
        assert_eq!(cache.stats().misses, 0);

        cache.mark_live();
        cache.get("a");
        cache.get("missing");
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn warm_replays_most_recent_first_up_to_autowarm_count() {
        let factory = crate::searcher::reader::GenerationFactory::new();
        let old_cache = QueryCache::from_spec(&spec_with_regen(8, 2));
        for key in ["q1", "q2", "q3", "q4"] {
            old_cache.insert(key, Arc::new(json!({ "gen": 0 })));
        }

        factory.bump();
        let reader = factory.open_fresh(false).unwrap();
        let new_cache = QueryCache::from_spec(&spec_with_regen(8, 2));
        let warmed = new_cache.warm_from(&old_cache, reader.as_ref()).unwrap();

        assert_eq!(warmed, 2);
        // the two most recent keys, recomputed against the new generation
        assert_eq!(new_cache.get("q4").unwrap()["gen"], 1);
        assert_eq!(new_cache.get("q3").unwrap()["gen"], 1);
        assert!(new_cache.get("q1").is_none());
    }

    #[test]
    fn warm_without_regenerator_is_a_noop() {
        let factory = crate::searcher::reader::GenerationFactory::new();
        let old_cache = QueryCache::from_spec(&CacheSpec::new("results", 8, 4));
        old_cache.insert("q1", Arc::new(json!(1)));
        let reader = factory.open_fresh(false).unwrap();

        let new_cache = QueryCache::from_spec(&CacheSpec::new("results", 8, 4));
        assert_eq!(new_cache.warm_from(&old_cache, reader.as_ref()).unwrap(), 0);
        assert!(new_cache.is_empty());
    }
}
