//! TTL memoization for analysis results.
//!
//! Entries are keyed by analysis type, window and the store generation, so a
//! write to the store makes older entries unreachable; they are pruned once
//! their TTL passes. There is no background refresh.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Default time-to-live for memoized analyses.
pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub analysis: &'static str,
    pub window: i64,
    pub generation: u64,
    /// Extra discriminator for analyses with a tuning parameter.
    pub param: u64,
}

impl CacheKey {
    pub fn new(analysis: &'static str, window: i64, generation: u64) -> Self {
        Self {
            analysis,
            window,
            generation,
            param: 0,
        }
    }

    pub fn with_param(mut self, param: u64) -> Self {
        self.param = param;
        self
    }
}

struct CacheEntry {
    inserted: Instant,
    value: Arc<dyn Any + Send + Sync>,
}

pub struct AnalysisCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl AnalysisCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the cached value for `key` or compute, store and return it.
    /// Failed computations are not cached.
    pub fn get_or_try_insert<T, E, F>(&self, key: CacheKey, compute: F) -> Result<T, E>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(hit) = self.get::<T>(&key) {
            tracing::trace!(analysis = key.analysis, window = key.window, "analysis cache hit");
            return Ok(hit);
        }

        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self, key: &CacheKey) -> Option<T> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get(key)?;
        if entry.inserted.elapsed() >= self.ttl {
            return None;
        }
        entry.value.downcast_ref::<T>().cloned()
    }

    pub fn insert<T: Send + Sync + 'static>(&self, key: CacheKey, value: T) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, e| e.inserted.elapsed() < ttl);
        entries.insert(
            key,
            CacheEntry {
                inserted: Instant::now(),
                value: Arc::new(value),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AnalysisCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_second_lookup_is_memoized() {
        let cache = AnalysisCache::default();
        let calls = Cell::new(0);
        let key = CacheKey::new("coverage", 30, 1);
        for _ in 0..3 {
            let v: Result<Vec<u32>, ()> = cache.get_or_try_insert(key.clone(), || {
                calls.set(calls.get() + 1);
                Ok(vec![1, 2, 3])
            });
            assert_eq!(v.unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_new_generation_misses() {
        let cache = AnalysisCache::default();
        cache.insert(CacheKey::new("coverage", 30, 1), 5u32);
        assert_eq!(cache.get::<u32>(&CacheKey::new("coverage", 30, 1)), Some(5));
        assert_eq!(cache.get::<u32>(&CacheKey::new("coverage", 30, 2)), None);
        assert_eq!(cache.get::<u32>(&CacheKey::new("coverage", 7, 1)), None);
        assert_eq!(cache.get::<u32>(&CacheKey::new("coverage", 30, 1).with_param(2)), None);
    }

    #[test]
    fn test_expired_entries_miss() {
        let cache = AnalysisCache::new(Duration::from_millis(0));
        cache.insert(CacheKey::new("x", 1, 0), 1u8);
        assert_eq!(cache.get::<u8>(&CacheKey::new("x", 1, 0)), None);
    }

    #[test]
    fn test_errors_are_not_cached() {
        let cache = AnalysisCache::default();
        let key = CacheKey::new("p", 7, 0);
        let r: Result<u8, &str> = cache.get_or_try_insert(key.clone(), || Err("boom"));
        assert!(r.is_err());
        assert!(cache.is_empty());
        let r: Result<u8, &str> = cache.get_or_try_insert(key, || Ok(9));
        assert_eq!(r, Ok(9));
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        let cache = AnalysisCache::default();
        let key = CacheKey::new("x", 1, 0);
        cache.insert(key.clone(), 1u8);
        assert_eq!(cache.get::<String>(&key), None);
    }
}
