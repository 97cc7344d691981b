//! Short-TTL memoization of collector results keyed by
//! `(namespace, version)`. Entries survive pool churn but are invalidated
//! when the owning plugin is unloaded.

use oxtel_common::types::{Metric, PluginId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct CacheEntry {
    metrics: Vec<Metric>,
    owner: PluginId,
    stored: Instant,
}

pub struct MetricCache {
    ttl: Duration,
    entries: Mutex<HashMap<(String, u32), CacheEntry>>,
}

impl MetricCache {
    /// A zero TTL disables the cache entirely.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, namespace: &str, version: u32) -> Option<Vec<Metric>> {
        if self.ttl.is_zero() {
            return None;
        }
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let key = (namespace.to_string(), version);
        let expired = match guard.get(&key) {
            Some(entry) if entry.stored.elapsed() < self.ttl => {
                return Some(entry.metrics.clone())
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            guard.remove(&key);
        }
        None
    }

    pub fn put(&self, namespace: &str, version: u32, owner: &PluginId, metrics: Vec<Metric>) {
        if self.ttl.is_zero() {
            return;
        }
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        guard.insert(
            (namespace.to_string(), version),
            CacheEntry {
                metrics,
                owner: owner.clone(),
                stored: Instant::now(),
            },
        );
    }

    /// Drop every entry produced by the given plugin.
    pub fn invalidate_plugin(&self, owner: &PluginId) {
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        guard.retain(|_, entry| entry.owner != *owner);
    }

    /// Periodic sweep complementing the lazy eviction on access.
    pub fn sweep(&self) -> usize {
        let mut guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let before = guard.len();
        guard.retain(|_, entry| entry.stored.elapsed() < self.ttl);
        before - guard.len()
    }

    pub fn len(&self) -> usize {
        let guard = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        guard.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxtel_common::types::PluginType;

    fn metric(ns: &str) -> Metric {
        Metric {
            namespace: ns.to_string(),
            version: 1,
            data: serde_json::json!(1),
            tags: Default::default(),
            unit: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn owner() -> PluginId {
        PluginId::new(PluginType::Collector, "mock", 1)
    }

    #[test]
    fn hit_within_ttl_miss_after() {
        let cache = MetricCache::new(Duration::from_millis(40));
        cache.put("/intel/mock/foo", 1, &owner(), vec![metric("/intel/mock/foo")]);
        assert!(cache.get("/intel/mock/foo", 1).is_some());
        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get("/intel/mock/foo", 1).is_none());
        assert!(cache.is_empty(), "lazy eviction removes the stale entry");
    }

    #[test]
    fn zero_ttl_disables_the_cache() {
        let cache = MetricCache::new(Duration::ZERO);
        cache.put("/intel/mock/foo", 1, &owner(), vec![metric("/intel/mock/foo")]);
        assert!(cache.get("/intel/mock/foo", 1).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn versions_are_cached_independently() {
        let cache = MetricCache::new(Duration::from_secs(5));
        cache.put("/intel/mock/foo", 1, &owner(), vec![metric("/intel/mock/foo")]);
        assert!(cache.get("/intel/mock/foo", 1).is_some());
        assert!(cache.get("/intel/mock/foo", 2).is_none());
    }

    #[test]
    fn unload_invalidates_owned_entries() {
        let cache = MetricCache::new(Duration::from_secs(5));
        let other = PluginId::new(PluginType::Collector, "other", 1);
        cache.put("/intel/mock/foo", 1, &owner(), vec![metric("/intel/mock/foo")]);
        cache.put("/intel/other/bar", 1, &other, vec![metric("/intel/other/bar")]);

        cache.invalidate_plugin(&owner());
        assert!(cache.get("/intel/mock/foo", 1).is_none());
        assert!(cache.get("/intel/other/bar", 1).is_some());
    }

    #[test]
    fn sweep_reports_removed_entries() {
        let cache = MetricCache::new(Duration::from_millis(20));
        cache.put("/a/b", 1, &owner(), vec![metric("/a/b")]);
        cache.put("/a/c", 1, &owner(), vec![metric("/a/c")]);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.sweep(), 2);
    }
}
