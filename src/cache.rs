//! Breakdown Cache (§4.I): content-addressed store of decomposition
//! outputs with TTL + LRU eviction + on-completion purge. Grounded on
//! `collective_worker_processor.py`'s `worker_cache` / `_cache_breakdown`
//! / `_is_cache_valid` / `_clear_oldest_cache` / `_clear_todo_cache`.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::MicroTask;

#[derive(Clone, Serialize)]
struct CacheFields<'a> {
    id: &'a str,
    name: &'a str,
    description: &'a str,
    estimated_hours: f64,
    complexity: &'a str,
}

/// Computes `sha256(stable_json({id, name, description, estimated_hours,
/// complexity}))` (§4.I). `serde_json` serializes struct fields in
/// declaration order, which is what "stable" means here — the input
/// shape is fixed, not a map with nondeterministic key order.
pub fn cache_key(id: &str, name: &str, description: &str, estimated_hours: f64, complexity: &str) -> String {
    let fields = CacheFields {
        id,
        name,
        description,
        estimated_hours,
        complexity,
    };
    let json = serde_json::to_string(&fields).expect("CacheFields always serializes");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
struct CacheEntry {
    micro_tasks: Vec<MicroTask>,
    parent_id: String,
    created_at: DateTime<Utc>,
    access_count: u64,
}

/// Aggregate counters mirroring the original's `cache_stats` dict,
/// exposed on the metrics snapshot (SPEC_FULL.md §1).
#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub clears: u64,
    pub size: usize,
}

pub struct BreakdownCache {
    entries: DashMap<String, CacheEntry>,
    ttl_seconds: i64,
    max_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    clears: AtomicU64,
}

impl BreakdownCache {
    pub fn new(ttl_seconds: i64, max_size: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_seconds,
            max_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            clears: AtomicU64::new(0),
        }
    }

    fn is_valid(&self, entry: &CacheEntry) -> bool {
        (Utc::now() - entry.created_at).num_seconds() < self.ttl_seconds
    }

    /// Returns the cached MicroTask list on a fresh hit, incrementing
    /// the hit/miss counters. Expired entries are removed and counted
    /// as a miss.
    pub fn get(&self, key: &str) -> Option<Vec<MicroTask>> {
        let mut expired = false;
        let result = match self.entries.get_mut(key) {
            Some(mut entry) if self.is_valid(&entry) => {
                entry.access_count += 1;
                Some(entry.micro_tasks.clone())
            }
            Some(_) => {
                expired = true;
                None
            }
            None => None,
        };
        if expired {
            self.entries.remove(key);
        }
        if result.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Stores a freshly computed breakdown under `key`, evicting the
    /// oldest entry first if the cache is at capacity (LRU-by-creation,
    /// matching `_clear_oldest_cache`).
    pub fn put(&self, key: String, parent_id: String, micro_tasks: Vec<MicroTask>) {
        if self.entries.len() >= self.max_size && !self.entries.contains_key(&key) {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                micro_tasks,
                parent_id,
                created_at: Utc::now(),
                access_count: 0,
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest_key = self
            .entries
            .iter()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest_key {
            self.entries.remove(&key);
        }
    }

    /// Purges every entry belonging to `parent_id` once that parent
    /// reaches `completed` (§3 invariant 5, §4.C).
    pub fn purge_parent(&self, parent_id: &str) -> usize {
        let to_remove: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.parent_id == parent_id)
            .map(|entry| entry.key().clone())
            .collect();
        let n = to_remove.len();
        for key in to_remove {
            self.entries.remove(&key);
        }
        if n > 0 {
            self.clears.fetch_add(1, Ordering::Relaxed);
        }
        n
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn sample_task(id: &str, parent: &str) -> MicroTask {
        MicroTask {
            task_id: id.to_string(),
            parent_id: parent.to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            estimated_minutes: 30,
            required_capabilities: HashSet::new(),
            complexity_score: 5,
            status: crate::types::WorkStatus::Pending,
        }
    }

    #[test]
    fn miss_then_hit() {
        let cache = BreakdownCache::new(3600, 10);
        let key = cache_key("x", "n", "d", 2.0, "medium");
        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), "x".to_string(), vec![sample_task("m1", "x")]);
        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.len(), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entry_counts_as_miss() {
        let cache = BreakdownCache::new(-1, 10); // already expired on arrival
        let key = cache_key("x", "n", "d", 2.0, "medium");
        cache.put(key.clone(), "x".to_string(), vec![sample_task("m1", "x")]);
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn purge_parent_removes_matching_entries_only() {
        let cache = BreakdownCache::new(3600, 10);
        cache.put("k1".to_string(), "p1".to_string(), vec![sample_task("m1", "p1")]);
        cache.put("k2".to_string(), "p2".to_string(), vec![sample_task("m2", "p2")]);
        let removed = cache.purge_parent("p1");
        assert_eq!(removed, 1);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache = BreakdownCache::new(3600, 1);
        cache.put("k1".to_string(), "p1".to_string(), vec![sample_task("m1", "p1")]);
        cache.put("k2".to_string(), "p2".to_string(), vec![sample_task("m2", "p2")]);
        assert_eq!(cache.stats().size, 1);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_some());
    }

    #[test]
    fn same_fields_produce_same_key() {
        let a = cache_key("x", "n", "d", 2.0, "medium");
        let b = cache_key("x", "n", "d", 2.0, "medium");
        assert_eq!(a, b);
        let c = cache_key("x", "n", "d", 2.5, "medium");
        assert_ne!(a, c);
    }
}
