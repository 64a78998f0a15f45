//! Concurrent node coordinate cache
//!
//! A way's nodes may have been created in an earlier replication file, so
//! node coordinates are cached across files, whether or not the node itself
//! is in scope. The cache is lock-striped: readers share a shard lock,
//! writers hold it only for the duration of a single insert.

use geo_types::Point;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Default number of lock stripes
const DEFAULT_SHARDS: usize = 16;

/// Default entry lifetime; must cover the replication window between a
/// node's creation and the last way that references it
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct CacheEntry {
    point: Point<f64>,
    inserted: Instant,
}

/// Process-wide mapping from node id to WGS-84 coordinates
pub struct NodeCache {
    shards: Vec<RwLock<HashMap<i64, CacheEntry>>>,
    ttl: Duration,
}

impl NodeCache {
    /// Create a cache with the default TTL (24 h)
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Create a cache with an explicit entry lifetime
    pub fn with_ttl(ttl: Duration) -> Self {
        let shards = (0..DEFAULT_SHARDS)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { shards, ttl }
    }

    fn shard(&self, id: i64) -> &RwLock<HashMap<i64, CacheEntry>> {
        &self.shards[(id.unsigned_abs() as usize) % self.shards.len()]
    }

    /// Insert or refresh a node location
    pub fn insert(&self, id: i64, point: Point<f64>) {
        let mut shard = self.shard(id).write().expect("node cache lock poisoned");
        match shard.entry(id) {
            Entry::Occupied(mut e) => {
                let entry = e.get_mut();
                entry.point = point;
                entry.inserted = Instant::now();
            }
            Entry::Vacant(e) => {
                e.insert(CacheEntry {
                    point,
                    inserted: Instant::now(),
                });
            }
        }
    }

    /// Look up a node location
    pub fn get(&self, id: i64) -> Option<Point<f64>> {
        let shard = self.shard(id).read().expect("node cache lock poisoned");
        shard.get(&id).map(|e| e.point)
    }

    /// Resolve a sequence of refs; `None` for every unresolved id
    pub fn resolve(&self, refs: &[i64]) -> Vec<Option<Point<f64>>> {
        refs.iter().map(|&id| self.get(id)).collect()
    }

    /// Drop entries older than the TTL; returns the number evicted
    pub fn prune(&self) -> usize {
        let mut evicted = 0;
        for shard in &self.shards {
            let mut shard = shard.write().expect("node cache lock poisoned");
            let before = shard.len();
            shard.retain(|_, e| e.inserted.elapsed() < self.ttl);
            evicted += before - shard.len();
        }
        evicted
    }

    /// Number of cached nodes
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().expect("node cache lock poisoned").len())
            .sum()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_insert_and_get() {
        let cache = NodeCache::new();
        cache.insert(101, Point::new(21.726, 4.620));
        assert_eq!(cache.get(101), Some(Point::new(21.726, 4.620)));
        assert_eq!(cache.get(102), None);
    }

    #[test]
    fn test_insert_refreshes() {
        let cache = NodeCache::new();
        cache.insert(7, Point::new(1.0, 1.0));
        cache.insert(7, Point::new(2.0, 2.0));
        assert_eq!(cache.get(7), Some(Point::new(2.0, 2.0)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_resolve_mixed() {
        let cache = NodeCache::new();
        cache.insert(1, Point::new(1.0, 1.0));
        cache.insert(3, Point::new(3.0, 3.0));
        let resolved = cache.resolve(&[1, 2, 3]);
        assert_eq!(resolved[0], Some(Point::new(1.0, 1.0)));
        assert_eq!(resolved[1], None);
        assert_eq!(resolved[2], Some(Point::new(3.0, 3.0)));
    }

    #[test]
    fn test_prune_expired() {
        let cache = NodeCache::with_ttl(Duration::from_millis(0));
        cache.insert(1, Point::new(1.0, 1.0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.prune(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let cache = Arc::new(NodeCache::new());
        let mut handles = Vec::new();
        for t in 0..4i64 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..250i64 {
                    let id = t * 1000 + i;
                    cache.insert(id, Point::new(id as f64, -(id as f64)));
                    assert!(cache.get(id).is_some());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 1000);
    }
}
