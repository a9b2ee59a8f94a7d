//! Read-back cache of committed payload blobs.
//!
//! Entries are whole objects keyed by content id (never partial), and
//! eviction is driven purely by total bytes against the configured
//! capacity. The cache is populated on commit (the bytes are already in
//! hand) and on read misses.

use std::sync::Arc;

use moka::sync::Cache;

use crate::store::ContentId;

/// Byte-capped blob cache.
pub struct ReadCache {
    cache: Cache<ContentId, Arc<Vec<u8>>>,
    capacity: u64,
}

impl ReadCache {
    pub fn new(capacity: u64) -> ReadCache {
        let cache = Cache::builder()
            .weigher(|_key: &ContentId, value: &Arc<Vec<u8>>| {
                value.len().min(u32::MAX as usize) as u32
            })
            .max_capacity(capacity)
            .build();
        ReadCache { cache, capacity }
    }

    /// Inserts a blob if it fits the cache at all; oversized blobs are
    /// never cached.
    pub fn insert(&self, key: ContentId, bytes: Arc<Vec<u8>>) {
        if bytes.len() as u64 <= self.capacity {
            self.cache.insert(key, bytes);
        }
    }

    pub fn get(&self, key: &ContentId) -> Option<Arc<Vec<u8>>> {
        self.cache.get(key)
    }

    /// Drops a blob (its content key was deleted).
    pub fn invalidate(&self, key: &ContentId) {
        self.cache.invalidate(key);
    }

    /// Approximate resident bytes (test observability).
    pub fn weighted_size(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_blobs_are_not_cached() {
        let cache = ReadCache::new(8);
        let key = ContentId::fresh("/export");
        cache.insert(key.clone(), Arc::new(vec![0u8; 64]));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn eviction_is_byte_capped() {
        let cache = ReadCache::new(16);
        let a = ContentId::fresh("/export");
        let b = ContentId::fresh("/export");
        let c = ContentId::fresh("/export");
        cache.insert(a.clone(), Arc::new(vec![1u8; 8]));
        cache.insert(b.clone(), Arc::new(vec![2u8; 8]));
        cache.insert(c.clone(), Arc::new(vec![3u8; 8]));
        assert!(cache.weighted_size() <= 16);
    }

    #[test]
    fn invalidate_drops_entry() {
        let cache = ReadCache::new(1024);
        let key = ContentId::fresh("/export");
        cache.insert(key.clone(), Arc::new(b"data".to_vec()));
        assert!(cache.get(&key).is_some());
        cache.invalidate(&key);
        cache.weighted_size();
        assert!(cache.get(&key).is_none());
    }
}
