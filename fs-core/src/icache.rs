//! Inode attribute cache
//!
//! A small LRU of recently read inode attributes. One cache may be shared by a
//! handle and its duplicates; clones never inherit it because a cache built
//! from the origin's view would go stale against the clone's private bitmaps.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Minimum capacity used when a zero capacity is configured
const MIN_CAPACITY: usize = 1;

/// Cached attributes of one inode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedInode {
    /// File mode
    pub mode: u16,
    /// Hard link count
    pub links_count: u16,
    /// File size in bytes
    pub size: u64,
    /// Inode flags
    pub flags: u32,
}

/// Shared inode attribute cache
pub struct InodeCache {
    entries: Mutex<LruCache<u32, CachedInode>>,
    capacity: usize,
}

impl InodeCache {
    /// Create a cache holding at most `capacity` inodes
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(MIN_CAPACITY);
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity,
        }
    }

    /// Cache attributes for `ino`, evicting the least recently used entry if full
    pub fn insert(&self, ino: u32, inode: CachedInode) {
        if let Some((evicted, _)) = self.entries.lock().push(ino, inode) {
            if evicted != ino {
                log::trace!("ICACHE: evicted inode {}", evicted);
            }
        }
    }

    /// Look up `ino`
    pub fn get(&self, ino: u32) -> Option<CachedInode> {
        self.entries.lock().get(&ino).copied()
    }

    /// Drop `ino` from the cache
    pub fn invalidate(&self, ino: u32) -> Option<CachedInode> {
        self.entries.lock().pop(&ino)
    }

    /// Number of cached inodes
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of cached inodes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl std::fmt::Debug for InodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(size: u64) -> CachedInode {
        CachedInode {
            mode: 0o100644,
            links_count: 1,
            size,
            flags: 0,
        }
    }

    #[test]
    fn test_lru_eviction() {
        let cache = InodeCache::new(2);
        cache.insert(11, attrs(1));
        cache.insert(12, attrs(2));

        // Touch 11 so 12 becomes the eviction candidate
        assert_eq!(cache.get(11), Some(attrs(1)));
        cache.insert(13, attrs(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.get(12).is_none());
        assert_eq!(cache.get(13), Some(attrs(3)));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = InodeCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.insert(2, attrs(0));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate(2), Some(attrs(0)));
        assert!(cache.is_empty());
    }
}
