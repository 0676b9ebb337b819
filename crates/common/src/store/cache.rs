use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::content::ChunkHash;

/// Ciphertext cache bounded by total bytes held
///
/// Entries larger than the whole budget are never cached.
#[derive(Debug)]
pub struct MemoryCache {
    capacity: u64,
    inner: Mutex<CacheInner>,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<ChunkHash, Bytes>,
    size: u64,
}

impl MemoryCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                size: 0,
            }),
        }
    }

    /// Look up and mark as most recently used
    pub fn get(&self, ct_hash: &ChunkHash) -> Option<Bytes> {
        self.inner.lock().entries.get(ct_hash).cloned()
    }

    pub fn contains(&self, ct_hash: &ChunkHash) -> bool {
        self.inner.lock().entries.contains(ct_hash)
    }

    pub fn put(&self, ct_hash: ChunkHash, data: Bytes) {
        let len = data.len() as u64;
        if len > self.capacity {
            return;
        }
        let mut inner = self.inner.lock();
        if let Some((_, old)) = inner.entries.push(ct_hash, data) {
            inner.size -= old.len() as u64;
        }
        inner.size += len;
        while inner.size > self.capacity {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.size -= evicted.len() as u64,
                None => break,
            }
        }
    }

    pub fn remove(&self, ct_hash: &ChunkHash) {
        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.pop(ct_hash) {
            inner.size -= old.len() as u64;
        }
    }

    /// Bytes currently held
    pub fn size(&self) -> u64 {
        self.inner.lock().size
    }
}
