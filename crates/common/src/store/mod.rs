//! # Chunk store
//!
//! Ciphertext by [`ChunkHash`], looked up through three tiers in order:
//!
//! 1. [`MemoryCache`]: LRU bounded by bytes, misses are normal
//! 2. [`EncryptedStorage`]: one blob per chunk on disk, authoritative
//! 3. [`OpenStorage`]: rebuilt from assembled plaintext (read-write folders)
//!
//! Hits from the lower tiers are promoted into the cache. Once a file has been
//! assembled and the derived tier reproduces every chunk of it, the disk
//! copies are dropped by [`ChunkStore::cleanup`].

mod cache;
mod derived;
mod disk;

pub use cache::MemoryCache;
pub use derived::OpenStorage;
pub use disk::EncryptedStorage;

use std::collections::HashSet;
use std::path::PathBuf;

use bytes::Bytes;

use crate::content::{ChunkHash, ContentError, Kind, MetaInfo};
use crate::index::IndexError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no such chunk: {0}")]
    NoSuchChunk(ChunkHash),
    #[error("data does not hash to {0}")]
    HashMismatch(ChunkHash),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("content error: {0}")]
    Content(#[from] ContentError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A chunk was newly written to the disk tier
    ChunkAdded(ChunkHash),
}

#[derive(Debug)]
pub struct ChunkStore {
    cache: MemoryCache,
    disk: EncryptedStorage,
    derived: Option<OpenStorage>,
    events: flume::Sender<StoreEvent>,
}

impl ChunkStore {
    /// Open the store rooted at `chunks_dir`
    ///
    /// Returns the store and the receiving end of its event channel.
    pub fn open(
        chunks_dir: impl Into<PathBuf>,
        cache_bytes: u64,
        derived: Option<OpenStorage>,
    ) -> Result<(Self, flume::Receiver<StoreEvent>), StoreError> {
        let (events, rx) = flume::unbounded();
        let store = Self {
            cache: MemoryCache::new(cache_bytes),
            disk: EncryptedStorage::open(chunks_dir)?,
            derived,
            events,
        };
        Ok((store, rx))
    }

    pub fn have_chunk(&self, ct_hash: &ChunkHash) -> bool {
        self.cache.contains(ct_hash)
            || self.disk.has(ct_hash)
            || self.derived.as_ref().is_some_and(|d| d.has(ct_hash))
    }

    pub fn get_chunk(&self, ct_hash: &ChunkHash) -> Result<Bytes, StoreError> {
        if let Some(data) = self.cache.get(ct_hash) {
            return Ok(data);
        }

        let data = match self.disk.get(ct_hash) {
            Ok(data) => data,
            Err(StoreError::NoSuchChunk(_)) => match &self.derived {
                Some(derived) => derived.get(ct_hash)?,
                None => return Err(StoreError::NoSuchChunk(*ct_hash)),
            },
            Err(e) => return Err(e),
        };
        self.cache.put(*ct_hash, data.clone());
        Ok(data)
    }

    /// Persist a complete ciphertext
    ///
    /// `data` must hash to `ct_hash`. Emits [`StoreEvent::ChunkAdded`] when the
    /// chunk was not stored before.
    pub fn put_chunk(&self, ct_hash: ChunkHash, data: Bytes) -> Result<(), StoreError> {
        if ChunkHash::of(&data) != ct_hash {
            return Err(StoreError::HashMismatch(ct_hash));
        }
        let added = self.disk.put(&ct_hash, &data)?;
        self.cache.put(ct_hash, data);
        if added {
            tracing::debug!("stored chunk {}", ct_hash);
            let _ = self.events.send(StoreEvent::ChunkAdded(ct_hash));
        }
        Ok(())
    }

    /// Drop disk copies of `meta`'s chunks that the derived tier reproduces
    ///
    /// Call only once `meta` is marked assembled. Returns how many blobs were
    /// removed.
    pub fn cleanup(&self, meta: &MetaInfo) -> Result<usize, StoreError> {
        let Some(derived) = &self.derived else {
            return Ok(0);
        };
        if meta.kind != Kind::File {
            return Ok(0);
        }

        let mut seen = HashSet::new();
        let mut removed = 0;
        for chunk in &meta.chunks {
            if !seen.insert(chunk.ct_hash) || !self.disk.has(&chunk.ct_hash) {
                continue;
            }
            match derived.get(&chunk.ct_hash) {
                Ok(_) => {
                    if self.disk.remove(&chunk.ct_hash)? {
                        removed += 1;
                    }
                }
                Err(StoreError::NoSuchChunk(_)) => {
                    tracing::debug!("keeping chunk {}, not derivable", chunk.ct_hash);
                }
                Err(e) => return Err(e),
            }
        }
        if removed > 0 {
            tracing::debug!("cleaned up {} chunk blobs", removed);
        }
        Ok(removed)
    }

    /// Chunks currently held by the disk tier
    pub fn stored_chunks(&self) -> Result<Vec<ChunkHash>, StoreError> {
        self.disk.list()
    }

    pub fn has_derived_tier(&self) -> bool {
        self.derived.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;

    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::content::{path_id, ChunkInfo, EncryptedData, SignedMeta};
    use crate::crypto::{generate_iv, FolderSecret};
    use crate::index::{Index, MemoryIndex};

    struct Fixture {
        root: TempDir,
        folder: FolderSecret,
        index: Arc<MemoryIndex>,
        store: ChunkStore,
        events: flume::Receiver<StoreEvent>,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let folder = FolderSecret::generate().unwrap();
        let index = Arc::new(MemoryIndex::new());
        let derived = OpenStorage::new(
            root.path(),
            folder.content_keys().unwrap(),
            index.clone(),
        );
        let (store, events) =
            ChunkStore::open(root.path().join(".cryptfold/chunks"), 1024, Some(derived)).unwrap();
        Fixture {
            root,
            folder,
            index,
            store,
            events,
        }
    }

    /// Write `parts` as one file and index it, returning the meta and ciphertexts
    fn assembled_file(fx: &Fixture, name: &str, parts: &[&[u8]]) -> (MetaInfo, Vec<Vec<u8>>) {
        let keys = fx.folder.content_keys().unwrap();
        let mut chunks = Vec::new();
        let mut ciphertexts = Vec::new();
        for part in parts {
            let (info, ct) = ChunkInfo::seal(part, &keys, generate_iv().unwrap()).unwrap();
            chunks.push(info);
            ciphertexts.push(ct);
        }
        std::fs::write(fx.root.path().join(name), parts.concat()).unwrap();
        let meta = MetaInfo {
            path_id: path_id(name, &keys.hash),
            revision: 1,
            kind: Kind::File,
            path: EncryptedData::seal(name.as_bytes(), &keys.path).unwrap(),
            symlink_target: None,
            mtime: 0,
            mtime_granularity: 1,
            unix: None,
            chunking: Some(ChunkerConfig::default()),
            chunks,
        };
        let signed = SignedMeta::sign(meta.clone(), fx.folder.signer().unwrap()).unwrap();
        fx.index.put_meta(signed, true).unwrap();
        (meta, ciphertexts)
    }

    #[test]
    fn test_put_get_promotes_and_notifies() {
        let fx = fixture();
        let data = Bytes::from_static(b"some ciphertext");
        let hash = ChunkHash::of(&data);

        assert!(!fx.store.have_chunk(&hash));
        assert!(matches!(
            fx.store.get_chunk(&hash),
            Err(StoreError::NoSuchChunk(_))
        ));

        fx.store.put_chunk(hash, data.clone()).unwrap();
        assert_eq!(fx.events.try_recv().unwrap(), StoreEvent::ChunkAdded(hash));
        fx.store.put_chunk(hash, data.clone()).unwrap();
        assert!(fx.events.try_recv().is_err(), "second put is not an addition");

        fx.store.cache.remove(&hash);
        assert_eq!(fx.store.get_chunk(&hash).unwrap(), data);
        assert!(fx.store.cache.contains(&hash));
    }

    #[test]
    fn test_put_rejects_wrong_hash() {
        let fx = fixture();
        let result = fx
            .store
            .put_chunk(ChunkHash::of(b"a"), Bytes::from_static(b"b"));
        assert!(matches!(result, Err(StoreError::HashMismatch(_))));
        assert!(fx.store.stored_chunks().unwrap().is_empty());
    }

    #[test]
    fn test_derived_tier_and_cleanup() {
        let fx = fixture();
        let (meta, ciphertexts) = assembled_file(&fx, "notes.txt", &[b"hello ", b"world"]);
        for (info, ct) in meta.chunks.iter().zip(&ciphertexts) {
            fx.store
                .put_chunk(info.ct_hash, Bytes::from(ct.clone()))
                .unwrap();
        }

        assert_eq!(fx.store.cleanup(&meta).unwrap(), 2);
        assert!(fx.store.stored_chunks().unwrap().is_empty());

        for (info, ct) in meta.chunks.iter().zip(&ciphertexts) {
            fx.store.cache.remove(&info.ct_hash);
            assert!(fx.store.have_chunk(&info.ct_hash));
            assert_eq!(fx.store.get_chunk(&info.ct_hash).unwrap().as_ref(), &ct[..]);
        }
    }

    #[test]
    fn test_derived_tier_rejects_stale_file() {
        let fx = fixture();
        let (meta, ciphertexts) = assembled_file(&fx, "doc.txt", &[b"abcdef"]);
        let hash = meta.chunks[0].ct_hash;
        fx.store
            .put_chunk(hash, Bytes::from(ciphertexts[0].clone()))
            .unwrap();

        // same size, different bytes
        std::fs::write(fx.root.path().join("doc.txt"), b"abcdeF").unwrap();
        assert_eq!(fx.store.cleanup(&meta).unwrap(), 0);
        assert!(fx.store.stored_chunks().unwrap().contains(&hash));

        fx.store.disk.remove(&hash).unwrap();
        fx.store.cache.remove(&hash);
        assert!(!fx.store.have_chunk(&hash));
        assert!(matches!(
            fx.store.get_chunk(&hash),
            Err(StoreError::NoSuchChunk(_))
        ));

        std::fs::write(fx.root.path().join("doc.txt"), b"abc").unwrap();
        assert!(!fx.store.have_chunk(&hash));
    }

    #[test]
    fn test_edited_file_no_longer_provides_shared_chunk() {
        let fx = fixture();
        let (meta, ciphertexts) = assembled_file(&fx, "a.txt", &[b"shared", b" tail"]);
        let shared = meta.chunks[0].ct_hash;
        assert!(fx.store.have_chunk(&shared));

        // rewritten in place to the same length
        std::fs::write(fx.root.path().join("a.txt"), b"SHARED tail").unwrap();
        assert!(!fx.store.have_chunk(&shared));
        assert!(fx.store.get_chunk(&shared).is_err());

        // a downloaded copy makes it available again
        fx.store
            .put_chunk(shared, Bytes::from(ciphertexts[0].clone()))
            .unwrap();
        assert!(fx.store.have_chunk(&shared));
        assert_eq!(fx.store.get_chunk(&shared).unwrap().as_ref(), &ciphertexts[0][..]);
    }
}
