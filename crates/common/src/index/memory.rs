use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use super::{Index, IndexError, IndexedMeta};
use crate::content::{ChunkHash, PathId, PathRevision, SignedMeta};

/// In-memory index using HashMaps
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    inner: Arc<RwLock<MemoryIndexInner>>,
}

#[derive(Debug, Default)]
struct MemoryIndexInner {
    /// path_id -> newest known meta
    metas: HashMap<PathId, IndexedMeta>,
    /// ct_hash -> paths whose current meta references it
    chunk_index: HashMap<ChunkHash, HashSet<PathId>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryIndexInner {
    fn unlink_chunks(&mut self, path_id: &PathId) {
        let Some(old) = self.metas.get(path_id) else {
            return;
        };
        let hashes: Vec<ChunkHash> = old.meta().chunks.iter().map(|c| c.ct_hash).collect();
        for hash in hashes {
            if let Some(paths) = self.chunk_index.get_mut(&hash) {
                paths.remove(path_id);
                if paths.is_empty() {
                    self.chunk_index.remove(&hash);
                }
            }
        }
    }
}

impl Index for MemoryIndex {
    fn put_meta(&self, signed: SignedMeta, assembled: bool) -> Result<bool, IndexError> {
        let mut inner = self.inner.write();
        let path_id = signed.meta().path_id;

        if let Some(existing) = inner.metas.get(&path_id) {
            if existing.meta().revision >= signed.meta().revision {
                return Ok(false);
            }
        }
        inner.unlink_chunks(&path_id);

        for chunk in &signed.meta().chunks {
            inner
                .chunk_index
                .entry(chunk.ct_hash)
                .or_default()
                .insert(path_id);
        }
        inner
            .metas
            .insert(path_id, IndexedMeta { signed, assembled });
        Ok(true)
    }

    fn get_meta(&self, path_id: &PathId) -> Result<Option<IndexedMeta>, IndexError> {
        Ok(self.inner.read().metas.get(path_id).cloned())
    }

    fn containing_chunk(&self, ct_hash: &ChunkHash) -> Result<Vec<IndexedMeta>, IndexError> {
        let inner = self.inner.read();
        Ok(inner
            .chunk_index
            .get(ct_hash)
            .map(|paths| {
                paths
                    .iter()
                    .filter_map(|p| inner.metas.get(p).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn set_assembled(&self, revision: &PathRevision) -> Result<bool, IndexError> {
        let mut inner = self.inner.write();
        match inner.metas.get_mut(&revision.path_id) {
            Some(entry) if entry.path_revision() == *revision => {
                entry.assembled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn unassembled(&self) -> Result<Vec<IndexedMeta>, IndexError> {
        Ok(self
            .inner
            .read()
            .metas
            .values()
            .filter(|m| !m.assembled)
            .cloned()
            .collect())
    }

    fn all_metas(&self) -> Result<Vec<IndexedMeta>, IndexError> {
        Ok(self.inner.read().metas.values().cloned().collect())
    }
}
