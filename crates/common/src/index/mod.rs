//! The folder index
//!
//! Holds the newest known [`SignedMeta`] per path together with whether the
//! local filesystem reflects it yet. A real deployment backs this with a
//! persisted key-value store; [`MemoryIndex`] is the reference implementation.

mod memory;

pub use memory::MemoryIndex;

use crate::content::{ChunkHash, ChunkInfo, MetaInfo, PathId, PathRevision, SignedMeta};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("unhandled index error: {0}")]
    Default(#[from] anyhow::Error),
}

/// A meta as the index holds it
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedMeta {
    pub signed: SignedMeta,
    /// The plaintext entry on disk matches this revision
    pub assembled: bool,
}

impl IndexedMeta {
    pub fn meta(&self) -> &MetaInfo {
        self.signed.meta()
    }

    pub fn path_revision(&self) -> PathRevision {
        self.signed.path_revision()
    }
}

pub trait Index: Send + Sync + std::fmt::Debug + 'static {
    /// Store `signed` as the current meta of its path
    ///
    /// Returns `false` and changes nothing when the index already holds the
    /// same or a newer revision for the path.
    fn put_meta(&self, signed: SignedMeta, assembled: bool) -> Result<bool, IndexError>;

    fn get_meta(&self, path_id: &PathId) -> Result<Option<IndexedMeta>, IndexError>;

    /// The current meta, but only if it is exactly `revision`
    fn get_meta_at(&self, revision: &PathRevision) -> Result<Option<IndexedMeta>, IndexError> {
        Ok(self
            .get_meta(&revision.path_id)?
            .filter(|m| m.path_revision() == *revision))
    }

    /// Current metas whose chunk list contains `ct_hash`
    fn containing_chunk(&self, ct_hash: &ChunkHash) -> Result<Vec<IndexedMeta>, IndexError>;

    fn chunk_info(&self, ct_hash: &ChunkHash) -> Result<Option<ChunkInfo>, IndexError> {
        Ok(self.containing_chunk(ct_hash)?.into_iter().find_map(|m| {
            m.meta()
                .chunks
                .iter()
                .find(|c| c.ct_hash == *ct_hash)
                .cloned()
        }))
    }

    /// Flag `revision` as reflected on disk
    ///
    /// Returns `false` if the path has moved on to another revision meanwhile.
    fn set_assembled(&self, revision: &PathRevision) -> Result<bool, IndexError>;

    fn is_assembled(&self, revision: &PathRevision) -> Result<bool, IndexError> {
        Ok(self
            .get_meta_at(revision)?
            .map(|m| m.assembled)
            .unwrap_or(false))
    }

    fn unassembled(&self) -> Result<Vec<IndexedMeta>, IndexError>;

    fn all_metas(&self) -> Result<Vec<IndexedMeta>, IndexError>;
}
