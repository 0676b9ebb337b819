use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;

use super::StoreError;
use crate::content::{denormalize, ChunkHash, ChunkInfo, Kind};
use crate::crypto::ContentKeys;
use crate::index::{Index, IndexedMeta};

/// Re-derives ciphertext from assembled plaintext files
///
/// Every chunk of an assembled file can be rebuilt from the file and the
/// chunk's recorded IV, so the encrypted copy need not be kept. The file may
/// have changed since it was assembled; anything that no longer hashes to the
/// recorded values is treated as absent.
pub struct OpenStorage {
    root: PathBuf,
    keys: ContentKeys,
    index: Arc<dyn Index>,
}

impl std::fmt::Debug for OpenStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenStorage")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// Where a chunk lives inside an assembled file
struct Location {
    path: PathBuf,
    file_size: u64,
    offset: u64,
    info: ChunkInfo,
}

impl OpenStorage {
    pub fn new(root: impl Into<PathBuf>, keys: ContentKeys, index: Arc<dyn Index>) -> Self {
        Self {
            root: root.into(),
            keys,
            index,
        }
    }

    fn locations(&self, ct_hash: &ChunkHash) -> Result<Vec<Location>, StoreError> {
        let metas = self.index.containing_chunk(ct_hash)?;
        Ok(metas
            .iter()
            .filter(|m| m.assembled && m.meta().kind == Kind::File)
            .filter_map(|m| self.locate(m, ct_hash))
            .collect())
    }

    fn locate(&self, indexed: &IndexedMeta, ct_hash: &ChunkHash) -> Option<Location> {
        let meta = indexed.meta();
        let position = meta.chunks.iter().position(|c| c.ct_hash == *ct_hash)?;
        let relative = meta.decrypt_path(&self.keys.path).ok()?;
        let path = denormalize(&self.root, &relative).ok()?;
        Some(Location {
            path,
            file_size: meta.file_size(),
            offset: meta.chunk_offset(position),
            info: meta.chunks[position].clone(),
        })
    }

    /// An assembled file references the chunk and its bytes at the recorded
    /// offset still hash to the recorded plaintext keyed hash
    pub fn has(&self, ct_hash: &ChunkHash) -> bool {
        match self.locations(ct_hash) {
            Ok(locations) => locations.iter().any(|l| match self.plaintext(l) {
                Ok(plaintext) => l.info.matches_plaintext(&plaintext, &self.keys),
                Err(_) => false,
            }),
            Err(e) => {
                tracing::warn!("derived lookup of {} failed: {}", ct_hash, e);
                false
            }
        }
    }

    /// Read the plaintext back and re-encrypt it, verifying both hashes
    pub fn get(&self, ct_hash: &ChunkHash) -> Result<Bytes, StoreError> {
        for location in self.locations(ct_hash)? {
            match self.derive(&location) {
                Ok(ciphertext) => return Ok(Bytes::from(ciphertext)),
                Err(e) => {
                    tracing::warn!(
                        "cannot derive chunk {} from {}: {}",
                        ct_hash,
                        location.path.display(),
                        e
                    );
                }
            }
        }
        Err(StoreError::NoSuchChunk(*ct_hash))
    }

    fn derive(&self, location: &Location) -> Result<Vec<u8>, StoreError> {
        let plaintext = self.plaintext(location)?;
        Ok(location.info.reseal(&plaintext, &self.keys)?)
    }

    fn plaintext(&self, location: &Location) -> Result<Vec<u8>, StoreError> {
        let mut file = File::open(&location.path)?;
        let metadata = file.metadata()?;
        if !metadata.is_file() || metadata.len() != location.file_size {
            return Err(StoreError::NoSuchChunk(location.info.ct_hash));
        }
        file.seek(SeekFrom::Start(location.offset))?;
        let mut plaintext = vec![0; location.info.size as usize];
        file.read_exact(&mut plaintext)?;
        Ok(plaintext)
    }
}
