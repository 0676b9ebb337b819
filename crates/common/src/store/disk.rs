use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tempfile::NamedTempFile;

use super::StoreError;
use crate::content::ChunkHash;

/// Persistent ciphertext blobs, one file per chunk named by its hex hash
///
/// Writes land in a temp file in the same directory and are renamed into
/// place, so a blob is either absent or complete. Writers of the same chunk
/// take turns; readers never wait.
#[derive(Debug)]
pub struct EncryptedStorage {
    dir: PathBuf,
    writers: Mutex<HashMap<ChunkHash, Arc<Mutex<()>>>>,
}

impl EncryptedStorage {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            writers: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn blob_path(&self, ct_hash: &ChunkHash) -> PathBuf {
        self.dir.join(ct_hash.to_hex())
    }

    pub fn has(&self, ct_hash: &ChunkHash) -> bool {
        self.blob_path(ct_hash).is_file()
    }

    pub fn get(&self, ct_hash: &ChunkHash) -> Result<Bytes, StoreError> {
        match fs::read(self.blob_path(ct_hash)) {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NoSuchChunk(*ct_hash)),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `false` when the blob was already stored
    pub fn put(&self, ct_hash: &ChunkHash, data: &[u8]) -> Result<bool, StoreError> {
        self.with_writer(ct_hash, || {
            let path = self.blob_path(ct_hash);
            if path.is_file() {
                return Ok(false);
            }
            let mut temp = NamedTempFile::new_in(&self.dir)?;
            temp.write_all(data)?;
            temp.as_file().sync_all()?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(true)
        })
    }

    pub fn remove(&self, ct_hash: &ChunkHash) -> Result<bool, StoreError> {
        self.with_writer(ct_hash, || match fs::remove_file(self.blob_path(ct_hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
    }

    /// Hashes of every stored blob
    pub fn list(&self) -> Result<Vec<ChunkHash>, StoreError> {
        let mut hashes = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(hash) = entry
                .file_name()
                .to_str()
                .and_then(|name| ChunkHash::from_hex(name).ok())
            {
                hashes.push(hash);
            }
        }
        Ok(hashes)
    }

    fn with_writer<T>(
        &self,
        ct_hash: &ChunkHash,
        f: impl FnOnce() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let lock = self.writers.lock().entry(*ct_hash).or_default().clone();
        let result = {
            let _guard = lock.lock();
            f()
        };
        drop(lock);

        let mut writers = self.writers.lock();
        if writers
            .get(ct_hash)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            writers.remove(ct_hash);
        }
        result
    }
}
