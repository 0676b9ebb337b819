use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkerConfig;
use crate::crypto::{generate_iv, Iv, Secret, SecretError};

use super::chunk::{ChunkInfo, PathId};
use super::ContentError;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Identity of one version of one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathRevision {
    pub path_id: PathId,
    pub revision: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    File,
    Directory,
    Symlink,
    Deleted,
}

/// Bytes sealed under the path key with their own IV
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    pub iv: Iv,
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn seal(plaintext: &[u8], key: &Secret) -> Result<Self, SecretError> {
        let iv = generate_iv()?;
        let ciphertext = key.encrypt_with_iv(plaintext, &iv)?;
        Ok(Self { iv, ciphertext })
    }

    pub fn open(&self, key: &Secret) -> Result<Vec<u8>, SecretError> {
        key.decrypt_with_iv(&self.ciphertext, &self.iv)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnixAttrib {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Metadata of one revision of one path
///
/// Everything a peer needs to rebuild the entry: what it is, where it lives
/// (encrypted), when it was modified, and for files the ordered list of
/// chunks plus the chunking parameters that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub path_id: PathId,
    pub revision: u64,
    pub kind: Kind,
    pub path: EncryptedData,
    /// Set for symlinks only
    pub symlink_target: Option<EncryptedData>,
    /// Nanoseconds since the unix epoch
    pub mtime: i64,
    /// Coarsest timestamp resolution of the source filesystem, in nanoseconds
    pub mtime_granularity: u64,
    pub unix: Option<UnixAttrib>,
    /// Set for files only
    pub chunking: Option<ChunkerConfig>,
    pub chunks: Vec<ChunkInfo>,
}

impl MetaInfo {
    pub fn path_revision(&self) -> PathRevision {
        PathRevision {
            path_id: self.path_id,
            revision: self.revision,
        }
    }

    /// Plaintext size of the file (zero for anything else)
    pub fn file_size(&self) -> u64 {
        self.chunks.iter().map(|c| c.size as u64).sum()
    }

    /// Byte offset of chunk `index` inside the plaintext file
    pub fn chunk_offset(&self, index: usize) -> u64 {
        self.chunks[..index].iter().map(|c| c.size as u64).sum()
    }

    /// Check the structural invariants between kind and payload
    pub fn validate(&self) -> Result<(), ContentError> {
        if self.kind != Kind::File && !self.chunks.is_empty() {
            return Err(ContentError::Invalid(format!(
                "{:?} entry carries {} chunks",
                self.kind,
                self.chunks.len()
            )));
        }
        if self.kind == Kind::File && self.chunking.is_none() {
            return Err(ContentError::Invalid(
                "file entry without chunking parameters".into(),
            ));
        }
        if (self.kind == Kind::Symlink) != self.symlink_target.is_some() {
            return Err(ContentError::Invalid(
                "symlink target set on the wrong kind".into(),
            ));
        }
        if let Some(chunking) = &self.chunking {
            chunking
                .validate()
                .map_err(|e| ContentError::Invalid(e.to_string()))?;
            if let Some(chunk) = self.chunks.iter().find(|c| c.size > chunking.max_size) {
                return Err(ContentError::Invalid(format!(
                    "chunk {} larger than max_size {}",
                    chunk.ct_hash, chunking.max_size
                )));
            }
        }
        Ok(())
    }

    /// Decrypt the normalized relative path
    pub fn decrypt_path(&self, path_key: &Secret) -> Result<String, ContentError> {
        let bytes = self.path.open(path_key)?;
        String::from_utf8(bytes).map_err(|_| ContentError::Invalid("path is not utf-8".into()))
    }

    pub fn decrypt_symlink_target(&self, path_key: &Secret) -> Result<Option<String>, ContentError> {
        match &self.symlink_target {
            Some(target) => {
                let bytes = target.open(path_key)?;
                String::from_utf8(bytes)
                    .map(Some)
                    .map_err(|_| ContentError::Invalid("symlink target is not utf-8".into()))
            }
            None => Ok(None),
        }
    }

    /// Whether `mtime` is the same instant as ours, given timestamp resolution
    pub fn mtime_matches(&self, mtime: i64) -> bool {
        let tolerance = self.mtime_granularity.max(granularity_of(mtime)) as i64;
        (self.mtime - mtime).abs() < tolerance.max(1)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ContentError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ContentError> {
        let meta: Self = bincode::deserialize(bytes)?;
        meta.validate()?;
        Ok(meta)
    }
}

/// Guess the timestamp resolution from a timestamp.
///
/// Filesystems with whole-second timestamps (FAT, HFS+, some network mounts)
/// never report a sub-second part.
pub fn granularity_of(mtime: i64) -> u64 {
    if mtime % NANOS_PER_SEC == 0 {
        NANOS_PER_SEC as u64
    } else {
        1
    }
}

pub fn system_time_to_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

pub fn nanos_to_system_time(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ChunkHash;
    use crate::crypto::FolderSecret;

    fn base_meta(kind: Kind) -> MetaInfo {
        let keys = FolderSecret::generate().unwrap().content_keys().unwrap();
        MetaInfo {
            path_id: PathId::from_bytes([1; 32]),
            revision: 1,
            kind,
            path: EncryptedData::seal(b"dir/file.txt", &keys.path).unwrap(),
            symlink_target: None,
            mtime: 1_700_000_000_123_456_789,
            mtime_granularity: 1,
            unix: None,
            chunking: None,
            chunks: vec![],
        }
    }

    fn chunk(size: u32) -> ChunkInfo {
        ChunkInfo {
            ct_hash: ChunkHash::of(&size.to_le_bytes()),
            size,
            iv: [0; 12],
            pt_keyed_hash: [0; 32],
        }
    }

    #[test]
    fn test_file_size_and_offsets() {
        let mut meta = base_meta(Kind::File);
        meta.chunking = Some(ChunkerConfig::default());
        meta.chunks = vec![chunk(10), chunk(20), chunk(5)];
        assert!(meta.validate().is_ok());
        assert_eq!(meta.file_size(), 35);
        assert_eq!(meta.chunk_offset(0), 0);
        assert_eq!(meta.chunk_offset(2), 30);
    }

    #[test]
    fn test_chunks_only_on_files() {
        let mut meta = base_meta(Kind::Directory);
        meta.chunks = vec![chunk(1)];
        assert!(meta.validate().is_err());

        let meta = base_meta(Kind::File);
        assert!(meta.validate().is_err(), "file without chunking params");

        let meta = base_meta(Kind::Symlink);
        assert!(meta.validate().is_err(), "symlink without target");
    }

    #[test]
    fn test_oversized_chunks_rejected() {
        let mut meta = base_meta(Kind::File);
        meta.chunking = Some(ChunkerConfig {
            max_size: u32::MAX,
            ..Default::default()
        });
        meta.chunks = vec![chunk(u32::MAX)];
        assert!(meta.validate().is_err(), "chunking above the hard ceiling");

        meta.chunking = Some(ChunkerConfig::default());
        assert!(meta.validate().is_err(), "chunk above max_size");
        assert_eq!(meta.chunks[0].padded_size(), u32::MAX);
    }

    #[test]
    fn test_encode_decode() {
        let meta = base_meta(Kind::Directory);
        let bytes = meta.encode().unwrap();
        assert_eq!(MetaInfo::decode(&bytes).unwrap(), meta);
        assert!(MetaInfo::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_mtime_fuzzy_match() {
        let mut meta = base_meta(Kind::File);
        assert!(meta.mtime_matches(meta.mtime));
        assert!(!meta.mtime_matches(meta.mtime + 1));

        // whole-second timestamps compare at one second resolution
        meta.mtime = 1_700_000_000 * NANOS_PER_SEC;
        meta.mtime_granularity = granularity_of(meta.mtime);
        assert!(meta.mtime_matches(meta.mtime + 999_999_999));
        assert!(!meta.mtime_matches(meta.mtime + NANOS_PER_SEC));
    }

    #[test]
    fn test_time_conversion() {
        let now = SystemTime::now();
        let nanos = system_time_to_nanos(now);
        assert_eq!(nanos_to_system_time(nanos), now);
    }
}
