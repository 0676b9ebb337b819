//! Turns local filesystem entries into signed metadata
//!
//! Scanning a path compares what is on disk with the indexed meta for that
//! path and, if they differ, produces and indexes a new revision. Unchanged
//! file content keeps its chunk identities: a chunk whose plaintext hash and
//! size match a chunk of the previous revision is reused as is, IV and all.

use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::chunker::{Chunker, ChunkerConfig, ChunkerError};
use crate::config::SYSTEM_DIR_NAME;
use crate::content::{
    granularity_of, normalize, path_id, system_time_to_nanos, ChunkInfo, ContentError,
    EncryptedData, Kind, MetaInfo, SignedMeta, UnixAttrib,
};
use crate::crypto::{generate_iv, ContentKeys, FolderSecret, SecretError, SecretKey};
use crate::index::{Index, IndexError, IndexedMeta};

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Benign: the path is not something we index right now
    #[error("skipped: {0}")]
    Skip(String),
    #[error("scan interrupted")]
    Interrupted,
    #[error("folder secret cannot sign")]
    NotWritable,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("content error: {0}")]
    Content(#[from] ContentError),
    #[error("crypto error: {0}")]
    Crypto(#[from] SecretError),
    #[error("chunker error: {0}")]
    Chunker(#[from] ChunkerError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// A new revision was signed and indexed
    Indexed(SignedMeta),
    Unchanged,
}

#[derive(Debug)]
pub struct Scanner {
    root: PathBuf,
    system_dir: PathBuf,
    signer: SecretKey,
    keys: ContentKeys,
    index: Arc<dyn Index>,
    chunking: ChunkerConfig,
}

impl Scanner {
    /// Requires a read-write folder secret
    pub fn new(
        root: impl Into<PathBuf>,
        folder: &FolderSecret,
        index: Arc<dyn Index>,
        chunking: ChunkerConfig,
    ) -> Result<Self, ScanError> {
        let (Some(signer), Some(keys)) = (folder.signer(), folder.content_keys()) else {
            return Err(ScanError::NotWritable);
        };
        chunking.validate()?;
        let root = root.into();
        Ok(Self {
            system_dir: root.join(SYSTEM_DIR_NAME),
            root,
            signer: signer.clone(),
            keys,
            index,
            chunking,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan one path, which may or may not exist on disk
    pub fn scan(&self, path: &Path, interrupt: &AtomicBool) -> Result<ScanOutcome, ScanError> {
        if path.starts_with(&self.system_dir) {
            return Err(ScanError::Skip(format!("{} is internal", path.display())));
        }
        let normalized = match normalize(&self.root, path) {
            Ok(normalized) => normalized,
            Err(e) => return Err(ScanError::Skip(e.to_string())),
        };
        let path_id = path_id(&normalized, &self.keys.hash);
        let previous = self.index.get_meta(&path_id)?;
        if previous.as_ref().is_some_and(|m| !m.assembled) {
            // a peer's revision is on its way; what is on disk is not ours to index
            return Err(ScanError::Skip(format!("{} is awaiting assembly", normalized)));
        }
        let previous_meta = previous.as_ref().map(IndexedMeta::meta);

        let metadata = match fs::symlink_metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return match previous_meta {
                    Some(meta) if meta.kind != Kind::Deleted => {
                        let deleted = self.new_meta(&normalized, meta.revision, Kind::Deleted, None)?;
                        self.commit(&normalized, deleted)
                    }
                    Some(_) => Ok(ScanOutcome::Unchanged),
                    None => Err(ScanError::Skip(format!("{} does not exist", normalized))),
                };
            }
            Err(e) => return Err(e.into()),
        };
        let previous_revision = previous_meta.map(|m| m.revision).unwrap_or(0);
        let file_type = metadata.file_type();

        if file_type.is_dir() {
            if previous_meta.is_some_and(|m| m.kind == Kind::Directory && m.unix == unix_attrib(&metadata)) {
                return Ok(ScanOutcome::Unchanged);
            }
            let meta = self.new_meta(&normalized, previous_revision, Kind::Directory, Some(&metadata))?;
            return self.commit(&normalized, meta);
        }

        if file_type.is_symlink() {
            let target = fs::read_link(path)?;
            let target = target
                .to_str()
                .ok_or_else(|| ScanError::Skip(format!("non utf-8 symlink target in {}", normalized)))?
                .to_string();
            if let Some(meta) = previous_meta.filter(|m| m.kind == Kind::Symlink) {
                if meta.decrypt_symlink_target(&self.keys.path)?.as_deref() == Some(target.as_str()) {
                    return Ok(ScanOutcome::Unchanged);
                }
            }
            let mut meta = self.new_meta(&normalized, previous_revision, Kind::Symlink, Some(&metadata))?;
            meta.symlink_target = Some(EncryptedData::seal(target.as_bytes(), &self.keys.path)?);
            return self.commit(&normalized, meta);
        }

        if !file_type.is_file() {
            return Err(ScanError::Skip(format!("{} is not a regular file", normalized)));
        }

        let mtime = system_time_to_nanos(metadata.modified()?);
        if let Some(meta) = previous_meta.filter(|m| m.kind == Kind::File) {
            if meta.file_size() == metadata.len() && meta.mtime_matches(mtime) {
                tracing::debug!("{} unchanged", normalized);
                return Ok(ScanOutcome::Unchanged);
            }
        }

        let chunking = previous_meta
            .and_then(|m| m.chunking)
            .unwrap_or(self.chunking);
        let reusable = previous_meta
            .map(|m| {
                m.chunks
                    .iter()
                    .map(|c| ((c.pt_keyed_hash, c.size), c.clone()))
                    .collect()
            })
            .unwrap_or_default();
        let chunks = self.chunk_file(path, chunking, &reusable, interrupt)?;

        // the file must not have moved under us while we read it
        let after = fs::symlink_metadata(path)?;
        if after.len() != metadata.len() || after.modified()? != metadata.modified()? {
            return Err(ScanError::Skip(format!("{} changed while scanning", normalized)));
        }

        let mut meta = self.new_meta(&normalized, previous_revision, Kind::File, Some(&metadata))?;
        meta.chunking = Some(chunking);
        meta.chunks = chunks;
        self.commit(&normalized, meta)
    }

    fn chunk_file(
        &self,
        path: &Path,
        chunking: ChunkerConfig,
        reusable: &HashMap<([u8; 32], u32), ChunkInfo>,
        interrupt: &AtomicBool,
    ) -> Result<Vec<ChunkInfo>, ScanError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut chunker = Chunker::new(chunking)?;
        let mut buffer = vec![0; READ_BUFFER_SIZE];
        let mut current = Vec::new();
        let mut chunks = Vec::new();
        let mut reused = 0;

        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            for byte in &buffer[..read] {
                current.push(*byte);
                if chunker.feed(*byte).is_some() {
                    if interrupt.load(Ordering::Relaxed) {
                        return Err(ScanError::Interrupted);
                    }
                    let (info, was_reused) = self.chunk_info(&current, reusable)?;
                    reused += was_reused as usize;
                    chunks.push(info);
                    current.clear();
                }
            }
        }
        if chunker.finalize().is_some() {
            let (info, was_reused) = self.chunk_info(&current, reusable)?;
            reused += was_reused as usize;
            chunks.push(info);
        }

        tracing::debug!(
            "chunked {}: {} chunks, {} reused",
            path.display(),
            chunks.len(),
            reused
        );
        Ok(chunks)
    }

    fn chunk_info(
        &self,
        plaintext: &[u8],
        reusable: &HashMap<([u8; 32], u32), ChunkInfo>,
    ) -> Result<(ChunkInfo, bool), ScanError> {
        let key = (self.keys.hash.keyed_hash(plaintext), plaintext.len() as u32);
        if let Some(info) = reusable.get(&key) {
            return Ok((info.clone(), true));
        }
        let (info, _) = ChunkInfo::seal(plaintext, &self.keys, generate_iv()?)?;
        Ok((info, false))
    }

    fn new_meta(
        &self,
        normalized: &str,
        previous_revision: u64,
        kind: Kind,
        metadata: Option<&Metadata>,
    ) -> Result<MetaInfo, ScanError> {
        let now = system_time_to_nanos(SystemTime::now()).max(0) as u64;
        let mtime = match metadata {
            Some(m) => system_time_to_nanos(m.modified()?),
            None => now as i64,
        };
        Ok(MetaInfo {
            path_id: path_id(normalized, &self.keys.hash),
            revision: now.max(previous_revision + 1),
            kind,
            path: EncryptedData::seal(normalized.as_bytes(), &self.keys.path)?,
            symlink_target: None,
            mtime,
            mtime_granularity: granularity_of(mtime),
            unix: metadata.and_then(unix_attrib),
            chunking: None,
            chunks: Vec::new(),
        })
    }

    fn commit(&self, normalized: &str, meta: MetaInfo) -> Result<ScanOutcome, ScanError> {
        let kind = meta.kind;
        let signed = SignedMeta::sign(meta, &self.signer)?;
        if !self.index.put_meta(signed.clone(), true)? {
            return Err(ScanError::Skip(format!(
                "{} was superseded while scanning",
                normalized
            )));
        }
        tracing::info!(
            "indexed {} ({:?}) at revision {}",
            normalized,
            kind,
            signed.path_revision().revision
        );
        Ok(ScanOutcome::Indexed(signed))
    }
}

#[cfg(unix)]
fn unix_attrib(metadata: &Metadata) -> Option<UnixAttrib> {
    use std::os::unix::fs::MetadataExt;
    Some(UnixAttrib {
        mode: metadata.mode() & 0o7777,
        uid: metadata.uid(),
        gid: metadata.gid(),
    })
}

#[cfg(not(unix))]
fn unix_attrib(_metadata: &Metadata) -> Option<UnixAttrib> {
    None
}
