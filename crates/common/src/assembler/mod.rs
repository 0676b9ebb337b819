//! # Assembler
//!
//! Makes the filesystem match an indexed meta. Files are only written once
//! every chunk is available; they are decrypted into a temp file inside the
//! system directory and renamed over the target, so a reader never observes
//! a half-written file. Whatever the new revision replaces goes through the
//! configured [`Archive`].

mod archive;

pub use archive::Archive;

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;

use crate::config::{ArchiveConfig, SYSTEM_DIR_NAME, TEMP_DIR_NAME};
use crate::content::{denormalize, nanos_to_system_time, ContentError, Kind, MetaInfo, PathId};
use crate::crypto::{ContentKeys, FolderSecret};
use crate::index::{Index, IndexError, IndexedMeta};
use crate::store::{ChunkStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum AssembleError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("content error: {0}")]
    Content(#[from] ContentError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("assembly interrupted")]
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssembleOutcome {
    /// The path now reflects the indexed revision
    Assembled,
    /// Not possible yet; retried on a later sweep
    NotReady(String),
}

#[derive(Debug)]
pub struct Assembler {
    root: PathBuf,
    temp_dir: PathBuf,
    keys: Option<ContentKeys>,
    index: Arc<dyn Index>,
    store: Arc<ChunkStore>,
    archive: Archive,
}

impl Assembler {
    pub fn new(
        root: impl Into<PathBuf>,
        folder: &FolderSecret,
        index: Arc<dyn Index>,
        store: Arc<ChunkStore>,
        archive: ArchiveConfig,
    ) -> Result<Self, AssembleError> {
        let root = root.into();
        let system_dir = root.join(SYSTEM_DIR_NAME);
        let temp_dir = system_dir.join(TEMP_DIR_NAME);
        fs::create_dir_all(&temp_dir)?;
        Ok(Self {
            archive: Archive::new(archive, &system_dir),
            root,
            temp_dir,
            keys: folder.content_keys(),
            index,
            store,
        })
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Paths whose current meta is not reflected on disk yet
    pub fn pending(&self) -> Result<Vec<PathId>, AssembleError> {
        Ok(self
            .index
            .unassembled()?
            .iter()
            .map(|m| m.meta().path_id)
            .collect())
    }

    /// Bring `path_id` in line with its current indexed meta
    pub fn assemble(&self, path_id: &PathId, interrupt: &AtomicBool) -> Result<AssembleOutcome, AssembleError> {
        let Some(indexed) = self.index.get_meta(path_id)? else {
            return Ok(AssembleOutcome::NotReady("unknown path".into()));
        };
        if indexed.assembled {
            return Ok(AssembleOutcome::Assembled);
        }
        let Some(keys) = &self.keys else {
            return Ok(AssembleOutcome::NotReady("folder secret cannot decrypt".into()));
        };

        let meta = indexed.meta();
        let relative = meta.decrypt_path(&keys.path)?;
        let target = denormalize(&self.root, &relative)?;
        if target.starts_with(self.root.join(SYSTEM_DIR_NAME)) {
            return Err(ContentError::Invalid(format!("{} is internal", relative)).into());
        }

        let outcome = match meta.kind {
            Kind::File => self.assemble_file(meta, keys, &target, &relative, interrupt)?,
            Kind::Directory => self.assemble_directory(meta, &target, &relative)?,
            Kind::Symlink => self.assemble_symlink(meta, keys, &target)?,
            Kind::Deleted => self.assemble_deleted(&target, &relative)?,
        };
        if outcome != AssembleOutcome::Assembled {
            return Ok(outcome);
        }
        self.finish(&indexed, &relative)
    }

    fn finish(&self, indexed: &IndexedMeta, relative: &str) -> Result<AssembleOutcome, AssembleError> {
        let revision = indexed.path_revision();
        if !self.index.set_assembled(&revision)? {
            return Ok(AssembleOutcome::NotReady(format!(
                "{} was superseded during assembly",
                relative
            )));
        }
        if indexed.meta().kind == Kind::File {
            self.store.cleanup(indexed.meta())?;
        }
        tracing::info!(
            "assembled {} ({:?}) at revision {}",
            relative,
            indexed.meta().kind,
            revision.revision
        );
        Ok(AssembleOutcome::Assembled)
    }

    fn assemble_file(
        &self,
        meta: &MetaInfo,
        keys: &ContentKeys,
        target: &Path,
        relative: &str,
        interrupt: &AtomicBool,
    ) -> Result<AssembleOutcome, AssembleError> {
        if let Some(chunk) = meta.chunks.iter().find(|c| !self.store.have_chunk(&c.ct_hash)) {
            return Ok(AssembleOutcome::NotReady(format!("chunk {} missing", chunk.ct_hash)));
        }

        let mut temp = NamedTempFile::new_in(&self.temp_dir)?;
        for chunk in &meta.chunks {
            if interrupt.load(Ordering::Relaxed) {
                return Err(AssembleError::Interrupted);
            }
            let ciphertext = match self.store.get_chunk(&chunk.ct_hash) {
                Ok(data) => data,
                Err(StoreError::NoSuchChunk(hash)) => {
                    return Ok(AssembleOutcome::NotReady(format!("chunk {} vanished", hash)));
                }
                Err(e) => return Err(e.into()),
            };
            let plaintext = chunk.open(&ciphertext, keys)?;
            temp.write_all(&plaintext)?;
        }
        temp.as_file().sync_all()?;
        temp.as_file().set_modified(nanos_to_system_time(meta.mtime))?;
        set_mode(temp.path(), meta)?;

        self.make_parent(target)?;
        match fs::symlink_metadata(target) {
            Ok(existing) if existing.is_dir() => fs::remove_dir(target)?,
            Ok(existing) if existing.is_file() => self.archive.archive(target, relative)?,
            Ok(_) => fs::remove_file(target)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        temp.persist(target).map_err(|e| e.error)?;
        Ok(AssembleOutcome::Assembled)
    }

    fn assemble_directory(
        &self,
        meta: &MetaInfo,
        target: &Path,
        relative: &str,
    ) -> Result<AssembleOutcome, AssembleError> {
        match fs::symlink_metadata(target) {
            Ok(existing) if existing.is_dir() => {}
            Ok(existing) if existing.is_file() => self.archive.archive(target, relative)?,
            Ok(_) => fs::remove_file(target)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(target)?;
        set_mode(target, meta)?;
        Ok(AssembleOutcome::Assembled)
    }

    fn assemble_symlink(
        &self,
        meta: &MetaInfo,
        keys: &ContentKeys,
        target: &Path,
    ) -> Result<AssembleOutcome, AssembleError> {
        let Some(link_target) = meta.decrypt_symlink_target(&keys.path)? else {
            return Err(ContentError::Invalid("symlink without target".into()).into());
        };
        remove_any(target)?;
        self.make_parent(target)?;
        create_symlink(&link_target, target)
    }

    fn assemble_deleted(&self, target: &Path, relative: &str) -> Result<AssembleOutcome, AssembleError> {
        match fs::symlink_metadata(target) {
            Ok(existing) if existing.is_dir() => fs::remove_dir_all(target)?,
            Ok(existing) if existing.is_file() => self.archive.archive(target, relative)?,
            Ok(_) => fs::remove_file(target)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(AssembleOutcome::Assembled)
    }

    fn make_parent(&self, target: &Path) -> Result<(), AssembleError> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(existing) if existing.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, meta: &MetaInfo) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(unix) = &meta.unix {
        fs::set_permissions(path, fs::Permissions::from_mode(unix.mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _meta: &MetaInfo) -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_symlink(link_target: &str, path: &Path) -> Result<AssembleOutcome, AssembleError> {
    std::os::unix::fs::symlink(link_target, path)?;
    Ok(AssembleOutcome::Assembled)
}

#[cfg(not(unix))]
fn create_symlink(_link_target: &str, _path: &Path) -> Result<AssembleOutcome, AssembleError> {
    Ok(AssembleOutcome::NotReady("symlinks are not supported here".into()))
}
