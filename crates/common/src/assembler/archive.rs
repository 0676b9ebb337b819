use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime};
use walkdir::WalkDir;

use crate::config::{ArchiveConfig, ARCHIVE_DIR_NAME};

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Where replaced and deleted files go
#[derive(Debug, Clone)]
pub struct Archive {
    config: ArchiveConfig,
    dir: PathBuf,
}

impl Archive {
    pub fn new(config: ArchiveConfig, system_dir: &Path) -> Self {
        Self {
            config,
            dir: system_dir.join(ARCHIVE_DIR_NAME),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Move the regular file at `path` out of the way
    ///
    /// `relative` is its normalized path inside the folder. Afterwards
    /// nothing exists at `path`.
    pub fn archive(&self, path: &Path, relative: &str) -> io::Result<()> {
        self.archive_at(path, relative, Local::now())
    }

    pub(crate) fn archive_at(&self, path: &Path, relative: &str, now: DateTime<Local>) -> io::Result<()> {
        match &self.config {
            ArchiveConfig::None => fs::remove_file(path),
            ArchiveConfig::Trash { .. } => {
                let dest = self.mirrored(relative)?;
                if dest.is_dir() {
                    fs::remove_dir_all(&dest)?;
                }
                fs::rename(path, &dest)?;
                // retention counts from the moment of archiving
                File::options()
                    .write(true)
                    .open(&dest)?
                    .set_modified(now.into())?;
                tracing::debug!("moved {} to trash", relative);
                Ok(())
            }
            ArchiveConfig::Timestamped { keep } => {
                let original = self.mirrored(relative)?;
                let dest = timestamped_name(&original, now)?;
                fs::rename(path, &dest)?;
                tracing::debug!("archived {} as {}", relative, dest.display());
                prune_timestamped(&original, *keep)
            }
        }
    }

    /// `relative` placed under the archive dir, parents created
    fn mirrored(&self, relative: &str) -> io::Result<PathBuf> {
        let dest = relative
            .split('/')
            .fold(self.dir.clone(), |dest, part| dest.join(part));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(dest)
    }

    /// Drop trash entries older than the retention period
    ///
    /// Returns how many files were removed.
    pub fn maintain(&self) -> io::Result<usize> {
        self.maintain_at(SystemTime::now())
    }

    pub(crate) fn maintain_at(&self, now: SystemTime) -> io::Result<usize> {
        let ArchiveConfig::Trash { retention } = &self.config else {
            return Ok(0);
        };
        if !self.dir.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        for entry in WalkDir::new(&self.dir).min_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let modified = entry.metadata().map_err(io::Error::other)?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= *retention {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("pruned {} files from trash", removed);
        }
        Ok(removed)
    }
}

/// `dir/name.ext` -> `dir/name~YYYYMMDD-HHMMSS.ext`
fn timestamped_name(path: &Path, now: DateTime<Local>) -> io::Result<PathBuf> {
    let (stem, extension) = split_name(path)?;
    let stamp = now.format(TIMESTAMP_FORMAT);
    let name = match extension {
        Some(ext) => format!("{}~{}.{}", stem, stamp, ext),
        None => format!("{}~{}", stem, stamp),
    };
    Ok(path.with_file_name(name))
}

fn split_name(path: &Path) -> io::Result<(String, Option<String>)> {
    let invalid = || io::Error::new(io::ErrorKind::InvalidInput, "path has no utf-8 file name");
    let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(invalid)?;
    let extension = path
        .extension()
        .map(|e| e.to_str().map(str::to_string).ok_or_else(invalid))
        .transpose()?;
    Ok((stem.to_string(), extension))
}

/// Keep the `keep` newest timestamped copies of `original`
fn prune_timestamped(original: &Path, keep: usize) -> io::Result<()> {
    let Some(parent) = original.parent() else {
        return Ok(());
    };
    let (stem, extension) = split_name(original)?;
    let prefix = format!("{}~", stem);
    let suffix = extension.map(|e| format!(".{}", e)).unwrap_or_default();

    let mut copies: Vec<(NaiveDateTime, PathBuf)> = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let stamp = name
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix(&suffix));
        if let Some(time) = stamp.and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()) {
            copies.push((time, entry.path()));
        }
    }

    copies.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, path) in copies.into_iter().skip(keep) {
        fs::remove_file(&path)?;
    }
    Ok(())
}
