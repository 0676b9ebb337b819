//! Folder-relative path normalization
//!
//! Paths travel between devices as `/`-separated strings relative to the
//! folder root, so the same file gets the same [`PathId`] everywhere.

use std::path::{Component, Path, PathBuf};

use crate::crypto::Secret;

use super::chunk::PathId;
use super::ContentError;

/// Turn an absolute path under `root` into its normalized relative form
pub fn normalize(root: &Path, path: &Path) -> Result<String, ContentError> {
    let relative = path
        .strip_prefix(root)
        .map_err(|_| ContentError::OutsideRoot(path.to_path_buf()))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| ContentError::Invalid(format!("non utf-8 path {:?}", path)))?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => return Err(ContentError::OutsideRoot(path.to_path_buf())),
        }
    }
    if parts.is_empty() {
        return Err(ContentError::Invalid("the folder root has no entry".into()));
    }
    Ok(parts.join("/"))
}

/// Resolve a normalized relative path back to an absolute one
///
/// Rejects anything that would escape `root`, since the string came from a
/// peer.
pub fn denormalize(root: &Path, normalized: &str) -> Result<PathBuf, ContentError> {
    let mut path = root.to_path_buf();
    for part in normalized.split('/') {
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(ContentError::Invalid(format!(
                "refusing path {:?}",
                normalized
            )));
        }
        path.push(part);
    }
    Ok(path)
}

pub fn path_id(normalized: &str, hash_key: &Secret) -> PathId {
    PathId::from_bytes(hash_key.keyed_hash(normalized.as_bytes()))
}
