//! # Content model
//!
//! Immutable value types giving every chunk and every file revision a stable
//! identity:
//!
//! - [`ChunkInfo`]: one encrypted chunk, addressed by the hash of its ciphertext
//! - [`MetaInfo`]: one revision of one path, identified by [`PathRevision`]
//! - [`SignedMeta`]: metadata plus the signed bytes it was decoded from
//!
//! Nothing here is ever edited in place. Re-indexing a path produces a new
//! revision; changed content produces new chunks.

mod chunk;
mod meta;
mod path;
mod signed;

use std::path::PathBuf;

pub use chunk::{ChunkHash, ChunkInfo, PathId};
pub use meta::{
    granularity_of, nanos_to_system_time, system_time_to_nanos, EncryptedData, Kind, MetaInfo,
    PathRevision, UnixAttrib,
};
pub use path::{denormalize, normalize, path_id};
pub use signed::{SignedMeta, SignedMetaWire};

use crate::crypto::{KeyError, SecretError};

#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("invalid signature: {0}")]
    InvalidSignature(KeyError),
    #[error("metadata decode error: {0}")]
    Decode(#[from] bincode::Error),
    #[error("invalid metadata: {0}")]
    Invalid(String),
    #[error("crypto error: {0}")]
    Crypto(#[from] SecretError),
    #[error("ciphertext does not hash to {0}")]
    CiphertextMismatch(ChunkHash),
    #[error("plaintext does not match chunk {0}")]
    PlaintextMismatch(ChunkHash),
    #[error("path {0:?} is outside the folder")]
    OutsideRoot(PathBuf),
}
