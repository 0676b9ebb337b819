/**
 * Content-defined chunking.
 *  Rabin fingerprint boundaries, so an edit
 *  only disturbs the chunks around it.
 */
pub mod chunker;
/**
 * Cryptographic types and operations.
 *  - Device keys, signatures
 *  - Folder secrets and the keys derived from them
 *  - Chunk and path cipher
 */
pub mod crypto;
/**
 * Immutable content identities: chunks,
 *  per-path metadata revisions and their
 *  signed form.
 */
pub mod content;
pub mod bitfield;
/**
 * What peers say to each other, and the
 *  outbound transport the engine is handed.
 */
pub mod protocol;
/**
 * The folder index: newest signed meta per path
 *  and whether it is reflected on disk.
 */
pub mod index;
/**
 * Ciphertext storage in three tiers:
 *  memory cache, encrypted blobs on disk, and
 *  chunks re-derived from assembled plaintext.
 */
pub mod store;
pub mod scanner;
pub mod queue;
/**
 * Missing-chunk bookkeeping and request scheduling.
 */
pub mod downloader;
/**
 * Turns complete chunk sets back into files,
 *  archiving whatever they replace.
 */
pub mod assembler;
/**
 * One synchronized folder: jobs, event loop,
 *  network callbacks.
 */
pub mod engine;
pub mod config;

pub mod prelude {
    pub use crate::bitfield::Bitfield;
    pub use crate::config::{ArchiveConfig, EngineConfig};
    pub use crate::content::{ChunkHash, ChunkInfo, Kind, MetaInfo, PathId, PathRevision, SignedMeta};
    pub use crate::crypto::{FolderSecret, PublicKey, SecretKey};
    pub use crate::engine::{EngineError, FolderEngine};
    pub use crate::index::{Index, MemoryIndex};
    pub use crate::protocol::{Message, PeerId, Transport};
}
