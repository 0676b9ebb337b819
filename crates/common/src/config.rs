//! Engine configuration
//!
//! Built by whatever embeds the engine (loading it from a file is the
//! embedder's business) and handed to [`FolderEngine::new`](crate::engine::FolderEngine::new).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};

use crate::chunker::ChunkerConfig;
use crate::queue::WeightConstants;

/// Directory at the folder root holding the chunk store, temp files and trash
pub const SYSTEM_DIR_NAME: &str = ".cryptfold";
pub const CHUNKS_DIR_NAME: &str = "chunks";
pub const TEMP_DIR_NAME: &str = "tmp";
pub const ARCHIVE_DIR_NAME: &str = "archive";

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Max block requests in flight across all peers
    pub download_slots: usize,
    /// Max bytes asked for in a single block request
    pub block_size: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// How often the downloader refills its request slots
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub maintain_interval: Duration,
    /// How often unassembled metas are retried and the archive is pruned
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,
    /// Byte bound of the in-memory chunk cache
    pub cache_bytes: u64,
    /// Concurrent scan and assemble jobs
    pub worker_threads: usize,
    pub device_name: String,
    pub chunker: ChunkerConfig,
    pub weights: WeightConstants,
    pub archive: ArchiveConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            download_slots: 16,
            block_size: 128 * 1024,
            request_timeout: Duration::from_secs(30),
            maintain_interval: Duration::from_millis(100),
            sweep_interval: Duration::from_secs(60),
            cache_bytes: 64 * 1024 * 1024,
            worker_threads: 4,
            device_name: "cryptfold".to_string(),
            chunker: ChunkerConfig::default(),
            weights: WeightConstants::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

/// What happens to a local file about to be replaced or deleted by a peer
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveConfig {
    /// Overwrite or delete in place
    #[default]
    None,
    /// Move into the system directory's archive, pruned after `retention`
    Trash {
        #[serde_as(as = "DurationSeconds<u64>")]
        retention: Duration,
    },
    /// Keep renamed `name~YYYYMMDD-HHMMSS.ext` copies next to the file
    Timestamped {
        /// Copies retained per original name
        keep: usize,
    },
}
