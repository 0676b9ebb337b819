//! Content-defined chunking with a Rabin rolling fingerprint
//!
//! The chunker keeps a fixed-size sliding window over the input and a 64-bit
//! fingerprint of that window, computed with polynomial arithmetic over GF(2).
//! A chunk ends whenever the low bits of the fingerprint (selected by `mask`)
//! are all zero and at least `min_size` bytes were consumed, or unconditionally
//! once `max_size` bytes were consumed.
//!
//! Because the fingerprint only depends on the window contents, boundaries follow
//! the content: an edit near the start of a file only moves the boundaries around
//! it, later chunks keep their identity. Boundaries never depend on how the input
//! was split across calls to [`Chunker::feed`].

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// Irreducible polynomial of degree 53
pub const DEFAULT_POLYNOMIAL: u64 = 0x003D_A335_8B4D_C173;
/// Shift selecting the top byte of a degree 53 fingerprint
pub const DEFAULT_POLYNOMIAL_SHIFT: u32 = 53 - 8;
pub const DEFAULT_MIN_SIZE: u32 = 1024 * 1024;
pub const DEFAULT_MAX_SIZE: u32 = 8 * 1024 * 1024;
/// Hard ceiling on `max_size`, whoever signed the parameters
pub const MAX_CHUNK_SIZE: u32 = 256 * 1024 * 1024;
pub const DEFAULT_MASK: u64 = 0xF_FFFF;
pub const DEFAULT_WINDOW_SIZE: u32 = 64;

/// Byte slid into a freshly reset window
const WINDOW_SENTINEL: u8 = 1;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChunkerError {
    #[error("invalid chunker configuration: {0}")]
    InvalidConfig(String),
}

/// Chunking parameters.
///
/// These are pinned into every file's metadata so that any device re-chunking
/// the same bytes lands on the same boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub polynomial: u64,
    pub polynomial_shift: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub mask: u64,
    pub window_size: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            polynomial: DEFAULT_POLYNOMIAL,
            polynomial_shift: DEFAULT_POLYNOMIAL_SHIFT,
            min_size: DEFAULT_MIN_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            mask: DEFAULT_MASK,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }
}

impl ChunkerConfig {
    /// Check the parameters describe a usable chunker
    pub fn validate(&self) -> Result<(), ChunkerError> {
        if self.min_size == 0 {
            return Err(ChunkerError::InvalidConfig("min_size must be > 0".into()));
        }
        if self.min_size > self.max_size {
            return Err(ChunkerError::InvalidConfig(format!(
                "min_size {} is larger than max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.max_size > MAX_CHUNK_SIZE {
            return Err(ChunkerError::InvalidConfig(format!(
                "max_size {} exceeds {}",
                self.max_size, MAX_CHUNK_SIZE
            )));
        }
        if self.window_size == 0 {
            return Err(ChunkerError::InvalidConfig(
                "window_size must be > 0".into(),
            ));
        }
        if self.polynomial == 0 {
            return Err(ChunkerError::InvalidConfig(
                "polynomial must be non-zero".into(),
            ));
        }
        let degree = degree(self.polynomial);
        if !(9..=56).contains(&degree) {
            return Err(ChunkerError::InvalidConfig(format!(
                "polynomial degree {} out of range 9..=56",
                degree
            )));
        }
        if self.polynomial_shift + 8 > degree {
            return Err(ChunkerError::InvalidConfig(format!(
                "polynomial_shift {} too large for degree {}",
                self.polynomial_shift, degree
            )));
        }
        Ok(())
    }
}

/// End of a chunk, reported once per chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkBoundary {
    /// Length of the chunk that just ended
    pub size: u32,
}

/// Rolling-hash chunker over a byte stream
#[derive(Clone)]
pub struct Chunker {
    config: ChunkerConfig,
    mod_table: Box<[u64; 256]>,
    out_table: Box<[u64; 256]>,
    window: Vec<u8>,
    wpos: usize,
    count: u32,
    digest: u64,
}

impl std::fmt::Debug for Chunker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunker")
            .field("config", &self.config)
            .field("count", &self.count)
            .field("digest", &format_args!("{:#x}", self.digest))
            .finish()
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self, ChunkerError> {
        config.validate()?;
        let (mod_table, out_table) = tables(&config);
        let mut chunker = Self {
            config,
            mod_table,
            out_table,
            window: vec![0; config.window_size as usize],
            wpos: 0,
            count: 0,
            digest: 0,
        };
        chunker.reset();
        Ok(chunker)
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Consume one byte, returning a boundary if this byte ends a chunk
    pub fn feed(&mut self, byte: u8) -> Option<ChunkBoundary> {
        self.slide(byte);
        self.count += 1;

        let natural = self.count >= self.config.min_size && (self.digest & self.config.mask) == 0;
        if natural || self.count >= self.config.max_size {
            let size = self.count;
            self.reset();
            return Some(ChunkBoundary { size });
        }
        None
    }

    /// Flush the trailing partial chunk at end of stream
    pub fn finalize(&mut self) -> Option<ChunkBoundary> {
        if self.count == 0 {
            return None;
        }
        let size = self.count;
        self.reset();
        Some(ChunkBoundary { size })
    }

    /// Chunk a whole buffer, returning the byte range of every chunk
    pub fn split(&mut self, data: &[u8]) -> Vec<Range<usize>> {
        let mut ranges = Vec::new();
        let mut start = 0;
        for (i, byte) in data.iter().enumerate() {
            if self.feed(*byte).is_some() {
                ranges.push(start..i + 1);
                start = i + 1;
            }
        }
        if self.finalize().is_some() {
            ranges.push(start..data.len());
        }
        ranges
    }

    fn reset(&mut self) {
        self.window.fill(0);
        self.wpos = 0;
        self.count = 0;
        self.digest = 0;
        self.slide(WINDOW_SENTINEL);
    }

    fn slide(&mut self, byte: u8) {
        let evicted = self.window[self.wpos];
        self.window[self.wpos] = byte;
        self.digest ^= self.out_table[evicted as usize];
        self.wpos = (self.wpos + 1) % self.window.len();
        self.append(byte);
    }

    fn append(&mut self, byte: u8) {
        let index = (self.digest >> self.config.polynomial_shift) as u8;
        self.digest <<= 8;
        self.digest |= byte as u64;
        self.digest ^= self.mod_table[index as usize];
    }
}

fn degree(p: u64) -> u32 {
    63 - p.leading_zeros()
}

fn poly_mod(mut x: u64, p: u64) -> u64 {
    let dp = degree(p);
    while x != 0 && degree(x) >= dp {
        x ^= p << (degree(x) - dp);
    }
    x
}

fn append_mod(hash: u64, byte: u8, p: u64) -> u64 {
    poly_mod((hash << 8) | byte as u64, p)
}

#[allow(clippy::type_complexity)]
fn tables(config: &ChunkerConfig) -> (Box<[u64; 256]>, Box<[u64; 256]>) {
    let p = config.polynomial;
    let k = degree(p);

    let mut mod_table = Box::new([0u64; 256]);
    let mut out_table = Box::new([0u64; 256]);
    for b in 0..256u64 {
        mod_table[b as usize] = poly_mod(b << k, p) | (b << k);

        let mut hash = append_mod(0, b as u8, p);
        for _ in 0..config.window_size - 1 {
            hash = append_mod(hash, 0, p);
        }
        out_table[b as usize] = hash;
    }
    (mod_table, out_table)
}
