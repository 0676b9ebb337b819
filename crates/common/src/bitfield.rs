//! Per-chunk availability bitfield and its wire packing
//!
//! Bit `i` is set when the sender holds chunk `i` of a given revision.
//!
//! Wire form: an empty bitfield is zero bytes. Otherwise the top three bits of
//! the first byte are a header and the remaining five bits carry the first five
//! bits of the field, most significant first:
//!
//! - `n <= 5`: a single byte, header = `n - 1`
//! - `n > 5`: header = `(n - 5) mod 8`, and the bits past the fifth follow at
//!   eight bits per byte, most significant first
//!
//! The bit count is recovered from the header and the byte length alone.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

const HEADER_SHIFT: u32 = 5;
const FIRST_BYTE_BITS: usize = 5;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum BitfieldError {
    #[error("single byte bitfield header {0} claims more than {FIRST_BYTE_BITS} bits")]
    BadHeader(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Bitfield {
    bits: Vec<bool>,
}

impl From<Vec<bool>> for Bitfield {
    fn from(bits: Vec<bool>) -> Self {
        Self { bits }
    }
}

impl FromIterator<bool> for Bitfield {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        Self {
            bits: iter.into_iter().collect(),
        }
    }
}

impl Bitfield {
    /// A bitfield of `len` cleared bits
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![false; len],
        }
    }

    pub fn full(len: usize) -> Self {
        Self {
            bits: vec![true; len],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Bits past the end read as unset
    pub fn get(&self, index: usize) -> bool {
        self.bits.get(index).copied().unwrap_or(false)
    }

    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        self.bits[index] = value;
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    pub fn all(&self) -> bool {
        self.bits.iter().all(|b| *b)
    }

    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        self.bits.iter().copied()
    }

    pub fn pack(&self) -> Vec<u8> {
        let n = self.bits.len();
        if n == 0 {
            return Vec::new();
        }

        let header = if n <= FIRST_BYTE_BITS {
            (n - 1) as u8
        } else {
            ((n - FIRST_BYTE_BITS) % 8) as u8
        };
        let tail_bytes = (n.saturating_sub(FIRST_BYTE_BITS) + 7) / 8;
        let mut out = vec![0u8; 1 + tail_bytes];
        out[0] = header << HEADER_SHIFT;

        for (i, bit) in self.bits.iter().enumerate() {
            if !*bit {
                continue;
            }
            if i < FIRST_BYTE_BITS {
                out[0] |= 1 << (FIRST_BYTE_BITS - 1 - i);
            } else {
                let j = i - FIRST_BYTE_BITS;
                out[1 + j / 8] |= 0x80 >> (j % 8);
            }
        }
        out
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, BitfieldError> {
        let Some(first) = bytes.first() else {
            return Ok(Self::default());
        };
        let header = first >> HEADER_SHIFT;

        let n = if bytes.len() == 1 {
            let n = header as usize + 1;
            if n > FIRST_BYTE_BITS {
                return Err(BitfieldError::BadHeader(header));
            }
            n
        } else {
            let last_byte_bits = if header == 0 { 8 } else { header as usize };
            FIRST_BYTE_BITS + 8 * (bytes.len() - 2) + last_byte_bits
        };

        let bits = (0..n)
            .map(|i| {
                if i < FIRST_BYTE_BITS {
                    first & (1 << (FIRST_BYTE_BITS - 1 - i)) != 0
                } else {
                    let j = i - FIRST_BYTE_BITS;
                    bytes[1 + j / 8] & (0x80 >> (j % 8)) != 0
                }
            })
            .collect();
        Ok(Self { bits })
    }
}

impl Serialize for Bitfield {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.pack().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Bitfield {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes = Vec::<u8>::deserialize(deserializer)?;
        Bitfield::unpack(&bytes).map_err(serde::de::Error::custom)
    }
}
