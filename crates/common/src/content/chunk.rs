use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{ContentKeys, Iv, SecretError, BLAKE3_HASH_SIZE, TAG_SIZE};

use super::ContentError;

macro_rules! hash_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name([u8; BLAKE3_HASH_SIZE]);

        impl $name {
            pub fn from_bytes(bytes: [u8; BLAKE3_HASH_SIZE]) -> Self {
                Self(bytes)
            }

            pub fn as_bytes(&self) -> &[u8; BLAKE3_HASH_SIZE] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(hex: &str) -> Result<Self, ContentError> {
                let mut buff = [0; BLAKE3_HASH_SIZE];
                hex::decode_to_slice(hex, &mut buff)
                    .map_err(|_| ContentError::Invalid(format!("bad {} hex", stringify!($name))))?;
                Ok(Self(buff))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..12])
            }
        }
    };
}

hash_newtype!(
    /// BLAKE3 hash of a chunk's ciphertext, the key every tier stores it under
    ChunkHash
);

hash_newtype!(
    /// Keyed hash of a normalized relative path
    PathId
);

impl ChunkHash {
    /// Content address of a ciphertext
    pub fn of(ciphertext: &[u8]) -> Self {
        Self(*blake3::hash(ciphertext).as_bytes())
    }
}

/// One encrypted chunk of a file
///
/// Created once by the scanner (or parsed from signed metadata) and never
/// modified; changed content always yields a new `ChunkInfo`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub ct_hash: ChunkHash,
    /// Plaintext length
    pub size: u32,
    pub iv: Iv,
    pub pt_keyed_hash: [u8; BLAKE3_HASH_SIZE],
}

impl ChunkInfo {
    /// Encrypt a plaintext chunk, returning its description and ciphertext
    pub fn seal(plaintext: &[u8], keys: &ContentKeys, iv: Iv) -> Result<(Self, Vec<u8>), SecretError> {
        let ciphertext = keys.chunk.encrypt_with_iv(plaintext, &iv)?;
        let info = Self {
            ct_hash: ChunkHash::of(&ciphertext),
            size: plaintext.len() as u32,
            iv,
            pt_keyed_hash: keys.hash.keyed_hash(plaintext),
        };
        Ok((info, ciphertext))
    }

    /// Re-derive the ciphertext from known plaintext, checking both hashes
    pub fn reseal(&self, plaintext: &[u8], keys: &ContentKeys) -> Result<Vec<u8>, ContentError> {
        if !self.matches_plaintext(plaintext, keys) {
            return Err(ContentError::PlaintextMismatch(self.ct_hash));
        }
        let ciphertext = keys.chunk.encrypt_with_iv(plaintext, &self.iv)?;
        if ChunkHash::of(&ciphertext) != self.ct_hash {
            return Err(ContentError::CiphertextMismatch(self.ct_hash));
        }
        Ok(ciphertext)
    }

    /// Decrypt this chunk's ciphertext and check it against the recorded hashes
    pub fn open(&self, ciphertext: &[u8], keys: &ContentKeys) -> Result<Vec<u8>, ContentError> {
        if ChunkHash::of(ciphertext) != self.ct_hash {
            return Err(ContentError::CiphertextMismatch(self.ct_hash));
        }
        let plaintext = keys.chunk.decrypt_with_iv(ciphertext, &self.iv)?;
        if !self.matches_plaintext(&plaintext, keys) {
            return Err(ContentError::PlaintextMismatch(self.ct_hash));
        }
        Ok(plaintext)
    }

    pub fn matches_plaintext(&self, plaintext: &[u8], keys: &ContentKeys) -> bool {
        plaintext.len() == self.size as usize && keys.hash.keyed_hash(plaintext) == self.pt_keyed_hash
    }

    /// Size of the ciphertext peers exchange
    ///
    /// Sizes come from validated metas, which cap them far below `u32::MAX`.
    pub fn padded_size(&self) -> u32 {
        self.size.saturating_add(TAG_SIZE as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_iv, FolderSecret};

    fn keys() -> ContentKeys {
        FolderSecret::generate().unwrap().content_keys().unwrap()
    }

    #[test]
    fn test_seal_open() {
        let keys = keys();
        let (info, ciphertext) = ChunkInfo::seal(b"chunk payload", &keys, generate_iv().unwrap()).unwrap();
        assert_eq!(info.size, 13);
        assert_eq!(info.padded_size() as usize, ciphertext.len());
        assert_eq!(info.open(&ciphertext, &keys).unwrap(), b"chunk payload");
        assert_eq!(info.reseal(b"chunk payload", &keys).unwrap(), ciphertext);
    }

    #[test]
    fn test_open_rejects_foreign_ciphertext() {
        let keys = keys();
        let (info, _) = ChunkInfo::seal(b"one", &keys, generate_iv().unwrap()).unwrap();
        let (_, other) = ChunkInfo::seal(b"two", &keys, generate_iv().unwrap()).unwrap();
        assert!(matches!(
            info.open(&other, &keys),
            Err(ContentError::CiphertextMismatch(_))
        ));
        assert!(matches!(
            info.reseal(b"ONE", &keys),
            Err(ContentError::PlaintextMismatch(_))
        ));
    }

    #[test]
    fn test_hash_hex_round_trip() {
        let hash = ChunkHash::of(b"abc");
        assert_eq!(ChunkHash::from_hex(&hash.to_hex()).unwrap(), hash);
        assert!(ChunkHash::from_hex("zz").is_err());
        assert_eq!(format!("{}", hash).len(), 64);
    }
}
