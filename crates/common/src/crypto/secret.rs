//! Symmetric key material and the chunk cipher
//!
//! Every chunk is sealed with ChaCha20-Poly1305 under the folder's chunk key and
//! a per-chunk IV recorded in the chunk's metadata. Encryption with a recorded IV
//! is deterministic, which is what lets an unchanged plaintext range be turned
//! back into the exact ciphertext peers know by its hash.

use std::ops::Deref;

use chacha20poly1305::Key;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use serde::{Deserialize, Serialize};

/// Size of ChaCha20-Poly1305 nonce in bytes
pub const NONCE_SIZE: usize = 12;
/// Size of ChaCha20-Poly1305 key in bytes (256 bits)
pub const SECRET_SIZE: usize = 32;
/// Size of the Poly1305 authentication tag appended to every ciphertext
pub const TAG_SIZE: usize = 16;
/// Size of BLAKE3 hash in bytes (256 bits)
pub const BLAKE3_HASH_SIZE: usize = 32;

/// Per-chunk initialization vector
pub type Iv = [u8; NONCE_SIZE];

/// Errors that can occur during encryption/decryption
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A 256-bit symmetric key
///
/// Folder secrets hand out purpose-bound keys derived from one master key with
/// [`Secret::derive`], so the cipher key and the keyed-hash key never coincide.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Secret([u8; SECRET_SIZE]);

impl Default for Secret {
    fn default() -> Self {
        Secret([0; SECRET_SIZE])
    }
}

impl Deref for Secret {
    type Target = [u8; SECRET_SIZE];
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; SECRET_SIZE]> for Secret {
    fn from(bytes: [u8; SECRET_SIZE]) -> Self {
        Secret(bytes)
    }
}

impl Secret {
    /// Generate a new random secret using a cryptographically secure RNG
    pub fn generate() -> Result<Self, SecretError> {
        let mut buff = [0; SECRET_SIZE];
        getrandom::getrandom(&mut buff)
            .map_err(|e| anyhow::anyhow!("failed to generate random bytes: {}", e))?;
        Ok(Self(buff))
    }

    /// Create a secret from a byte slice
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not exactly `SECRET_SIZE` bytes.
    pub fn from_slice(data: &[u8]) -> Result<Self, SecretError> {
        if data.len() != SECRET_SIZE {
            return Err(anyhow::anyhow!(
                "invalid secret size, expected {}, got {}",
                SECRET_SIZE,
                data.len()
            )
            .into());
        }
        let mut buff = [0; SECRET_SIZE];
        buff.copy_from_slice(data);
        Ok(buff.into())
    }

    /// Get a reference to the secret key bytes
    pub fn bytes(&self) -> &[u8] {
        self.0.as_ref()
    }

    /// Derive an independent key bound to `context`
    pub fn derive(&self, context: &str) -> Secret {
        Secret(blake3::derive_key(context, &self.0))
    }

    /// Keyed BLAKE3 hash, unforgeable without this secret
    pub fn keyed_hash(&self, data: &[u8]) -> [u8; BLAKE3_HASH_SIZE] {
        *blake3::keyed_hash(&self.0, data).as_bytes()
    }

    /// Encrypt `data` under this key and the given IV
    ///
    /// The output is `ciphertext || tag`, always `data.len() + TAG_SIZE` bytes.
    /// The same key, IV and plaintext always produce the same output.
    pub fn encrypt_with_iv(&self, data: &[u8], iv: &Iv) -> Result<Vec<u8>, SecretError> {
        let key = Key::from_slice(self.bytes());
        let cipher = ChaCha20Poly1305::new(key);
        let nonce = Nonce::from_slice(iv);
        cipher
            .encrypt(nonce, data)
            .map_err(|_| anyhow::anyhow!("encrypt error").into())
    }

    /// Decrypt `ciphertext || tag` produced by [`Secret::encrypt_with_iv`]
    ///
    /// # Errors
    ///
    /// Returns an error if the data is shorter than a tag or the authentication
    /// tag does not verify (tampered data, wrong key or wrong IV).
    pub fn decrypt_with_iv(&self, data: &[u8], iv: &Iv) -> Result<Vec<u8>, SecretError> {
        if data.len() < TAG_SIZE {
            return Err(anyhow::anyhow!("data too short for authentication tag").into());
        }
        let key = Key::from_slice(self.bytes());
        let cipher = ChaCha20Poly1305::new(key);
        let nonce = Nonce::from_slice(iv);
        cipher
            .decrypt(nonce, data)
            .map_err(|_| anyhow::anyhow!("decrypt error").into())
    }
}

/// Generate a fresh random IV
pub fn generate_iv() -> Result<Iv, SecretError> {
    let mut iv = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut iv).map_err(|e| anyhow::anyhow!("failed to generate iv: {}", e))?;
    Ok(iv)
}
