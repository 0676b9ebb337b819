//! Cryptographic primitives for cryptfold
//!
//! - **Identity & provenance**: Ed25519 keypairs. A folder is named by its
//!   public key, file metadata is signed with the folder's secret key, and
//!   devices identify themselves with their own keys.
//! - **Content encryption**: ChaCha20-Poly1305 per chunk, keyed by the folder and
//!   a per-chunk IV recorded in the chunk's metadata.
//! - **Keyed hashes**: BLAKE3 in keyed mode, so plaintext fingerprints and path
//!   identifiers reveal nothing to peers without the folder key.
//!
//! The signature primitive is consumed through the [`Signer`] and [`Verifier`]
//! traits; nothing outside this module touches ed25519 directly.

mod folder;
mod keys;
mod secret;

pub use folder::{AccessLevel, ContentKeys, FolderSecret};
pub use keys::{
    signature_from_slice, KeyError, PublicKey, SecretKey, Signature, Signer, Verifier,
    SIGNATURE_SIZE,
};
pub use secret::{generate_iv, Iv, Secret, SecretError, BLAKE3_HASH_SIZE, NONCE_SIZE, TAG_SIZE};
