//! Folder secrets and access levels
//!
//! A folder is identified by an Ed25519 public key. What a device may do with
//! a folder depends on which form of the secret it holds:
//!
//! - **ReadWrite**: the signing key. Can index local changes (sign metadata),
//!   decrypt, and serve chunks straight from assembled files.
//! - **ReadOnly**: the public key plus the master key. Can verify and decrypt,
//!   never sign.
//! - **DownloadOnly**: the public key alone. Verifies metadata and relays
//!   ciphertext, but can neither decrypt nor assemble files.
//!
//! Every purpose-specific key (chunk cipher, keyed hashes, path cipher) is
//! derived from the master key with a fixed context string.

use std::fmt;
use std::str::FromStr;

use super::keys::{KeyError, PublicKey, SecretKey, Signature, Verifier};
use super::secret::{Secret, BLAKE3_HASH_SIZE};

const MASTER_KEY_CONTEXT: &str = "cryptfold 2024-05 folder master key";
const CHUNK_KEY_CONTEXT: &str = "cryptfold 2024-05 chunk encryption";
const HASH_KEY_CONTEXT: &str = "cryptfold 2024-05 plaintext keyed hash";
const PATH_KEY_CONTEXT: &str = "cryptfold 2024-05 path encryption";

/// The symmetric keys needed to seal and open folder content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentKeys {
    /// Seals chunk contents
    pub chunk: Secret,
    /// Keys plaintext chunk hashes and path identifiers
    pub hash: Secret,
    /// Seals paths and symlink targets
    pub path: Secret,
}

#[derive(Clone)]
pub enum FolderSecret {
    ReadWrite { signing: SecretKey },
    ReadOnly { public: PublicKey, master: Secret },
    DownloadOnly { public: PublicKey },
}

impl fmt::Debug for FolderSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FolderSecret({:?}, {})", self.level(), self.public_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessLevel {
    DownloadOnly,
    ReadOnly,
    ReadWrite,
}

impl FolderSecret {
    /// Create a brand new folder, owned by this device
    pub fn generate() -> Result<Self, KeyError> {
        Ok(Self::ReadWrite {
            signing: SecretKey::generate()?,
        })
    }

    pub fn level(&self) -> AccessLevel {
        match self {
            Self::ReadWrite { .. } => AccessLevel::ReadWrite,
            Self::ReadOnly { .. } => AccessLevel::ReadOnly,
            Self::DownloadOnly { .. } => AccessLevel::DownloadOnly,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        match self {
            Self::ReadWrite { signing } => signing.public(),
            Self::ReadOnly { public, .. } => *public,
            Self::DownloadOnly { public } => *public,
        }
    }

    /// Identifier of the folder, safe to reveal to anyone
    pub fn folder_id(&self) -> [u8; BLAKE3_HASH_SIZE] {
        *blake3::hash(self.public_key().as_bytes()).as_bytes()
    }

    pub fn can_sign(&self) -> bool {
        matches!(self, Self::ReadWrite { .. })
    }

    pub fn can_decrypt(&self) -> bool {
        !matches!(self, Self::DownloadOnly { .. })
    }

    /// Weaken this secret to read-only access
    pub fn to_read_only(&self) -> Self {
        match self.master() {
            Some(master) => Self::ReadOnly {
                public: self.public_key(),
                master,
            },
            None => self.to_download_only(),
        }
    }

    /// Weaken this secret to download-only access
    pub fn to_download_only(&self) -> Self {
        Self::DownloadOnly {
            public: self.public_key(),
        }
    }

    pub fn signer(&self) -> Option<&SecretKey> {
        match self {
            Self::ReadWrite { signing } => Some(signing),
            _ => None,
        }
    }

    fn master(&self) -> Option<Secret> {
        match self {
            Self::ReadWrite { signing } => Some(Secret::from(blake3::derive_key(
                MASTER_KEY_CONTEXT,
                &signing.to_bytes(),
            ))),
            Self::ReadOnly { master, .. } => Some(master.clone()),
            Self::DownloadOnly { .. } => None,
        }
    }

    /// Keys for sealing and opening content, absent for download-only access
    pub fn content_keys(&self) -> Option<ContentKeys> {
        self.master().map(|m| ContentKeys {
            chunk: m.derive(CHUNK_KEY_CONTEXT),
            hash: m.derive(HASH_KEY_CONTEXT),
            path: m.derive(PATH_KEY_CONTEXT),
        })
    }

    /// Token a device presents in its handshake to prove it knows the folder
    ///
    /// Bound to the receiving device's identity so it cannot be replayed to
    /// a different peer.
    pub fn auth_token(&self, remote: &PublicKey) -> [u8; BLAKE3_HASH_SIZE] {
        *blake3::keyed_hash(&self.folder_id(), remote.as_bytes()).as_bytes()
    }
}

impl Verifier for FolderSecret {
    fn verify(&self, msg: &[u8], signature: &Signature) -> Result<(), KeyError> {
        self.public_key().verify(msg, signature)
    }
}

/// Text form: `rw:<secret hex>`, `ro:<public hex><master hex>`, `dl:<public hex>`
impl fmt::Display for FolderSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadWrite { signing } => write!(f, "rw:{}", signing.to_hex()),
            Self::ReadOnly { public, master } => {
                write!(f, "ro:{}{}", public.to_hex(), hex::encode(master.bytes()))
            }
            Self::DownloadOnly { public } => write!(f, "dl:{}", public.to_hex()),
        }
    }
}

impl FromStr for FolderSecret {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (level, body) = s
            .split_once(':')
            .ok_or_else(|| anyhow::anyhow!("folder secret is missing its level prefix"))?;
        match level {
            "rw" => Ok(Self::ReadWrite {
                signing: SecretKey::from_hex(body)?,
            }),
            "ro" => {
                if body.len() != 128 || !body.is_ascii() {
                    return Err(anyhow::anyhow!("read-only secret must be 128 hex chars").into());
                }
                let public = PublicKey::from_hex(&body[..64])?;
                let master = hex::decode(&body[64..])
                    .map_err(|_| anyhow::anyhow!("master key hex decode error"))?;
                let master = Secret::from_slice(&master).map_err(|e| anyhow::anyhow!("{}", e))?;
                Ok(Self::ReadOnly { public, master })
            }
            "dl" => Ok(Self::DownloadOnly {
                public: PublicKey::from_hex(body)?,
            }),
            other => Err(anyhow::anyhow!("unknown folder secret level {:?}", other).into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::Signer;

    #[test]
    fn test_levels_share_keys() {
        let rw = FolderSecret::generate().unwrap();
        let ro = rw.to_read_only();
        let dl = rw.to_download_only();

        assert_eq!(rw.public_key(), ro.public_key());
        assert_eq!(rw.public_key(), dl.public_key());
        let keys = rw.content_keys().unwrap();
        assert_eq!(Some(&keys), ro.content_keys().as_ref());
        assert!(dl.content_keys().is_none());
        assert_ne!(keys.chunk, keys.hash);
        assert_ne!(keys.hash, keys.path);

        assert!(rw.can_sign() && rw.can_decrypt());
        assert!(!ro.can_sign() && ro.can_decrypt());
        assert!(!dl.can_sign() && !dl.can_decrypt());
        assert_eq!(ro.to_download_only().level(), AccessLevel::DownloadOnly);
    }

    #[test]
    fn test_text_round_trip() {
        let rw = FolderSecret::generate().unwrap();
        for secret in [rw.clone(), rw.to_read_only(), rw.to_download_only()] {
            let parsed: FolderSecret = secret.to_string().parse().unwrap();
            assert_eq!(parsed.level(), secret.level());
            assert_eq!(parsed.public_key(), secret.public_key());
            assert_eq!(parsed.content_keys(), secret.content_keys());
        }
        assert!("xx:abcd".parse::<FolderSecret>().is_err());
        assert!("nonsense".parse::<FolderSecret>().is_err());
    }

    #[test]
    fn test_signatures_verify_at_every_level() {
        let rw = FolderSecret::generate().unwrap();
        let signature = rw.signer().unwrap().sign(b"meta");
        assert!(rw.to_download_only().verify(b"meta", &signature).is_ok());
        assert!(rw.to_read_only().verify(b"other", &signature).is_err());
    }

    #[test]
    fn test_auth_token_bound_to_remote() {
        let folder = FolderSecret::generate().unwrap();
        let a = SecretKey::generate().unwrap().public();
        let b = SecretKey::generate().unwrap().public();
        assert_eq!(
            folder.auth_token(&a),
            folder.to_download_only().auth_token(&a)
        );
        assert_ne!(folder.auth_token(&a), folder.auth_token(&b));
    }

    #[test]
    fn test_parse_rejects_non_ascii() {
        // 128 bytes, but the multi-byte char straddles the key boundary
        let body = format!("{}é{}", "a".repeat(63), "b".repeat(63));
        assert_eq!(body.len(), 128);
        assert!(format!("ro:{}", body).parse::<FolderSecret>().is_err());
        assert!("rw:ü".parse::<FolderSecret>().is_err());
    }
}
