use serde::{Deserialize, Serialize};

use crate::crypto::{signature_from_slice, Signature, Signer, Verifier};

use super::meta::{MetaInfo, PathRevision};
use super::ContentError;

/// Metadata together with the exact bytes that were signed
///
/// Only constructed by signing locally or by verifying a peer's bytes, so a
/// `SignedMeta` in hand is always authentic.
#[derive(Debug, Clone, PartialEq)]
pub struct SignedMeta {
    meta: MetaInfo,
    raw: Vec<u8>,
    signature: Signature,
}

/// Form of [`SignedMeta`] carried in messages, unverified
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMetaWire {
    pub raw: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedMeta {
    pub fn sign<S: Signer + ?Sized>(meta: MetaInfo, signer: &S) -> Result<Self, ContentError> {
        meta.validate()?;
        let raw = meta.encode()?;
        let signature = signer.sign(&raw);
        Ok(Self {
            meta,
            raw,
            signature,
        })
    }

    /// Verify and decode metadata received from a peer
    ///
    /// The signature is checked before the payload is parsed.
    pub fn verify<V: Verifier + ?Sized>(
        wire: SignedMetaWire,
        verifier: &V,
    ) -> Result<Self, ContentError> {
        let signature =
            signature_from_slice(&wire.signature).map_err(ContentError::InvalidSignature)?;
        verifier
            .verify(&wire.raw, &signature)
            .map_err(ContentError::InvalidSignature)?;
        let meta = MetaInfo::decode(&wire.raw)?;
        Ok(Self {
            meta,
            raw: wire.raw,
            signature,
        })
    }

    pub fn meta(&self) -> &MetaInfo {
        &self.meta
    }

    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn path_revision(&self) -> PathRevision {
        self.meta.path_revision()
    }

    pub fn to_wire(&self) -> SignedMetaWire {
        SignedMetaWire {
            raw: self.raw.clone(),
            signature: self.signature.to_bytes().to_vec(),
        }
    }
}
