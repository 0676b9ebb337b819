use serde::{Deserialize, Serialize};

use crate::bitfield::Bitfield;
use crate::content::{ChunkHash, PathRevision, SignedMetaWire};

/// Everything two devices of a folder say to each other
///
/// Framing and delivery belong to the [`Transport`](super::Transport); these
/// are the payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// First message on a new connection, proving knowledge of the folder
    Handshake(Handshake),
    /// The sender will not serve block requests
    Choke,
    /// The sender will serve block requests
    Unchoke,
    /// The sender wants chunks the receiver owns
    Interested,
    NotInterested,
    /// A revision the sender holds, with which of its chunks it owns
    IndexUpdate {
        revision: PathRevision,
        bitfield: Bitfield,
    },
    MetaRequest { revision: PathRevision },
    MetaResponse {
        meta: SignedMetaWire,
        bitfield: Bitfield,
    },
    BlockRequest(BlockRequest),
    BlockResponse(BlockResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Keyed hash binding the folder to the sending device
    pub auth_token: [u8; 32],
    pub device_name: String,
    pub user_agent: String,
}

/// Request for `length` ciphertext bytes of a chunk starting at `offset`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRequest {
    pub ct_hash: ChunkHash,
    pub offset: u32,
    pub length: u32,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub ct_hash: ChunkHash,
    pub offset: u32,
    pub content: Vec<u8>,
}

impl std::fmt::Debug for BlockResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockResponse")
            .field("ct_hash", &self.ct_hash)
            .field("offset", &self.offset)
            .field("len", &self.content.len())
            .finish()
    }
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not_interested",
            Message::IndexUpdate { .. } => "index_update",
            Message::MetaRequest { .. } => "meta_request",
            Message::MetaResponse { .. } => "meta_response",
            Message::BlockRequest(_) => "block_request",
            Message::BlockResponse(_) => "block_response",
        }
    }
}
