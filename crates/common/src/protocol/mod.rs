//! Peer message contracts
//!
//! The engine never touches sockets. It is handed a [`Transport`] and calls
//! back into the engine with whatever arrives.

mod messages;

pub use messages::{BlockRequest, BlockResponse, Handshake, Message};

use crate::crypto::PublicKey;

/// A remote device, identified by its device key
pub type PeerId = PublicKey;

/// User agent sent in our handshakes
pub const USER_AGENT: &str = concat!("cryptfold/", env!("CARGO_PKG_VERSION"));

/// Outbound half of the connection layer
///
/// `send` is fire-and-forget: delivery failures surface as a later
/// disconnect, never as an error here.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, peer: &PeerId, message: Message);
}
