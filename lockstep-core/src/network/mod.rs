//! Peer Transport
//!
//! The peer-to-peer link itself is established elsewhere (signaling, ICE, media
//! negotiation). This module only defines how the sync layer writes to it and
//! how peers are named on it.

mod peer_id;

pub use peer_id::PeerId;

/// Outbound half of an established data channel.
///
/// Sends are fire-and-forget: the transport preserves order per direction but
/// the sync layer never waits for delivery.
pub trait Transport: Send + Sync {
    fn send(&self, text: String);
}
