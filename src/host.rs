//! Upper stack contract
//!
//! The mesh layer above the engine owns the cryptographic identity and
//! consumes reassembled packets. It addresses peers through opaque
//! [`PeerHandle`] tokens handed out in `peer_appeared`; outbound traffic
//! goes through the engine handle's `process_outgoing`.

use crate::identity::{Identity, MacAddress};
use std::fmt;

/// Opaque routing token for one identified peer.
///
/// Tied to the peer's identity, so it stays valid across MAC rotations for
/// as long as the logical peer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerHandle(Identity);

impl PeerHandle {
    pub(crate) fn new(identity: Identity) -> Self {
        Self(identity)
    }

    pub(crate) fn identity(&self) -> Identity {
        self.0
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer:{}", self.0.short())
    }
}

/// Callbacks into the upper mesh stack.
///
/// All callbacks run on the engine executor and must return promptly; hand
/// heavy work to your own tasks.
pub trait MeshHost: Send + Sync {
    /// The local 16-byte identity, or None while it is still being
    /// generated or loaded. The engine polls during startup and fails if
    /// it never materializes.
    fn local_identity(&self) -> Option<Identity>;

    /// The local adapter address, used for connection direction
    /// arbitration. None disables arbitration (every eligible peer is
    /// dialed).
    fn local_mac(&self) -> Option<MacAddress>;

    /// A complete packet arrived from a peer
    fn inbound(&self, peer: PeerHandle, packet: Vec<u8>);

    /// A new identified peer link is live; `peer` routes to it
    fn peer_appeared(&self, identity: Identity, peer: PeerHandle);

    /// The peer link is gone; the handle is dead
    fn peer_gone(&self, identity: Identity);
}
