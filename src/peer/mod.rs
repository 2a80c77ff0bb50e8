//! Peer model: records, registry, and dial selection
//!
//! One record exists per known remote device, born on its first matching
//! advertisement and kept across link teardowns so attempt history and
//! blacklists survive. The registry is the single synchronized store; the
//! selection policy ranks dialable candidates each discovery cycle.

pub mod record;
pub mod registry;
pub mod selection;

pub use record::{Peer, PeerState};
pub use registry::{BindOutcome, BlacklistPolicy, PeerRegistry, RegistryError};
pub use selection::{score_peer, select_candidates, SelectionParams};
