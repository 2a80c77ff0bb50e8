//! Link establishment: direction arbitration, identity handshake, and the
//! per-peer connection state machine.

pub mod arbiter;
pub mod handshake;
pub mod orchestrator;

pub use arbiter::{choose_role, LinkRole};
pub use handshake::{classify_inbound, verify_remote_identity, HandshakeError, InboundPayload};
pub use orchestrator::{
    ConnectingSet, DialError, Orchestrator, TeardownDisposition, RETRY_BACKOFF,
};
