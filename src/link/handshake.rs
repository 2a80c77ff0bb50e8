//! Identity handshake
//!
//! The handshake is deliberately minimal: the central reads the remote's
//! identity characteristic, then writes its own 16-byte identity as the
//! first message on RX. The peripheral recognizes that first write by its
//! exact length: all real data on this link is framed as fragments with a
//! 5-byte header, so a bare 16-byte write from an unidentified sender is
//! unambiguous.

use crate::identity::Identity;
use thiserror::Error;

/// Errors during the identity exchange
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Identity mismatch: discovery inferred {expected}, characteristic read {actual}")]
    IdentityMismatch { expected: Identity, actual: Identity },
}

/// What an inbound RX write means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    /// The sender's identity announcement
    Handshake(Identity),
    /// Fragment data for the reassembler
    Data,
}

/// Classify an inbound write on the RX characteristic (peripheral side).
///
/// `known` is the identity of the live link, if the handshake already
/// completed. A repeated announcement of the same identity is still a
/// handshake (the sender refreshing itself); a 16-byte payload that differs
/// from the known identity is data.
pub fn classify_inbound(known: Option<Identity>, payload: &[u8]) -> InboundPayload {
    if payload.len() != Identity::LEN {
        return InboundPayload::Data;
    }
    match known {
        None => match Identity::from_bytes(payload) {
            Ok(identity) => InboundPayload::Handshake(identity),
            Err(_) => InboundPayload::Data,
        },
        Some(identity) if payload == identity.as_bytes() => InboundPayload::Handshake(identity),
        Some(_) => InboundPayload::Data,
    }
}

/// Validate the identity characteristic read against what discovery
/// inferred (central side).
///
/// A read of any length other than 16 bytes means a legacy peer without
/// the identity protocol: we proceed without an inferred identity and rely
/// on learning the peer through its own announcement.
pub fn verify_remote_identity(
    inferred: Option<Identity>,
    read: &[u8],
) -> Result<Option<Identity>, HandshakeError> {
    if read.len() != Identity::LEN {
        return Ok(None);
    }
    let actual = Identity::from_bytes(read).expect("length checked");
    if let Some(expected) = inferred {
        if expected != actual {
            return Err(HandshakeError::IdentityMismatch { expected, actual });
        }
    }
    Ok(Some(actual))
}
