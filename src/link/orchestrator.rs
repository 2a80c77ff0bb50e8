//! Connection orchestration
//!
//! Drives the per-peer lifecycle around the registry: claiming a dial slot,
//! walking the state machine on driver events, and making sure every exit
//! path (failure, timeout, disconnect, shutdown) runs the same cleanup
//! and lands the record back in Discovered (or Blacklisted).
//!
//! Lock order: the connecting-set lock is always taken after the registry
//! lock is released; neither is ever held across a driver call.

use crate::identity::MacAddress;
use crate::peer::record::PeerState;
use crate::peer::registry::{BlacklistPolicy, PeerRegistry, RegistryError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// In-attempt retry backoff for transient link errors
pub const RETRY_BACKOFF: [Duration; 3] = [
    Duration::from_millis(200),
    Duration::from_millis(500),
    Duration::from_millis(1000),
];

/// Errors when claiming a dial slot
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    #[error("Peer {0} already has a connection attempt in flight")]
    AlreadyConnecting(MacAddress),

    #[error("Peer not dialable: {0}")]
    NotDialable(#[from] RegistryError),
}

/// Peers with a connection attempt in flight (Dialing or HandshakePending).
///
/// Membership is the scan gate: the driver family cannot scan while a
/// connection is being established, so discovery skips cycles while this
/// set is non-empty.
#[derive(Debug, Default)]
pub struct ConnectingSet {
    inner: Mutex<HashSet<MacAddress>>,
}

impl ConnectingSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a slot; false when the peer already holds one
    pub fn insert(&self, mac: MacAddress) -> bool {
        self.inner.lock().insert(mac)
    }

    /// Release a slot; false when the peer held none
    pub fn remove(&self, mac: &MacAddress) -> bool {
        self.inner.lock().remove(mac)
    }

    /// Whether the peer holds a slot
    pub fn contains(&self, mac: &MacAddress) -> bool {
        self.inner.lock().contains(mac)
    }

    /// Whether any attempt is in flight
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of attempts in flight
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Release all slots, returning the members
    pub fn drain(&self) -> Vec<MacAddress> {
        self.inner.lock().drain().collect()
    }
}

/// How a finished teardown left the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownDisposition {
    /// Back to Discovered, attempt recorded successful
    Rediscovered,
    /// Failure pushed the peer over the blacklist threshold
    Blacklisted { until: Instant },
    /// The record no longer exists (rotated away or evicted)
    Forgotten,
}

/// Walks peers through the connection state machine
#[derive(Debug)]
pub struct Orchestrator {
    registry: Arc<PeerRegistry>,
    connecting: ConnectingSet,
    policy: BlacklistPolicy,
}

impl Orchestrator {
    /// Create an orchestrator over a shared registry
    pub fn new(registry: Arc<PeerRegistry>, policy: BlacklistPolicy) -> Self {
        Self {
            registry,
            connecting: ConnectingSet::new(),
            policy,
        }
    }

    /// The connecting-set, for the scan gate and introspection
    pub fn connecting(&self) -> &ConnectingSet {
        &self.connecting
    }

    /// Whether discovery may scan this cycle
    pub fn scan_gate_open(&self) -> bool {
        self.connecting.is_empty()
    }

    /// Claim a dial slot and move the peer into Dialing.
    ///
    /// Records the attempt (`attempts_total`, `last_attempt_at`) on success.
    pub fn begin_dial(&self, mac: MacAddress, now: Instant) -> Result<(), DialError> {
        if !self.connecting.insert(mac) {
            return Err(DialError::AlreadyConnecting(mac));
        }

        let claimed = self
            .registry
            .transition(mac, PeerState::Discovered, PeerState::Dialing)
            .or_else(|e| {
                // An expired blacklist is dialable before the sweep runs
                match self.registry.get(&mac) {
                    Some(p) if p.state == PeerState::Blacklisted && !p.is_blacklisted(now) => self
                        .registry
                        .transition(mac, PeerState::Blacklisted, PeerState::Dialing),
                    _ => Err(e),
                }
            });

        if let Err(e) = claimed {
            self.connecting.remove(&mac);
            return Err(DialError::NotDialable(e));
        }

        if let Err(e) = self.registry.record_attempt(mac, now) {
            // Record vanished between the two calls; release the slot
            self.connecting.remove(&mac);
            self.registry.force_state(mac, PeerState::Discovered).ok();
            return Err(DialError::NotDialable(e));
        }

        debug!(mac = %mac, "dialing");
        Ok(())
    }

    /// Driver reported the link up while we were dialing
    pub fn link_up(&self, mac: MacAddress) -> Result<(), RegistryError> {
        self.registry
            .transition(mac, PeerState::Dialing, PeerState::HandshakePending)
    }

    /// A remote central connected to our GATT server
    pub fn inbound_link(&self, mac: MacAddress, now: Instant) {
        self.registry.mark_inbound(mac, now);
        self.connecting.insert(mac);
        debug!(mac = %mac, "inbound link, awaiting handshake");
    }

    /// Handshake finished; the link is live.
    ///
    /// Releases the connecting slot and clears the failure streak (and any
    /// blacklist); the peer proved reachable.
    pub fn activate(&self, mac: MacAddress) -> Result<(), RegistryError> {
        self.registry
            .transition(mac, PeerState::HandshakePending, PeerState::Active)?;
        self.registry.clear_failures(mac)?;
        self.connecting.remove(&mac);
        debug!(mac = %mac, "link active");
        Ok(())
    }

    /// Start tearing a peer down. Safe to call from any state; unknown
    /// records are ignored.
    pub fn begin_teardown(&self, mac: MacAddress) {
        if self.registry.force_state(mac, PeerState::Disconnecting).is_err() {
            debug!(mac = %mac, "teardown for unknown peer, nothing to do");
        }
    }

    /// Finish a teardown after resources are released.
    ///
    /// `reached_active` marks the attempt successful; `failed` feeds the
    /// blacklist policy. Both false means a deliberate close with no
    /// judgement on the peer.
    pub fn finish_teardown(
        &self,
        mac: MacAddress,
        reached_active: bool,
        failed: bool,
        now: Instant,
    ) -> TeardownDisposition {
        self.connecting.remove(&mac);

        if self.registry.get(&mac).is_none() {
            return TeardownDisposition::Forgotten;
        }

        if reached_active {
            self.registry.record_success(mac).ok();
        } else if failed {
            match self.registry.record_failure(mac, now, &self.policy) {
                Ok(Some(until)) => {
                    // record_failure already parked the record in Blacklisted
                    return TeardownDisposition::Blacklisted { until };
                }
                Ok(None) => {}
                Err(_) => return TeardownDisposition::Forgotten,
            }
        }

        if self.registry.force_state(mac, PeerState::Discovered).is_err() {
            return TeardownDisposition::Forgotten;
        }
        TeardownDisposition::Rediscovered
    }

    /// A dial that never produced a link: release the slot and record the
    /// failure
    pub fn abort_dial(&self, mac: MacAddress, now: Instant) -> TeardownDisposition {
        warn!(mac = %mac, "connection attempt failed");
        self.finish_teardown(mac, false, true, now)
    }
}
