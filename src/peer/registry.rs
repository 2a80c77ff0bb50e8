//! Peer registry
//!
//! The single synchronized store of peer records. Records are physically
//! keyed by MAC address because discovery precedes the identity handshake;
//! the identity index is authoritative once a peer is identified and
//! guarantees at most one record per identity. The registry lock is held
//! only for the mutation at hand, never across driver calls or callbacks.

use crate::identity::{Identity, MacAddress};
use crate::peer::record::{Peer, PeerState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors for registry operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Unknown peer {0}")]
    UnknownPeer(MacAddress),

    #[error("Invalid transition for {mac}: expected {expected}, found {actual}")]
    InvalidTransition {
        mac: MacAddress,
        expected: PeerState,
        actual: PeerState,
    },
}

/// What a `bind_identity` call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// First identity for this record
    Bound,
    /// Same identity was already bound; only freshness was updated
    AlreadyBound,
    /// The MAC now claims a different identity; the old logical peer is gone
    ReplacedIdentity { previous: Identity },
    /// The identity moved to a new MAC (address rotation); the old record
    /// was dropped
    ReplacedMac { previous_mac: MacAddress },
}

/// Failure-count driven backoff policy.
///
/// After `threshold` consecutive failures the peer is excluded for
/// `backoff_base * (failures - threshold + 1)`, with the multiplier capped.
#[derive(Debug, Clone, Copy)]
pub struct BlacklistPolicy {
    pub threshold: u32,
    pub backoff_base: Duration,
    pub max_multiplier: u32,
}

impl Default for BlacklistPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            backoff_base: Duration::from_secs(60),
            max_multiplier: 8,
        }
    }
}

impl BlacklistPolicy {
    /// Backoff duration after `failures` consecutive failures, or None while
    /// under the threshold
    pub fn duration_for(&self, failures: u32) -> Option<Duration> {
        if failures < self.threshold {
            return None;
        }
        let multiplier = (failures - self.threshold + 1).min(self.max_multiplier);
        Some(self.backoff_base * multiplier)
    }
}

/// Result of a cleanup sweep over the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Blacklists whose deadline passed
    pub expired_blacklists: usize,
    /// Stale Discovered records released
    pub released: usize,
}

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<MacAddress, Peer>,
    by_identity: HashMap<Identity, MacAddress>,
}

/// Thread-safe peer store with a MAC-keyed physical map and an identity index
#[derive(Debug)]
pub struct PeerRegistry {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl PeerRegistry {
    /// Create a registry bounded at `capacity` records
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
        }
    }

    /// Insert or refresh a record from an advertisement.
    /// Returns true when a new record was created.
    pub fn upsert_from_advert(
        &self,
        mac: MacAddress,
        rssi: i16,
        name: Option<String>,
        now: Instant,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let created = match inner.peers.get_mut(&mac) {
            Some(peer) => {
                peer.update_advert(rssi, name, now);
                false
            }
            None => {
                inner.peers.insert(mac, Peer::from_advert(mac, rssi, name, now));
                true
            }
        };

        if created && inner.peers.len() > self.capacity {
            Self::evict_oldest(inner);
        }
        created
    }

    /// Drop the oldest-seen fifth of idle Discovered records
    fn evict_oldest(inner: &mut Inner) {
        let mut idle: Vec<(Instant, MacAddress)> = inner
            .peers
            .values()
            .filter(|p| p.state == PeerState::Discovered)
            .map(|p| (p.seen_at, p.mac))
            .collect();
        idle.sort();

        let count = (idle.len() / 5).max(1).min(idle.len());
        for (_, mac) in idle.into_iter().take(count) {
            if let Some(peer) = inner.peers.remove(&mac) {
                if let Some(identity) = peer.identity {
                    inner.by_identity.remove(&identity);
                }
                debug!(peer = %peer.label(), "evicted idle record at registry capacity");
            }
        }
    }

    /// Bind an identity to a MAC, installing the identity index entry.
    ///
    /// Creates the record if the device was never scanned (inbound central).
    /// Handles both rotation directions: a MAC presenting a new identity
    /// replaces the old logical peer, and an identity arriving from a new
    /// MAC drops the record at the old address.
    pub fn bind_identity(&self, mac: MacAddress, identity: Identity, now: Instant) -> BindOutcome {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let record = inner
            .peers
            .entry(mac)
            .or_insert_with(|| Peer::from_inbound(mac, now));
        let previous = record.identity;
        record.seen_at = now;

        if previous == Some(identity) {
            return BindOutcome::AlreadyBound;
        }

        record.identity = Some(identity);
        if let Some(existing) = previous {
            inner.by_identity.remove(&existing);
            warn!(
                mac = %mac,
                old = %existing.short(),
                new = %identity.short(),
                "peer presented a different identity"
            );
        }

        match inner.by_identity.insert(identity, mac) {
            Some(old_mac) if old_mac != mac => {
                inner.peers.remove(&old_mac);
                debug!(
                    identity = %identity.short(),
                    old_mac = %old_mac,
                    new_mac = %mac,
                    "identity moved to a new address"
                );
                BindOutcome::ReplacedMac { previous_mac: old_mac }
            }
            _ => match previous {
                Some(existing) => BindOutcome::ReplacedIdentity { previous: existing },
                None => BindOutcome::Bound,
            },
        }
    }

    /// Snapshot one record by MAC
    pub fn get(&self, mac: &MacAddress) -> Option<Peer> {
        self.inner.lock().peers.get(mac).cloned()
    }

    /// Snapshot one record by identity
    pub fn get_by_identity(&self, identity: &Identity) -> Option<Peer> {
        let inner = self.inner.lock();
        inner
            .by_identity
            .get(identity)
            .and_then(|mac| inner.peers.get(mac))
            .cloned()
    }

    /// Identity bound to a MAC, if learned
    pub fn identity_of(&self, mac: &MacAddress) -> Option<Identity> {
        self.inner.lock().peers.get(mac).and_then(|p| p.identity)
    }

    /// MAC currently carrying an identity
    pub fn mac_of(&self, identity: &Identity) -> Option<MacAddress> {
        self.inner.lock().by_identity.get(identity).copied()
    }

    /// Move a peer from one state to another; fails when the record is
    /// missing or not in the expected state
    pub fn transition(
        &self,
        mac: MacAddress,
        expected: PeerState,
        to: PeerState,
    ) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let peer = inner
            .peers
            .get_mut(&mac)
            .ok_or(RegistryError::UnknownPeer(mac))?;
        if peer.state != expected {
            return Err(RegistryError::InvalidTransition {
                mac,
                expected,
                actual: peer.state,
            });
        }
        peer.state = to;
        Ok(())
    }

    /// Force a peer into a state regardless of its current one.
    /// Used on teardown paths where the previous state is already gone.
    pub fn force_state(&self, mac: MacAddress, to: PeerState) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let peer = inner
            .peers
            .get_mut(&mac)
            .ok_or(RegistryError::UnknownPeer(mac))?;
        peer.state = to;
        Ok(())
    }

    /// Record the start of a dial attempt
    pub fn record_attempt(&self, mac: MacAddress, now: Instant) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let peer = inner
            .peers
            .get_mut(&mac)
            .ok_or(RegistryError::UnknownPeer(mac))?;
        peer.record_attempt(now);
        Ok(())
    }

    /// Mark an inbound link from a central that dialed us. Creates the
    /// record when the device was never scanned.
    pub fn mark_inbound(&self, mac: MacAddress, now: Instant) {
        let mut inner = self.inner.lock();
        match inner.peers.get_mut(&mac) {
            Some(peer) => {
                peer.seen_at = now;
                peer.state = PeerState::HandshakePending;
            }
            None => {
                inner.peers.insert(mac, Peer::from_inbound(mac, now));
            }
        }
    }

    /// Clear the failure streak and any blacklist after a link reached
    /// Active. Attempt counters are untouched.
    pub fn clear_failures(&self, mac: MacAddress) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let peer = inner
            .peers
            .get_mut(&mac)
            .ok_or(RegistryError::UnknownPeer(mac))?;
        peer.consecutive_failures = 0;
        peer.blacklisted_until = None;
        Ok(())
    }

    /// Record a connection that reached Active; clears any blacklist
    pub fn record_success(&self, mac: MacAddress) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        let peer = inner
            .peers
            .get_mut(&mac)
            .ok_or(RegistryError::UnknownPeer(mac))?;
        peer.record_success();
        Ok(())
    }

    /// Record a failed attempt; applies the blacklist policy and returns the
    /// backoff deadline when it triggered
    pub fn record_failure(
        &self,
        mac: MacAddress,
        now: Instant,
        policy: &BlacklistPolicy,
    ) -> Result<Option<Instant>, RegistryError> {
        let mut inner = self.inner.lock();
        let peer = inner
            .peers
            .get_mut(&mac)
            .ok_or(RegistryError::UnknownPeer(mac))?;
        peer.record_failure();

        match policy.duration_for(peer.consecutive_failures) {
            Some(backoff) => {
                let until = now + backoff;
                peer.blacklisted_until = Some(until);
                peer.state = PeerState::Blacklisted;
                warn!(
                    peer = %peer.label(),
                    failures = peer.consecutive_failures,
                    backoff_secs = backoff.as_secs(),
                    "peer blacklisted"
                );
                Ok(Some(until))
            }
            None => Ok(None),
        }
    }

    /// Expire blacklists and release stale Discovered records
    pub fn sweep(&self, now: Instant, stale_timeout: Duration) -> SweepReport {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut report = SweepReport::default();

        for peer in inner.peers.values_mut() {
            if peer.state == PeerState::Blacklisted && !peer.is_blacklisted(now) {
                peer.state = PeerState::Discovered;
                peer.blacklisted_until = None;
                report.expired_blacklists += 1;
                debug!(peer = %peer.label(), "blacklist expired");
            }
        }

        let stale: Vec<MacAddress> = inner
            .peers
            .values()
            .filter(|p| {
                p.state == PeerState::Discovered && now.duration_since(p.seen_at) > stale_timeout
            })
            .map(|p| p.mac)
            .collect();
        for mac in stale {
            if let Some(peer) = inner.peers.remove(&mac) {
                if let Some(identity) = peer.identity {
                    inner.by_identity.remove(&identity);
                }
                report.released += 1;
            }
        }

        report
    }

    /// Snapshot of all records, for selection and introspection
    pub fn snapshot(&self) -> Vec<Peer> {
        self.inner.lock().peers.values().cloned().collect()
    }

    /// Number of peers currently Active
    pub fn active_count(&self) -> usize {
        self.inner
            .lock()
            .peers
            .values()
            .filter(|p| p.state == PeerState::Active)
            .count()
    }

    /// Total records held
    pub fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// Whether the registry holds no records
    pub fn is_empty(&self) -> bool {
        self.inner.lock().peers.is_empty()
    }
}
