//! Per-peer record
//!
//! Tracks everything the engine knows about one remote device: discovery
//! freshness, signal strength, connection attempt history, blacklist state,
//! and the lifecycle state machine position.

use crate::identity::{Identity, MacAddress};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;

/// Lifecycle states of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerState {
    /// Seen in an advertisement, no link
    Discovered,
    /// We are dialing as central
    Dialing,
    /// Link is up, identity exchange not finished
    HandshakePending,
    /// Identified, fragmenter and reassembler installed
    Active,
    /// Teardown in progress
    Disconnecting,
    /// Excluded from selection until the backoff deadline
    Blacklisted,
}

impl PeerState {
    /// States in which the peer occupies a slot in the connecting-set
    pub fn is_connecting(&self) -> bool {
        matches!(self, PeerState::Dialing | PeerState::HandshakePending)
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Discovered => write!(f, "Discovered"),
            PeerState::Dialing => write!(f, "Dialing"),
            PeerState::HandshakePending => write!(f, "HandshakePending"),
            PeerState::Active => write!(f, "Active"),
            PeerState::Disconnecting => write!(f, "Disconnecting"),
            PeerState::Blacklisted => write!(f, "Blacklisted"),
        }
    }
}

/// One record per known remote device
#[derive(Debug, Clone)]
pub struct Peer {
    /// Stable identity, learned during the handshake
    pub identity: Option<Identity>,
    /// Device address from the advertisement
    pub mac: MacAddress,
    /// Advertised name, if any
    pub name: Option<String>,
    /// Most recent signal strength in dBm
    pub rssi_last: i16,
    /// When the peer was last seen advertising or handshaking
    pub seen_at: Instant,
    /// Dial attempts ever made to this peer
    pub attempts_total: u32,
    /// Dial attempts that reached Active
    pub attempts_success: u32,
    /// Failures since the last success; drives the blacklist backoff
    pub consecutive_failures: u32,
    /// When we last started a dial
    pub last_attempt_at: Option<Instant>,
    /// Backoff deadline while blacklisted
    pub blacklisted_until: Option<Instant>,
    /// Lifecycle position
    pub state: PeerState,
}

impl Peer {
    /// Create a record from a first advertisement
    pub fn from_advert(mac: MacAddress, rssi: i16, name: Option<String>, now: Instant) -> Self {
        Self {
            identity: None,
            mac,
            name,
            rssi_last: rssi,
            seen_at: now,
            attempts_total: 0,
            attempts_success: 0,
            consecutive_failures: 0,
            last_attempt_at: None,
            blacklisted_until: None,
            state: PeerState::Discovered,
        }
    }

    /// Create a record for a device that connected to us without ever being
    /// scanned (inbound central). No advertisement means no RSSI; the floor
    /// value keeps it out of dial selection until a scan refreshes it.
    pub fn from_inbound(mac: MacAddress, now: Instant) -> Self {
        let mut peer = Self::from_advert(mac, -100, None, now);
        peer.state = PeerState::HandshakePending;
        peer
    }

    /// Refresh signal strength and freshness from a new advertisement
    pub fn update_advert(&mut self, rssi: i16, name: Option<String>, now: Instant) {
        self.rssi_last = rssi;
        if name.is_some() {
            self.name = name;
        }
        self.seen_at = now;
    }

    /// Record the start of a dial attempt
    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts_total += 1;
        self.last_attempt_at = Some(now);
    }

    /// Record a connection that reached Active. Clears any blacklist.
    /// Inbound links have no dial attempt to credit, so the success
    /// counter never outruns the attempt counter.
    pub fn record_success(&mut self) {
        if self.attempts_success < self.attempts_total {
            self.attempts_success += 1;
        }
        self.consecutive_failures = 0;
        self.blacklisted_until = None;
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    /// Fraction of attempts that succeeded, 0.0 when never attempted
    pub fn success_rate(&self) -> f64 {
        if self.attempts_total == 0 {
            0.0
        } else {
            self.attempts_success as f64 / self.attempts_total as f64
        }
    }

    /// Whether a blacklist deadline is still in the future
    pub fn is_blacklisted(&self, now: Instant) -> bool {
        self.blacklisted_until.map(|until| until > now).unwrap_or(false)
    }

    /// Whether the rate limit permits another dial
    pub fn dial_allowed(&self, now: Instant, rate_limit: std::time::Duration) -> bool {
        match self.last_attempt_at {
            Some(at) => now.duration_since(at) >= rate_limit,
            None => true,
        }
    }

    /// Display label: name when advertised, address otherwise
    pub fn label(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.mac.to_string())
    }
}
