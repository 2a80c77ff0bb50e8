//! Per-peer reassembly store
//!
//! Each identified peer owns at most one in-flight partial packet. Fragments
//! arrive in order on the GATT link, but the store still tolerates repeated
//! STARTs (sender restarted a packet) and duplicate fragments (link-layer
//! retransmits). Buffers are bounded in bytes and discarded by the periodic
//! sweep once they go quiet.

use crate::identity::Identity;
use crate::wire::fragment::{Fragment, FragmentError};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of feeding one fragment into a peer's buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reassembly {
    /// More fragments are needed
    Incomplete,
    /// The packet is complete; the buffer has been cleared
    Complete(Vec<u8>),
}

/// Diagnostic counters kept per peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub packets_reassembled: u64,
    pub packets_timed_out: u64,
    pub fragments_received: u64,
}

/// One in-flight partial packet
#[derive(Debug)]
struct Buffer {
    total: u16,
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    bytes_buffered: usize,
    started_at: Instant,
    last_update_at: Instant,
}

impl Buffer {
    fn new(total: u16, now: Instant) -> Self {
        Self {
            total,
            slots: vec![None; total as usize],
            received: 0,
            bytes_buffered: 0,
            started_at: now,
            last_update_at: now,
        }
    }

    fn insert(&mut self, seq: u16, payload: Vec<u8>, now: Instant) {
        let slot = &mut self.slots[seq as usize];
        if let Some(existing) = slot.take() {
            // Duplicate: overwrite idempotently
            self.bytes_buffered -= existing.len();
            self.received -= 1;
        }
        self.bytes_buffered += payload.len();
        self.received += 1;
        *slot = Some(payload);
        self.last_update_at = now;
    }

    fn is_complete(&self) -> bool {
        self.received == self.total as usize
    }

    fn join(self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(self.bytes_buffered);
        for slot in self.slots {
            if let Some(payload) = slot {
                packet.extend_from_slice(&payload);
            }
        }
        packet
    }
}

/// Per-peer state: the live buffer plus counters that outlive it
#[derive(Debug, Default)]
struct PeerEntry {
    buffer: Option<Buffer>,
    stats: ReassemblyStats,
}

/// Reassembly buffers for all identified peers, keyed by identity
#[derive(Debug)]
pub struct ReassemblyStore {
    peers: HashMap<Identity, PeerEntry>,
    timeout: Duration,
    max_inflight_bytes: usize,
}

impl ReassemblyStore {
    /// Create a store with the given quiet-buffer timeout and per-peer byte cap
    pub fn new(timeout: Duration, max_inflight_bytes: usize) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
            max_inflight_bytes,
        }
    }

    /// Register a peer so invariant checks and stats have a home.
    /// Idempotent; existing state is untouched.
    pub fn attach(&mut self, identity: Identity) {
        self.peers.entry(identity).or_default();
    }

    /// Whether a peer is attached
    pub fn contains(&self, identity: &Identity) -> bool {
        self.peers.contains_key(identity)
    }

    /// Drop a peer's buffer and counters entirely
    pub fn release(&mut self, identity: &Identity) {
        self.peers.remove(identity);
    }

    /// Number of attached peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the store has no attached peers
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Counters for one peer
    pub fn stats(&self, identity: &Identity) -> Option<ReassemblyStats> {
        self.peers.get(identity).map(|e| e.stats)
    }

    /// Number of in-flight partial packets across all peers
    pub fn pending(&self) -> usize {
        self.peers.values().filter(|e| e.buffer.is_some()).count()
    }

    /// Feed raw wire bytes from a peer into its buffer.
    ///
    /// On any error the peer's buffer is dropped; the upper stack's
    /// retransmission recovers the packet.
    pub fn ingest(
        &mut self,
        identity: Identity,
        bytes: &[u8],
        now: Instant,
    ) -> Result<Reassembly, FragmentError> {
        let fragment = match Fragment::from_bytes(bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                if let Some(entry) = self.peers.get_mut(&identity) {
                    entry.buffer = None;
                }
                return Err(e);
            }
        };
        self.ingest_fragment(identity, fragment, now)
    }

    /// Feed one parsed fragment into a peer's buffer
    pub fn ingest_fragment(
        &mut self,
        identity: Identity,
        fragment: Fragment,
        now: Instant,
    ) -> Result<Reassembly, FragmentError> {
        let entry = self.peers.entry(identity).or_default();
        entry.stats.fragments_received += 1;

        if fragment.is_start() {
            if fragment.seq != 0 {
                entry.buffer = None;
                return Err(FragmentError::FragmentInconsistent(format!(
                    "start fragment with seq {}",
                    fragment.seq
                )));
            }
            // A re-arriving START supersedes whatever was in flight
            if entry.buffer.is_some() {
                debug!(peer = %identity.short(), "restarting reassembly on new start fragment");
            }
            entry.buffer = Some(Buffer::new(fragment.total, now));
        } else if entry.buffer.is_none() {
            if fragment.is_end() {
                // Nothing buffered and the packet is supposedly over
                return Err(FragmentError::ReassemblyGap {
                    received: 0,
                    total: fragment.total as usize,
                });
            }
            // Mid-fragment before its start (lost or late); buffer it and
            // wait for the rest
            entry.buffer = Some(Buffer::new(fragment.total, now));
        }

        let buffer = entry.buffer.as_mut().expect("buffer installed above");

        if buffer.total != fragment.total {
            let (buffered, got) = (buffer.total, fragment.total);
            entry.buffer = None;
            return Err(FragmentError::FragmentInconsistent(format!(
                "total mismatch: buffered {}, got {}",
                buffered, got
            )));
        }

        if buffer.bytes_buffered + fragment.payload.len() > self.max_inflight_bytes {
            entry.buffer = None;
            return Err(FragmentError::ReassemblyOverflow {
                limit: self.max_inflight_bytes,
            });
        }

        let is_end = fragment.is_end();
        buffer.insert(fragment.seq, fragment.payload, now);

        if buffer.is_complete() {
            let buffer = entry.buffer.take().expect("complete buffer present");
            entry.stats.packets_reassembled += 1;
            let packet = buffer.join();
            debug!(
                peer = %identity.short(),
                bytes = packet.len(),
                packets = entry.stats.packets_reassembled,
                "reassembled packet"
            );
            return Ok(Reassembly::Complete(packet));
        }

        if is_end {
            // The last fragment arrived but earlier slots are missing
            let (received, total) = (buffer.received, buffer.total as usize);
            entry.buffer = None;
            return Err(FragmentError::ReassemblyGap { received, total });
        }

        Ok(Reassembly::Incomplete)
    }

    /// Discard buffers that have gone quiet past the timeout.
    /// Returns the number of buffers dropped.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut dropped = 0;
        for (identity, entry) in self.peers.iter_mut() {
            let stale = entry
                .buffer
                .as_ref()
                .map(|b| now.duration_since(b.last_update_at) > self.timeout)
                .unwrap_or(false);
            if stale {
                let buffer = entry.buffer.take().expect("stale buffer present");
                entry.stats.packets_timed_out += 1;
                dropped += 1;
                warn!(
                    peer = %identity.short(),
                    received = buffer.received,
                    total = buffer.total,
                    age_secs = now.duration_since(buffer.started_at).as_secs(),
                    "discarding stale reassembly buffer"
                );
            }
        }
        dropped
    }
}
