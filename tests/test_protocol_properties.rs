//! Property tests for the protocol core
//!
//! Three families: fragmentation round-trips for arbitrary packet/MTU
//! pairs, random connect/disconnect interleavings leaving no orphaned
//! state, and dial selection never exceeding the active-peer budget.

use bluemesh_core::identity::{Identity, MacAddress};
use bluemesh_core::link::orchestrator::Orchestrator;
use bluemesh_core::peer::record::{Peer, PeerState};
use bluemesh_core::peer::registry::{BlacklistPolicy, PeerRegistry};
use bluemesh_core::peer::selection::{select_candidates, SelectionParams};
use bluemesh_core::wire::fragment::{Fragment, Fragmenter};
use bluemesh_core::wire::reassembly::{Reassembly, ReassemblyStore};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn mac(i: u8) -> MacAddress {
    MacAddress::new([0xB8, 0x27, 0xEB, 0x00, 0x00, i])
}

fn identity(i: u8) -> Identity {
    let mut raw = [0u8; 16];
    raw[0] = i;
    Identity::new(raw)
}

proptest! {
    #[test]
    fn prop_fragment_roundtrip(
        packet in proptest::collection::vec(any::<u8>(), 0..4096),
        mtu in 23u16..=517,
    ) {
        let fragmenter = Fragmenter::new(mtu).expect("valid MTU");
        let fragments = fragmenter.fragment(&packet).expect("fragmentation");

        let payload_size = mtu as usize - 5;
        let expected = if packet.is_empty() {
            1
        } else {
            (packet.len() + payload_size - 1) / payload_size
        };
        prop_assert_eq!(fragments.len(), expected);

        let mut store = ReassemblyStore::new(Duration::from_secs(30), 64 * 1024);
        let now = Instant::now();
        let peer = identity(1);

        let mut complete = None;
        for fragment in fragments {
            match store.ingest_fragment(peer, fragment, now).expect("ingest") {
                Reassembly::Complete(bytes) => {
                    prop_assert!(complete.is_none());
                    complete = Some(bytes);
                }
                Reassembly::Incomplete => prop_assert!(complete.is_none()),
            }
        }

        prop_assert_eq!(complete.expect("packet completes"), packet);
        prop_assert_eq!(store.pending(), 0);
    }

    #[test]
    fn prop_fragment_wire_form_roundtrips(
        packet in proptest::collection::vec(any::<u8>(), 1..512),
        mtu in 23u16..=185,
    ) {
        let fragmenter = Fragmenter::new(mtu).expect("valid MTU");
        for fragment in fragmenter.fragment(&packet).expect("fragmentation") {
            let wire = fragment.to_bytes();
            prop_assert!(wire.len() <= mtu as usize);
            let parsed = Fragment::from_bytes(&wire).expect("parse");
            prop_assert_eq!(parsed, fragment);
        }
    }
}

/// One step of a random connection trace
#[derive(Debug, Clone, Copy)]
enum Op {
    Discover(u8),
    Dial(u8),
    LinkUp(u8),
    Activate(u8),
    Drop(u8),
    Fail(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    (0u8..6, 0u8..5).prop_map(|(kind, peer)| match kind {
        0 => Op::Discover(peer),
        1 => Op::Dial(peer),
        2 => Op::LinkUp(peer),
        3 => Op::Activate(peer),
        4 => Op::Drop(peer),
        _ => Op::Fail(peer),
    })
}

/// Mirrors the engine's link bookkeeping around the orchestrator, the way
/// the event loop installs and releases resources
struct Harness {
    registry: Arc<PeerRegistry>,
    orchestrator: Orchestrator,
    store: ReassemblyStore,
    links: HashMap<MacAddress, Identity>,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(PeerRegistry::new(100));
        let orchestrator = Orchestrator::new(registry.clone(), BlacklistPolicy::default());
        Self {
            registry,
            orchestrator,
            store: ReassemblyStore::new(Duration::from_secs(30), 64 * 1024),
            links: HashMap::new(),
        }
    }

    fn apply(&mut self, op: Op, now: Instant) {
        match op {
            Op::Discover(i) => {
                self.registry.upsert_from_advert(mac(i), -60, None, now);
            }
            Op::Dial(i) => {
                let _ = self.orchestrator.begin_dial(mac(i), now);
            }
            Op::LinkUp(i) => {
                let _ = self.orchestrator.link_up(mac(i));
            }
            Op::Activate(i) => {
                let pending = self
                    .registry
                    .get(&mac(i))
                    .map(|p| p.state == PeerState::HandshakePending)
                    .unwrap_or(false);
                if pending && self.orchestrator.activate(mac(i)).is_ok() {
                    self.registry.bind_identity(mac(i), identity(i), now);
                    self.links.insert(mac(i), identity(i));
                    self.store.attach(identity(i));
                }
            }
            Op::Drop(i) => {
                let had_link = self.links.remove(&mac(i));
                if let Some(id) = had_link {
                    self.store.release(&id);
                }
                let connecting = self.orchestrator.connecting().contains(&mac(i));
                if had_link.is_some() || connecting {
                    self.orchestrator.begin_teardown(mac(i));
                    self.orchestrator
                        .finish_teardown(mac(i), had_link.is_some(), false, now);
                }
            }
            Op::Fail(i) => {
                if self.orchestrator.connecting().contains(&mac(i)) {
                    self.orchestrator.begin_teardown(mac(i));
                    self.orchestrator.finish_teardown(mac(i), false, true, now);
                }
            }
        }
    }

    fn check_invariants(&self) -> Result<(), TestCaseError> {
        for peer in self.registry.snapshot() {
            prop_assert!(
                peer.attempts_success <= peer.attempts_total,
                "success {} > total {} for {}",
                peer.attempts_success,
                peer.attempts_total,
                peer.mac
            );

            let in_set = self.orchestrator.connecting().contains(&peer.mac);
            if !peer.state.is_connecting() {
                prop_assert!(
                    !in_set,
                    "{} in connecting-set while {}",
                    peer.mac,
                    peer.state
                );
            }

            let has_link = self.links.contains_key(&peer.mac);
            if peer.state == PeerState::Active {
                prop_assert!(has_link, "active {} without link", peer.mac);
            }
        }

        // Every reassembler belongs to a live link
        for (mac, id) in &self.links {
            prop_assert!(self.store.contains(id), "link {} lost its reassembler", mac);
        }
        prop_assert_eq!(
            self.store.len(),
            self.links.len(),
            "reassemblers outlive links"
        );
        Ok(())
    }
}

proptest! {
    #[test]
    fn prop_interleavings_leave_no_orphans(
        ops in proptest::collection::vec(op_strategy(), 1..80),
    ) {
        let mut harness = Harness::new();
        let base = Instant::now();

        for (step, op) in ops.into_iter().enumerate() {
            let now = base + Duration::from_millis(step as u64 * 100);
            harness.apply(op, now);
            harness.check_invariants()?;
        }
    }
}

/// (rssi, state tag, attempts, age in seconds, blacklist expired?)
type PeerSpec = (i16, u8, u32, u64, bool);

fn peer_spec() -> impl Strategy<Value = PeerSpec> {
    (-100i16..=-30, 0u8..6, 0u32..10, 0u64..40, any::<bool>())
}

proptest! {
    #[test]
    fn prop_selection_never_exceeds_budget(
        specs in proptest::collection::vec(peer_spec(), 0..40),
        max_peers in 1usize..=10,
    ) {
        let base = Instant::now();
        let now = base + Duration::from_secs(60);

        let peers: Vec<Peer> = specs
            .into_iter()
            .enumerate()
            .map(|(i, (rssi, state_tag, attempts, age_secs, expired))| {
                let seen_at = base + Duration::from_secs(60 - age_secs);
                let mut peer = Peer::from_advert(mac(i as u8 + 1), rssi, None, seen_at);
                peer.attempts_total = attempts;
                peer.attempts_success = attempts / 2;
                peer.state = match state_tag {
                    0 | 1 => PeerState::Discovered,
                    2 => PeerState::Dialing,
                    3 => PeerState::Active,
                    4 => PeerState::HandshakePending,
                    _ => PeerState::Blacklisted,
                };
                if peer.state == PeerState::Blacklisted {
                    peer.blacklisted_until = Some(if expired {
                        now - Duration::from_secs(1)
                    } else {
                        now + Duration::from_secs(60)
                    });
                }
                peer
            })
            .collect();

        let params = SelectionParams {
            max_peers,
            min_rssi: -85,
            connect_rate_limit: Duration::from_secs(5),
            local_mac: Some(mac(0)),
        };

        let selected = select_candidates(&peers, &params, now);
        let active = peers.iter().filter(|p| p.state == PeerState::Active).count();

        // Strict upper bound: live links plus new dials never pass the cap
        prop_assert!(selected.len() <= max_peers.saturating_sub(active));

        // No duplicates, and every pick is a currently dialable record
        for (i, chosen) in selected.iter().enumerate() {
            prop_assert!(!selected[..i].contains(chosen));
            let peer = peers.iter().find(|p| p.mac == *chosen).expect("selected from input");
            prop_assert!(matches!(
                peer.state,
                PeerState::Discovered | PeerState::Blacklisted
            ));
            prop_assert!(peer.rssi_last >= -85);
            prop_assert!(!peer.is_blacklisted(now));
        }
    }
}
