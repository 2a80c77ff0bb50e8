//! Dial selection: scoring and candidate ranking
//!
//! Each discovery cycle, Discovered peers are scored and the best are
//! dialed up to the active-peer budget. Scoring weights signal strength
//! highest (it predicts link quality better than history), then connection
//! history, then a freshness bonus that doubles as a staleness cutoff.

use crate::identity::MacAddress;
use crate::link::arbiter::{choose_role, LinkRole};
use crate::peer::record::{Peer, PeerState};
use std::time::{Duration, Instant};
use tracing::trace;

/// Freshness window granting full points
const FRESH_FULL: Duration = Duration::from_secs(5);
/// Peers not seen within this window score zero freshness and are excluded
const FRESH_CUTOFF: Duration = Duration::from_secs(30);

/// Inputs to one selection pass
#[derive(Debug, Clone, Copy)]
pub struct SelectionParams {
    /// Active-peer budget
    pub max_peers: usize,
    /// Advertisement signal floor
    pub min_rssi: i16,
    /// Minimum interval between dials to one peer
    pub connect_rate_limit: Duration,
    /// Our adapter address; when unknown, direction arbitration is skipped
    /// and we dial any eligible peer
    pub local_mac: Option<MacAddress>,
}

/// Priority score for a discovered peer, 0-145.
///
/// - RSSI: 0-70, linear over the clamped range [-100, -30] dBm
/// - History: 0-50 from the success rate; 25 for never-attempted peers
/// - Freshness: 25 within 5 s of last sighting, decaying to 0 at 30 s
pub fn score_peer(peer: &Peer, now: Instant) -> f64 {
    let rssi = peer.rssi_last.clamp(-100, -30) as f64;
    let signal = rssi + 100.0;

    let history = if peer.attempts_total == 0 {
        25.0
    } else {
        50.0 * peer.success_rate()
    };

    let age = now.saturating_duration_since(peer.seen_at);
    let freshness = if age <= FRESH_FULL {
        25.0
    } else if age < FRESH_CUTOFF {
        25.0 * (1.0 - (age - FRESH_FULL).as_secs_f64() / 25.0)
    } else {
        0.0
    };

    signal + history + freshness
}

/// Whether a peer may be dialed at all this cycle
fn eligible(peer: &Peer, params: &SelectionParams, now: Instant) -> bool {
    // Only idle records are dialable; an expired blacklist counts as idle
    // even before the sweep resets it
    let idle = match peer.state {
        PeerState::Discovered => true,
        PeerState::Blacklisted => !peer.is_blacklisted(now),
        _ => false,
    };
    if !idle || peer.is_blacklisted(now) {
        return false;
    }
    if peer.rssi_last < params.min_rssi {
        return false;
    }
    if now.saturating_duration_since(peer.seen_at) > FRESH_CUTOFF {
        return false;
    }
    if !peer.dial_allowed(now, params.connect_rate_limit) {
        return false;
    }
    if let Some(local) = params.local_mac {
        if choose_role(local, peer.mac) != Some(LinkRole::Initiate) {
            return false;
        }
    }
    true
}

/// Rank eligible peers and return the MACs to dial this cycle, bounded by
/// the free connection slots. Ties break on stronger RSSI, then lower MAC.
pub fn select_candidates(
    peers: &[Peer],
    params: &SelectionParams,
    now: Instant,
) -> Vec<MacAddress> {
    let active = peers.iter().filter(|p| p.state == PeerState::Active).count();
    let slots = params.max_peers.saturating_sub(active);
    if slots == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(f64, &Peer)> = peers
        .iter()
        .filter(|p| eligible(p, params, now))
        .map(|p| (score_peer(p, now), p))
        .collect();

    scored.sort_by(|(score_a, peer_a), (score_b, peer_b)| {
        score_b
            .partial_cmp(score_a)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(peer_b.rssi_last.cmp(&peer_a.rssi_last))
            .then(peer_a.mac.cmp(&peer_b.mac))
    });

    for (score, peer) in scored.iter().take(slots) {
        trace!(peer = %peer.label(), score = %format!("{:.1}", score), "dial candidate");
    }

    scored
        .into_iter()
        .take(slots)
        .map(|(_, peer)| peer.mac)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddress {
        MacAddress::new([0xB8, 0x27, 0xEB, 0x00, 0x00, last])
    }

    fn peer(last: u8, rssi: i16, now: Instant) -> Peer {
        Peer::from_advert(mac(last), rssi, None, now)
    }

    fn params() -> SelectionParams {
        SelectionParams {
            max_peers: 7,
            min_rssi: -85,
            connect_rate_limit: Duration::from_secs(5),
            local_mac: None,
        }
    }

    #[test]
    fn test_score_rssi_component() {
        let now = Instant::now();

        // Floor and ceiling of the clamp range
        let weak = peer(1, -100, now);
        let strong = peer(2, -30, now);
        assert_eq!(score_peer(&weak, now), 0.0 + 25.0 + 25.0);
        assert_eq!(score_peer(&strong, now), 70.0 + 25.0 + 25.0);

        // Out-of-range values clamp rather than extrapolate
        let very_weak = peer(3, -120, now);
        let very_strong = peer(4, -10, now);
        assert_eq!(score_peer(&very_weak, now), score_peer(&weak, now));
        assert_eq!(score_peer(&very_strong, now), score_peer(&strong, now));
    }

    #[test]
    fn test_score_history_component() {
        let now = Instant::now();

        let fresh = peer(1, -100, now);
        assert_eq!(score_peer(&fresh, now), 25.0 + 25.0);

        let mut reliable = peer(2, -100, now);
        reliable.attempts_total = 4;
        reliable.attempts_success = 4;
        assert_eq!(score_peer(&reliable, now), 50.0 + 25.0);

        let mut flaky = peer(3, -100, now);
        flaky.attempts_total = 4;
        flaky.attempts_success = 1;
        assert_eq!(score_peer(&flaky, now), 12.5 + 25.0);

        let mut hopeless = peer(4, -100, now);
        hopeless.attempts_total = 4;
        hopeless.attempts_success = 0;
        assert_eq!(score_peer(&hopeless, now), 25.0);
    }

    #[test]
    fn test_score_freshness_decay() {
        let base = Instant::now();
        let p = peer(1, -100, base);

        assert_eq!(score_peer(&p, base + Duration::from_secs(5)), 50.0);
        // Midpoint of the decay window
        let mid = score_peer(&p, base + Duration::from_millis(17_500));
        assert!((mid - (25.0 + 12.5)).abs() < 0.01);
        assert_eq!(score_peer(&p, base + Duration::from_secs(30)), 25.0);
        assert_eq!(score_peer(&p, base + Duration::from_secs(300)), 25.0);
    }

    #[test]
    fn test_max_score_is_145() {
        let now = Instant::now();
        let mut best = peer(1, -30, now);
        best.attempts_total = 10;
        best.attempts_success = 10;
        assert_eq!(score_peer(&best, now), 145.0);
    }

    #[test]
    fn test_selection_respects_slots() {
        let now = Instant::now();
        let mut peers: Vec<Peer> = (1..=9).map(|i| peer(i, -60, now)).collect();
        // Two slots taken by active links
        peers[7].state = PeerState::Active;
        peers[8].state = PeerState::Active;

        let mut p = params();
        p.max_peers = 4;
        let selected = select_candidates(&peers, &p, now);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_selection_empty_when_at_capacity() {
        let now = Instant::now();
        let mut peers: Vec<Peer> = (1..=3).map(|i| peer(i, -60, now)).collect();
        peers[2].state = PeerState::Active;

        let mut p = params();
        p.max_peers = 1;
        assert!(select_candidates(&peers, &p, now).is_empty());
    }

    #[test]
    fn test_selection_filters_weak_rssi() {
        let now = Instant::now();
        let peers = vec![peer(1, -90, now), peer(2, -84, now)];

        let selected = select_candidates(&peers, &params(), now);
        assert_eq!(selected, vec![mac(2)]);
    }

    #[test]
    fn test_selection_excludes_busy_states() {
        let now = Instant::now();
        let mut peers: Vec<Peer> = (1..=5).map(|i| peer(i, -60, now)).collect();
        peers[1].state = PeerState::Dialing;
        peers[2].state = PeerState::HandshakePending;
        peers[3].state = PeerState::Active;
        peers[4].state = PeerState::Disconnecting;

        let selected = select_candidates(&peers, &params(), now);
        assert_eq!(selected, vec![mac(1)]);
    }

    #[test]
    fn test_selection_excludes_blacklisted_until_deadline() {
        let base = Instant::now();
        let mut p = peer(1, -60, base);
        p.state = PeerState::Blacklisted;
        p.blacklisted_until = Some(base + Duration::from_secs(80));

        let peers = vec![p];
        assert!(select_candidates(&peers, &params(), base + Duration::from_secs(30)).is_empty());
        assert!(select_candidates(&peers, &params(), base + Duration::from_secs(79)).is_empty());

        // Past the deadline the peer is a candidate again, even before the
        // sweep resets its state, but only if still fresh, so refresh it
        let mut fresh = peers[0].clone();
        fresh.seen_at = base + Duration::from_secs(80);
        let selected = select_candidates(&[fresh], &params(), base + Duration::from_secs(81));
        assert_eq!(selected, vec![mac(1)]);
    }

    #[test]
    fn test_selection_rate_limits_redials() {
        let base = Instant::now();
        let mut p = peer(1, -60, base);
        p.record_attempt(base);
        p.seen_at = base + Duration::from_secs(3);

        let peers = vec![p];
        assert!(select_candidates(&peers, &params(), base + Duration::from_secs(3)).is_empty());
        let selected = select_candidates(&peers, &params(), base + Duration::from_secs(5));
        assert_eq!(selected, vec![mac(1)]);
    }

    #[test]
    fn test_selection_excludes_stale_sightings() {
        let base = Instant::now();
        let peers = vec![peer(1, -60, base)];

        assert!(!select_candidates(&peers, &params(), base + Duration::from_secs(29)).is_empty());
        assert!(select_candidates(&peers, &params(), base + Duration::from_secs(31)).is_empty());
    }

    #[test]
    fn test_selection_honors_direction_arbiter() {
        let now = Instant::now();
        let peers = vec![peer(0x10, -60, now), peer(0x30, -60, now)];

        let mut p = params();
        p.local_mac = Some(mac(0x20));
        // We only initiate toward the higher MAC
        let selected = select_candidates(&peers, &p, now);
        assert_eq!(selected, vec![mac(0x30)]);
    }

    #[test]
    fn test_selection_without_local_mac_dials_any() {
        let now = Instant::now();
        let peers = vec![peer(0x10, -60, now), peer(0x30, -60, now)];

        let selected = select_candidates(&peers, &params(), now);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn test_ranking_prefers_score_then_rssi_then_mac() {
        let now = Instant::now();

        let mut strong = peer(5, -40, now);
        strong.attempts_total = 2;
        strong.attempts_success = 2;

        let weak = peer(1, -80, now);

        // Same score inputs, different MACs: lower MAC wins the tie
        let tie_a = peer(3, -60, now);
        let tie_b = peer(2, -60, now);

        let peers = vec![weak.clone(), tie_a, strong.clone(), tie_b];
        let selected = select_candidates(&peers, &params(), now);

        assert_eq!(selected[0], mac(5));
        assert_eq!(selected[1], mac(2));
        assert_eq!(selected[2], mac(3));
        assert_eq!(selected[3], mac(1));
    }
}
