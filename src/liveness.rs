//! # Peer Liveness Roster
//!
//! Tracks which peers are online from their heartbeat broadcasts. Entries
//! are never explicitly deleted; "online" is computed on demand as
//! last-seen within the liveness threshold. The table is LRU-bounded so a
//! churning swarm of short-lived identities cannot grow it without limit.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::identity::Identity;

/// Upper bound on tracked peers.
const MAX_TRACKED_PEERS: usize = 1024;

#[derive(Clone, Debug)]
struct PeerInfo {
    last_seen_ms: u64,
    endpoint: String,
}

/// One peer visible in the roster, with its advertised endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnlinePeer {
    pub identity: Identity,
    pub endpoint: String,
}

/// Heartbeat-driven peer table. Mutated only by the heartbeat handler;
/// readers take point-in-time snapshots via [`PeerRoster::online_nodes`].
pub struct PeerRoster {
    own_identity: Identity,
    threshold_ms: u64,
    peers: LruCache<Identity, PeerInfo>,
}

impl PeerRoster {
    pub fn new(own_identity: Identity, threshold_ms: u64) -> Self {
        let capacity = NonZeroUsize::new(MAX_TRACKED_PEERS)
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            own_identity,
            threshold_ms,
            peers: LruCache::new(capacity),
        }
    }

    /// Record a heartbeat. Own heartbeats echoed back by the bus are
    /// ignored.
    pub fn observe(&mut self, peer: Identity, endpoint: String, now_ms: u64) {
        if peer == self.own_identity {
            return;
        }
        self.peers.put(
            peer,
            PeerInfo {
                last_seen_ms: now_ms,
                endpoint,
            },
        );
    }

    /// Peers seen within the threshold, as of `now_ms`.
    pub fn online_nodes(&self, now_ms: u64) -> Vec<Identity> {
        self.peers
            .iter()
            .filter(|(_, info)| now_ms.saturating_sub(info.last_seen_ms) <= self.threshold_ms)
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Online peers with their advertised endpoints, for telemetry and
    /// client routing.
    pub fn online_peers(&self, now_ms: u64) -> Vec<OnlinePeer> {
        self.peers
            .iter()
            .filter(|(_, info)| now_ms.saturating_sub(info.last_seen_ms) <= self.threshold_ms)
            .map(|(peer, info)| OnlinePeer {
                identity: *peer,
                endpoint: info.endpoint.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    #[test]
    fn peer_is_online_within_threshold() {
        let mut roster = PeerRoster::new(identity(0), 60_000);
        roster.observe(identity(1), "http://a".to_string(), 1_000);

        assert_eq!(roster.online_nodes(2_000), vec![identity(1)]);
    }

    #[test]
    fn stale_peer_drops_out_without_deletion() {
        let mut roster = PeerRoster::new(identity(0), 60_000);
        roster.observe(identity(1), "http://a".to_string(), 1_000);

        assert!(roster.online_nodes(100_000).is_empty());

        // A fresh heartbeat brings it back.
        roster.observe(identity(1), "http://a".to_string(), 100_000);
        assert_eq!(roster.online_nodes(100_500), vec![identity(1)]);
    }

    #[test]
    fn own_heartbeats_are_filtered() {
        let own = identity(9);
        let mut roster = PeerRoster::new(own, 60_000);
        roster.observe(own, "http://self".to_string(), 1_000);

        assert!(roster.online_nodes(1_000).is_empty());
    }

    #[test]
    fn endpoint_updates_with_latest_heartbeat() {
        let mut roster = PeerRoster::new(identity(0), 60_000);
        roster.observe(identity(1), "http://old".to_string(), 1_000);
        roster.observe(identity(1), "http://new".to_string(), 2_000);

        let peers = roster.online_peers(2_500);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].endpoint, "http://new");
    }
}
