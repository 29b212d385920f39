//! # Query Resolution State
//!
//! Per-request consensus tracking for a query this node originated. For a
//! roster of peers snapshotted at query start, the state records which peers
//! have finished responding and which digest entries are still awaiting
//! propagation. The verdict is [`QueryResolutionState::is_ready`]: an empty
//! roster is trivially ready, otherwise every peer must have sent its final
//! response and every flagged entry must have arrived as a verified
//! propagation.
//!
//! Events may arrive out of order. Foreign responses and propagations that
//! land before the node's own digest is set are buffered and replayed, never
//! dropped and never blocked on.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::crypto::ContentHash;
use crate::identity::Identity;
use crate::message::{MessageId, StoredMessage};

type Digest = Vec<(MessageId, ContentHash)>;

/// Resolution tracking for one request id.
pub struct QueryResolutionState {
    /// Peer roster snapshot at query start; value is "final response seen".
    roster: HashMap<Identity, bool>,
    /// This node's own digest, set once.
    primary: Option<HashMap<MessageId, ContentHash>>,
    /// Digest entries some peer has and this node does not, keyed to the
    /// peer expected to propagate them.
    awaiting: HashMap<MessageId, Identity>,
    /// Propagations accepted before the matching foreign digest (or the
    /// primary digest) arrived.
    resolved_early: HashSet<MessageId>,
    /// Foreign responses received before the primary digest was set.
    buffered_responses: Vec<(Identity, Digest, bool)>,
}

impl QueryResolutionState {
    pub fn new(roster: Vec<Identity>) -> Self {
        Self {
            roster: roster.into_iter().map(|peer| (peer, false)).collect(),
            primary: None,
            awaiting: HashMap::new(),
            resolved_early: HashSet::new(),
            buffered_responses: Vec::new(),
        }
    }

    /// Set this node's own digest. Write-once: a second call is ignored.
    /// Replays any foreign responses buffered while the digest was absent.
    pub fn set_primary_digest(&mut self, digest: Digest) {
        if self.primary.is_some() {
            warn!("primary digest set twice, keeping the first");
            return;
        }
        self.primary = Some(digest.into_iter().collect());
        let buffered = std::mem::take(&mut self.buffered_responses);
        for (peer, digest, is_final) in buffered {
            self.on_foreign_response(peer, digest, is_final);
        }
    }

    /// Apply one peer's digest chunk. Entries this node lacks (absent from
    /// the primary digest, or present with different content) are flagged
    /// as awaiting propagation from that peer. The final chunk marks the
    /// peer responded.
    pub fn on_foreign_response(&mut self, peer: Identity, digest: Digest, is_final: bool) {
        let Some(primary) = &self.primary else {
            self.buffered_responses.push((peer, digest, is_final));
            return;
        };
        for (id, hash) in digest {
            if primary.get(&id) == Some(&hash) {
                continue;
            }
            if self.resolved_early.remove(&id) {
                continue;
            }
            debug!(message = %id, peer = %peer, "flagged as awaiting propagation");
            self.awaiting.insert(id, peer);
        }
        if is_final {
            if let Some(responded) = self.roster.get_mut(&peer) {
                *responded = true;
            }
        }
    }

    /// Verify and accept propagated messages. Returns the messages that
    /// passed signature verification; callers store those write-through.
    /// Messages with bad signatures are dropped without affecting the rest
    /// of the batch.
    pub fn on_propagation(&mut self, messages: Vec<StoredMessage>) -> Vec<StoredMessage> {
        let mut accepted = Vec::with_capacity(messages.len());
        for message in messages {
            if let Err(err) = message.verify() {
                warn!(message = %message.id(), error = %err, "dropping propagated message");
                continue;
            }
            let id = message.id();
            if self.awaiting.remove(&id).is_none() {
                // Arrived before the digest that would have flagged it.
                self.resolved_early.insert(id);
            }
            accepted.push(message);
        }
        accepted
    }

    /// Overall verdict. An empty roster is trivially ready; otherwise all
    /// peers must have responded and nothing may be awaiting propagation.
    pub fn is_ready(&self) -> bool {
        if self.roster.is_empty() {
            return true;
        }
        self.roster.values().all(|responded| *responded) && self.awaiting.is_empty()
    }

    /// Peers in this query's roster snapshot.
    pub fn participants(&self) -> Vec<Identity> {
        self.roster.keys().copied().collect()
    }

    pub fn awaiting_count(&self) -> usize {
        self.awaiting.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    fn signed(keypair: &Keypair, ts: i64) -> StoredMessage {
        StoredMessage::sign(keypair, "stream", 0, ts, 0, "chain", vec![ts as u8])
    }

    fn digest_of(messages: &[StoredMessage]) -> Digest {
        messages
            .iter()
            .map(|m| (m.id(), m.content_hash()))
            .collect()
    }

    #[test]
    fn empty_roster_is_immediately_ready() {
        let state = QueryResolutionState::new(Vec::new());
        assert!(state.is_ready());
    }

    #[test]
    fn single_peer_with_nothing_new_resolves_on_final_response() {
        let keypair = Keypair::generate();
        let local = vec![signed(&keypair, 1), signed(&keypair, 2)];
        let peer = identity(7);

        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(digest_of(&local));
        assert!(!state.is_ready());

        // Peer reports a subset of what we already have.
        state.on_foreign_response(peer, digest_of(&local[..1]), true);
        assert!(state.is_ready());
    }

    #[test]
    fn missing_entry_blocks_until_propagated() {
        let keypair = Keypair::generate();
        let local = vec![signed(&keypair, 1)];
        let missing = signed(&keypair, 8);
        let peer = identity(3);

        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(digest_of(&local));

        let mut peer_digest = digest_of(&local);
        peer_digest.push((missing.id(), missing.content_hash()));
        state.on_foreign_response(peer, peer_digest, true);
        assert!(!state.is_ready());
        assert_eq!(state.awaiting_count(), 1);

        let accepted = state.on_propagation(vec![missing.clone()]);
        assert_eq!(accepted, vec![missing]);
        assert!(state.is_ready());
    }

    #[test]
    fn two_peers_both_must_respond() {
        let keypair = Keypair::generate();
        let local = vec![signed(&keypair, 1)];
        let (a, b) = (identity(1), identity(2));

        let mut state = QueryResolutionState::new(vec![a, b]);
        state.set_primary_digest(digest_of(&local));

        state.on_foreign_response(a, digest_of(&local), true);
        assert!(!state.is_ready());

        state.on_foreign_response(b, Vec::new(), true);
        assert!(state.is_ready());
    }

    #[test]
    fn partial_response_does_not_count_as_responded() {
        let keypair = Keypair::generate();
        let peer = identity(5);
        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(digest_of(&[signed(&keypair, 1)]));

        state.on_foreign_response(peer, Vec::new(), false);
        assert!(!state.is_ready());

        state.on_foreign_response(peer, Vec::new(), true);
        assert!(state.is_ready());
    }

    #[test]
    fn responses_before_primary_digest_are_replayed() {
        let keypair = Keypair::generate();
        let local = vec![signed(&keypair, 1)];
        let missing = signed(&keypair, 9);
        let peer = identity(4);

        let mut state = QueryResolutionState::new(vec![peer]);

        let mut peer_digest = digest_of(&local);
        peer_digest.push((missing.id(), missing.content_hash()));
        state.on_foreign_response(peer, peer_digest, true);
        assert!(!state.is_ready());
        assert_eq!(state.awaiting_count(), 0);

        state.set_primary_digest(digest_of(&local));
        assert_eq!(state.awaiting_count(), 1);

        state.on_propagation(vec![missing]);
        assert!(state.is_ready());
    }

    #[test]
    fn propagation_before_digest_is_not_lost() {
        let keypair = Keypair::generate();
        let missing = signed(&keypair, 9);
        let peer = identity(4);

        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(Vec::new());

        // Bytes arrive before the digest that flags them.
        let accepted = state.on_propagation(vec![missing.clone()]);
        assert_eq!(accepted.len(), 1);

        state.on_foreign_response(peer, vec![(missing.id(), missing.content_hash())], true);
        assert!(state.is_ready());
    }

    #[test]
    fn forged_propagation_is_dropped_and_blocks_readiness() {
        let keypair = Keypair::generate();
        let peer = identity(6);
        let mut genuine = signed(&keypair, 3);

        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(Vec::new());
        state.on_foreign_response(
            peer,
            vec![(genuine.id(), genuine.content_hash())],
            true,
        );
        assert!(!state.is_ready());

        genuine.payload = b"tampered".to_vec();
        let accepted = state.on_propagation(vec![genuine]);
        assert!(accepted.is_empty());
        assert!(!state.is_ready());
    }

    #[test]
    fn content_mismatch_counts_as_missing() {
        let keypair = Keypair::generate();
        let ours = signed(&keypair, 5);
        let theirs = StoredMessage::sign(&keypair, "stream", 0, 5, 0, "chain", b"other".to_vec());
        let peer = identity(2);

        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(digest_of(&[ours]));

        state.on_foreign_response(peer, vec![(theirs.id(), theirs.content_hash())], true);
        assert_eq!(state.awaiting_count(), 1);
        assert!(!state.is_ready());
    }

    #[test]
    fn primary_digest_is_write_once() {
        let keypair = Keypair::generate();
        let first = signed(&keypair, 1);
        let second = signed(&keypair, 2);
        let peer = identity(1);

        let mut state = QueryResolutionState::new(vec![peer]);
        state.set_primary_digest(digest_of(&[first.clone()]));
        state.set_primary_digest(digest_of(&[second]));

        // The peer echoes the first digest; if the second overwrite had
        // taken effect this would flag an awaiting entry.
        state.on_foreign_response(peer, digest_of(&[first]), true);
        assert!(state.is_ready());
    }
}
