//! # Reconciliation Lists
//!
//! In-memory ordered structures tracking which messages are confirmed
//! locally versus only seen elsewhere. Entries are keyed by full
//! [`MessageId`], whose derived order is reference-first: two publishers may
//! legitimately hold the same `(timestamp, sequence)` position, and their
//! messages must reconcile independently. Progress comparisons against a
//! peer's position use the bare [`MessageRef`].
//!
//! Both lists share one discipline: a monotonic shrink/commit threshold.
//! Once an entry is covered by a commit, it is permanently dropped and can
//! never reappear, which is what prevents re-emitting already-flushed ranges
//! no matter how late a duplicate push arrives.
//!
//! [`AggregationList`] serves the node that originated a query (primary
//! role); [`PropagationList`] serves a node answering someone else's query
//! (foreign role).

use std::collections::{BTreeMap, BTreeSet};

use crate::message::{MessageId, MessageRef};

/// Merge state for the primary role: every message the query touches,
/// flagged ready (confirmed locally, by local find or verified propagation)
/// or pending (reported by a peer digest, bytes not yet here).
///
/// `ready_from`/`ready_to` expose the maximal contiguous ready prefix;
/// the caller flushes that range and commits it with [`Self::shrink`].
#[derive(Debug, Default)]
pub struct AggregationList {
    items: BTreeMap<MessageId, bool>,
    threshold: Option<MessageId>,
}

impl AggregationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Message found in local storage: ready immediately.
    pub fn push_primary(&mut self, id: MessageId) {
        self.push(id, true);
    }

    /// Message claimed by a peer digest: pending until its bytes arrive.
    /// Never downgrades an entry that is already ready.
    pub fn push_foreign(&mut self, id: MessageId) {
        self.push(id, false);
    }

    /// Message whose bytes arrived via verified propagation: ready.
    pub fn push_propagation(&mut self, id: MessageId) {
        self.push(id, true);
    }

    fn push(&mut self, id: MessageId, ready: bool) {
        // Anything at or below the commit point was already flushed.
        if self.committed(&id) {
            return;
        }
        let entry = self.items.entry(id).or_insert(ready);
        *entry |= ready;
    }

    /// First tracked entry, only if it is ready.
    pub fn ready_from(&self) -> Option<MessageId> {
        let (id, ready) = self.items.iter().next()?;
        ready.then(|| id.clone())
    }

    /// End of the maximal contiguous ready run starting at the head.
    pub fn ready_to(&self) -> Option<MessageId> {
        let mut last = None;
        for (id, ready) in &self.items {
            if !ready {
                break;
            }
            last = Some(id.clone());
        }
        last
    }

    /// Commit every entry at or below `threshold`. Thresholds must be
    /// non-decreasing across calls; a lower threshold is a no-op.
    pub fn shrink(&mut self, threshold: &MessageId) {
        if self.committed(threshold) {
            return;
        }
        self.items = self.items.split_off(threshold);
        self.items.remove(threshold);
        self.threshold = Some(threshold.clone());
    }

    /// Whether `id` is at or below the commit threshold.
    pub fn committed(&self, id: &MessageId) -> bool {
        self.threshold.as_ref().map_or(false, |t| id <= t)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

/// Diff state for the foreign role: what the requester is missing relative
/// to what this node found locally.
///
/// `push_foreign` queues local finds; `push_primary` records the requester's
/// confirmed progress, cancelling out the queued item with the same id. The
/// remaining queue, drained in bounded steps by [`Self::get_diff_and_shrink`],
/// is exactly what must be propagated.
#[derive(Debug, Default)]
pub struct PropagationList {
    /// Highest position the requester has confirmed so far.
    latest_primary: Option<MessageRef>,
    /// Requester-confirmed ids with no local counterpart yet.
    primary_pending: BTreeSet<MessageId>,
    /// Local finds the requester has not confirmed.
    foreign: BTreeSet<MessageId>,
    primary_finalized: bool,
    foreign_finalized: bool,
}

impl PropagationList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one id from the requester's own digest.
    pub fn push_primary(&mut self, id: MessageId) {
        let reference = id.reference();
        self.latest_primary = Some(match self.latest_primary {
            Some(latest) => latest.max(reference),
            None => reference,
        });
        // The requester has it, so the matching local find needs no
        // propagation. Only an exact id match cancels: another publisher's
        // message at the same position is still missing.
        if !self.foreign.remove(&id) {
            self.primary_pending.insert(id);
        }
    }

    /// Record one locally-found id.
    pub fn push_foreign(&mut self, id: MessageId) {
        if self.primary_pending.remove(&id) {
            return;
        }
        self.foreign.insert(id);
    }

    /// One-way latch: the requester's digest stream is complete.
    pub fn finalize_primary(&mut self) {
        self.primary_finalized = true;
    }

    /// One-way latch: the local find stream is complete.
    pub fn finalize_foreign(&mut self) {
        self.foreign_finalized = true;
    }

    pub fn is_finalized(&self) -> bool {
        self.primary_finalized && self.foreign_finalized
    }

    pub fn is_empty(&self) -> bool {
        self.foreign.is_empty()
    }

    /// Drain the ids that are safe to propagate now.
    ///
    /// While the requester's digest is still streaming, only items at or
    /// below its confirmed progress point are drained (the requester has
    /// demonstrably passed them without claiming them). Once the digest is
    /// final, everything left is drained regardless of position.
    pub fn get_diff_and_shrink(&mut self) -> Vec<MessageId> {
        if self.primary_finalized {
            return std::mem::take(&mut self.foreign).into_iter().collect();
        }
        let Some(latest) = self.latest_primary else {
            return Vec::new();
        };
        let (drained, keep): (BTreeSet<MessageId>, BTreeSet<MessageId>) =
            std::mem::take(&mut self.foreign)
                .into_iter()
                .partition(|id| id.reference() <= latest);
        self.foreign = keep;
        drained.into_iter().collect()
    }
}
