//! # Per-Request Bookkeeping
//!
//! The node service runs one aggregator or propagator per in-flight request
//! id. [`Registry`] is the explicit ownership table for those workers:
//! entries are inserted when a request starts and removed on completion or
//! timeout, never left behind for an abandoned query.
//!
//! Workers report upward through [`Notice`] values on a shared channel; the
//! node service turns notices into bus publications and resolution-state
//! updates.

use std::collections::HashMap;

use uuid::Uuid;

use crate::crypto::ContentHash;
use crate::identity::Identity;
use crate::message::{MessageId, StoredMessage};

/// Event from a per-request worker to the owning node service.
#[derive(Debug)]
pub enum Notice {
    /// A chunk of the local digest for a query this node originated.
    /// Published to peers and fed to the request's resolution state once
    /// `is_final`.
    OwnDigest {
        request_id: Uuid,
        digest: Vec<(MessageId, ContentHash)>,
        is_final: bool,
    },
    /// A chunk of the local digest for a query a peer originated.
    ForeignDigest {
        request_id: Uuid,
        requester: Identity,
        digest: Vec<(MessageId, ContentHash)>,
        is_final: bool,
    },
    /// Messages the requester is missing, ready to publish back.
    Propagation {
        request_id: Uuid,
        requester: Identity,
        messages: Vec<StoredMessage>,
    },
    /// The aggregator's output stream has ended.
    AggregationFinished { request_id: Uuid },
    /// The propagator has nothing further to send.
    PropagationFinished { request_id: Uuid },
}

/// Request-id keyed table of in-flight workers or waiters.
pub struct Registry<H> {
    entries: HashMap<Uuid, H>,
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Insert, returning the displaced entry if the id was already present.
    pub fn insert(&mut self, request_id: Uuid, entry: H) -> Option<H> {
        self.entries.insert(request_id, entry)
    }

    pub fn get(&self, request_id: &Uuid) -> Option<&H> {
        self.entries.get(request_id)
    }

    pub fn get_mut(&mut self, request_id: &Uuid) -> Option<&mut H> {
        self.entries.get_mut(request_id)
    }

    pub fn contains(&self, request_id: &Uuid) -> bool {
        self.entries.contains_key(request_id)
    }

    /// Remove an entry. Called on success and on timeout alike; the caller
    /// is responsible for shutting the removed worker down.
    pub fn remove(&mut self, request_id: &Uuid) -> Option<H> {
        self.entries.remove(request_id)
    }

    pub fn values(&self) -> impl Iterator<Item = &H> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self::new()
    }
}
