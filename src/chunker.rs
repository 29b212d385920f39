//! Output batching for digest and propagation streams. A chunk closes when
//! it reaches the item bound or the byte bound, whichever comes first, with
//! a final flush for the remainder.

use crate::crypto::ContentHash;
use crate::message::{MessageId, StoredMessage};

/// Default chunk item bound.
pub const CHUNK_MAX_ITEMS: usize = 5000;

/// Default chunk byte bound.
pub const CHUNK_MAX_BYTES: usize = 500 * 1024;

/// Approximate serialized size contribution of one chunk item.
pub trait ChunkWeight {
    fn weight(&self) -> usize;
}

impl ChunkWeight for StoredMessage {
    fn weight(&self) -> usize {
        self.stream_id.len()
            + self.msg_chain_id.len()
            + self.payload.len()
            + self.signature.len()
            + 64
    }
}

impl ChunkWeight for (MessageId, ContentHash) {
    fn weight(&self) -> usize {
        self.0.msg_chain_id.len() + 32 + 32 + 16
    }
}

/// Chunk bounds carried from node configuration into per-request workers.
#[derive(Clone, Copy, Debug)]
pub struct ChunkPolicy {
    pub max_items: usize,
    pub max_bytes: usize,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            max_items: CHUNK_MAX_ITEMS,
            max_bytes: CHUNK_MAX_BYTES,
        }
    }
}

impl ChunkPolicy {
    pub fn chunker<T: ChunkWeight>(&self) -> Chunker<T> {
        Chunker::new(self.max_items, self.max_bytes)
    }
}

/// Accumulates items into bounded chunks.
pub struct Chunker<T> {
    max_items: usize,
    max_bytes: usize,
    items: Vec<T>,
    bytes: usize,
}

impl<T: ChunkWeight> Chunker<T> {
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            max_items,
            max_bytes,
            items: Vec::new(),
            bytes: 0,
        }
    }

    /// Add one item. Returns a completed chunk when a bound is crossed.
    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.bytes += item.weight();
        self.items.push(item);
        if self.items.len() >= self.max_items || self.bytes >= self.max_bytes {
            return self.flush();
        }
        None
    }

    /// Drain whatever is pending. Idempotent: a second flush with nothing
    /// pending returns `None`.
    pub fn flush(&mut self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            return None;
        }
        self.bytes = 0;
        Some(std::mem::take(&mut self.items))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
