//! # Storage Engine Seam
//!
//! Physical storage engines (bucketed column stores, embedded SQL stores)
//! live outside this crate; the reconciliation core consumes them through
//! the [`Storage`] trait. Query methods return a [`MessageStream`]: a lazy
//! channel of results where a closed channel means the sequence is
//! exhausted and an `Err` item means the sequence ended due to an engine
//! failure — consumers must treat the two differently.
//!
//! [`MemoryStore`] is the in-tree reference engine used by tests and the
//! demo binary.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::identity::Identity;
use crate::message::{MessageRef, StoredMessage};

/// Capacity of query result channels. Queries stay lazy: an unread stream
/// holds at most this many buffered messages.
const QUERY_CHANNEL_CAPACITY: usize = 64;

/// Error type for storage engine failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The underlying engine failed (connection loss, corrupt bucket, ...).
    Engine(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Engine(msg) => write!(f, "storage engine failure: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Lazy sequence of query results. Channel closed = exhausted;
/// `Err` item = ended due to error.
pub type MessageStream = mpsc::Receiver<Result<StoredMessage, StorageError>>;

/// Uniform interface over physical storage engines.
///
/// All query methods return results in ascending `(timestamp, sequence)`
/// order except [`Storage::query_by_refs`], which follows input order
/// best-effort.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Store a message. Idempotent: re-storing an already-stored message
    /// returns `Ok(false)` and neither errors nor duplicates.
    async fn store(&self, message: StoredMessage) -> Result<bool, StorageError>;

    /// The last `count` messages of a partition, ascending.
    async fn query_last(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream;

    /// The first `count` messages of a partition, ascending.
    async fn query_first(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream;

    /// All messages with `from <= reference <= to`, optionally filtered by
    /// publisher and message chain.
    async fn query_range(
        &self,
        stream_id: &str,
        partition: u16,
        from: MessageRef,
        to: MessageRef,
        publisher: Option<Identity>,
        msg_chain_id: Option<&str>,
    ) -> MessageStream;

    /// Point lookups by explicit reference list; order follows the input
    /// list best-effort.
    async fn query_by_refs(
        &self,
        stream_id: &str,
        partition: u16,
        refs: &[MessageRef],
    ) -> MessageStream;
}

/// Full ordering key within one partition: position first, then publisher
/// and chain to disambiguate same-position messages.
type StoreKey = (i64, i32, [u8; 32], String);

fn store_key(message: &StoredMessage) -> StoreKey {
    (
        message.timestamp,
        message.sequence_number,
        *message.publisher.as_bytes(),
        message.msg_chain_id.clone(),
    )
}

type Partition = BTreeMap<StoreKey, StoredMessage>;

/// In-memory reference storage engine.
#[derive(Default)]
pub struct MemoryStore {
    partitions: RwLock<BTreeMap<(String, u16), Partition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Snapshot matching messages under the read lock, already ordered.
    fn collect<F>(&self, stream_id: &str, partition: u16, keep: F) -> Vec<StoredMessage>
    where
        F: Fn(&StoredMessage) -> bool,
    {
        let partitions = match self.partitions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        partitions
            .get(&(stream_id.to_string(), partition))
            .map(|part| part.values().filter(|m| keep(m)).cloned().collect())
            .unwrap_or_default()
    }
}

/// Stream a snapshot out through a lazily-consumed channel.
fn stream_snapshot(messages: Vec<StoredMessage>) -> MessageStream {
    let (tx, rx) = mpsc::channel(QUERY_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        for message in messages {
            if tx.send(Ok(message)).await.is_err() {
                break;
            }
        }
    });
    rx
}

#[async_trait]
impl Storage for MemoryStore {
    async fn store(&self, message: StoredMessage) -> Result<bool, StorageError> {
        let mut partitions = match self.partitions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let part = partitions
            .entry((message.stream_id.clone(), message.partition))
            .or_default();
        let key = store_key(&message);
        if part.contains_key(&key) {
            return Ok(false);
        }
        part.insert(key, message);
        Ok(true)
    }

    async fn query_last(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream {
        let mut all = self.collect(stream_id, partition, |_| true);
        let skip = all.len().saturating_sub(count as usize);
        all.drain(..skip);
        stream_snapshot(all)
    }

    async fn query_first(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream {
        let mut all = self.collect(stream_id, partition, |_| true);
        all.truncate(count as usize);
        stream_snapshot(all)
    }

    async fn query_range(
        &self,
        stream_id: &str,
        partition: u16,
        from: MessageRef,
        to: MessageRef,
        publisher: Option<Identity>,
        msg_chain_id: Option<&str>,
    ) -> MessageStream {
        let chain = msg_chain_id.map(str::to_string);
        let matching = self.collect(stream_id, partition, |m| {
            let r = m.reference();
            r >= from
                && r <= to
                && publisher.map_or(true, |p| m.publisher == p)
                && chain.as_deref().map_or(true, |c| m.msg_chain_id == c)
        });
        stream_snapshot(matching)
    }

    async fn query_by_refs(
        &self,
        stream_id: &str,
        partition: u16,
        refs: &[MessageRef],
    ) -> MessageStream {
        let mut out = Vec::new();
        for wanted in refs {
            let mut found = self.collect(stream_id, partition, |m| m.reference() == *wanted);
            out.append(&mut found);
        }
        stream_snapshot(out)
    }
}
