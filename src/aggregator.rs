//! # Aggregator (originating role)
//!
//! One aggregator runs per query this node originated. It merges three
//! sources into a single ordered, deduplicated output stream of message
//! chunks:
//!
//! - the local storage query for the request
//! - peer digests (which message ids exist elsewhere)
//! - verified propagations (the bytes of messages this node was missing)
//!
//! Output is emitted range by range: whenever the aggregation list exposes a
//! contiguous ready prefix, that exact id window is re-queried from local
//! storage, streamed out, and committed with a shrink so it can never be
//! emitted twice. Emission holds off while any roster peer has neither sent
//! a digest nor finished, so a late digest cannot claim an id below an
//! already-committed window.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chunker::{ChunkPolicy, Chunker};
use crate::crypto::ContentHash;
use crate::executor::{run_bounded_query, run_local_query};
use crate::identity::Identity;
use crate::manager::Notice;
use crate::message::{MessageId, StoredMessage};
use crate::messages::QueryRequest;
use crate::reconcile::AggregationList;
use crate::storage::Storage;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

enum Command {
    ForeignResponse {
        peer: Identity,
        ids: Vec<MessageId>,
        is_final: bool,
    },
    /// Propagated messages that already passed signature verification.
    Propagation { messages: Vec<StoredMessage> },
}

#[derive(Default)]
struct PeerProgress {
    seen: bool,
    finalized: bool,
}

/// Handle to a running aggregator. Dropping the handle does not stop the
/// worker; completion or an explicit [`Aggregator::abort`] does.
pub struct Aggregator {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Aggregator {
    /// Spawn the worker for one request. Returns the handle and the chunked
    /// output stream; the stream closes when aggregation ends.
    pub fn spawn(
        request: QueryRequest,
        roster: Vec<Identity>,
        storage: Arc<dyn Storage>,
        chunks: ChunkPolicy,
        notice_tx: mpsc::Sender<Notice>,
    ) -> (Self, mpsc::Receiver<Vec<StoredMessage>>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);

        let actor = AggregatorActor {
            peers: roster
                .into_iter()
                .map(|peer| (peer, PeerProgress::default()))
                .collect(),
            list: AggregationList::new(),
            unstored: BTreeMap::new(),
            out_chunker: chunks.chunker(),
            digest_chunker: chunks.chunker(),
            local_done: false,
            last_local: None,
            request,
            storage,
            output_tx,
            notice_tx,
        };
        let task = tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx, task }, output_rx)
    }

    pub async fn on_foreign_response(
        &self,
        peer: Identity,
        ids: Vec<MessageId>,
        is_final: bool,
    ) {
        let _ = self
            .cmd_tx
            .send(Command::ForeignResponse {
                peer,
                ids,
                is_final,
            })
            .await;
    }

    pub async fn on_propagation(&self, messages: Vec<StoredMessage>) {
        let _ = self.cmd_tx.send(Command::Propagation { messages }).await;
    }

    /// Tear the worker down immediately. Used on resolution timeout.
    pub fn abort(&self) {
        self.task.abort();
    }
}

struct AggregatorActor {
    request: QueryRequest,
    storage: Arc<dyn Storage>,
    list: AggregationList,
    peers: HashMap<Identity, PeerProgress>,
    /// Verified propagations whose write-through store failed; emitted from
    /// memory in id order when their window commits.
    unstored: BTreeMap<MessageId, StoredMessage>,
    out_chunker: Chunker<StoredMessage>,
    digest_chunker: Chunker<(MessageId, ContentHash)>,
    local_done: bool,
    /// Highest id the local stream has delivered. Local results arrive in
    /// ascending order, so everything at or below this point is already in
    /// the list.
    last_local: Option<MessageId>,
    output_tx: mpsc::Sender<Vec<StoredMessage>>,
    notice_tx: mpsc::Sender<Notice>,
}

impl AggregatorActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut local = run_local_query(&self.storage, &self.request).await;

        loop {
            let finished = tokio::select! {
                item = local.recv(), if !self.local_done => {
                    self.handle_local_item(item).await
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::ForeignResponse { peer, ids, is_final }) => {
                            self.handle_foreign_response(peer, ids, is_final).await
                        }
                        Some(Command::Propagation { messages }) => {
                            self.handle_propagation(messages).await
                        }
                        None => {
                            debug!(request = %self.request.request_id, "aggregator handle dropped");
                            break;
                        }
                    }
                }
            };
            if finished {
                break;
            }
        }
    }

    async fn handle_local_item(
        &mut self,
        item: Option<Result<StoredMessage, crate::storage::StorageError>>,
    ) -> bool {
        match item {
            Some(Ok(message)) => {
                let id = message.id();
                self.last_local = Some(id.clone());
                self.list.push_primary(id.clone());
                if let Some(chunk) = self.digest_chunker.push((id, message.content_hash())) {
                    self.send_digest(chunk, false).await;
                }
            }
            Some(Err(err)) => {
                // A broken local stream counts as exhausted so the
                // aggregator can still terminate.
                warn!(request = %self.request.request_id, error = %err, "local query stream failed");
                self.finish_local_stream().await;
            }
            None => {
                self.finish_local_stream().await;
            }
        }
        self.do_check().await
    }

    async fn finish_local_stream(&mut self) {
        self.local_done = true;
        let chunk = self.digest_chunker.flush().unwrap_or_default();
        self.send_digest(chunk, true).await;
    }

    async fn send_digest(&self, digest: Vec<(MessageId, ContentHash)>, is_final: bool) {
        let _ = self
            .notice_tx
            .send(Notice::OwnDigest {
                request_id: self.request.request_id,
                digest,
                is_final,
            })
            .await;
    }

    async fn handle_foreign_response(
        &mut self,
        peer: Identity,
        ids: Vec<MessageId>,
        is_final: bool,
    ) -> bool {
        let progress = self.peers.entry(peer).or_default();
        progress.seen = true;
        progress.finalized |= is_final;
        for id in ids {
            self.list.push_foreign(id);
        }
        self.do_check().await
    }

    async fn handle_propagation(&mut self, messages: Vec<StoredMessage>) -> bool {
        for message in messages {
            let id = message.id();
            // Write-through: propagated data becomes locally durable before
            // it is marked ready, so the range re-query can find it.
            if let Err(err) = self.storage.store(message.clone()).await {
                warn!(request = %self.request.request_id, error = %err, "write-through failed, emitting from memory");
                if !self.list.committed(&id) {
                    self.unstored.insert(id.clone(), message);
                }
            }
            self.list.push_propagation(id);
        }
        self.do_check().await
    }

    /// Re-evaluate after any state change. Returns true when the output
    /// stream has ended.
    async fn do_check(&mut self) -> bool {
        // A peer we have heard nothing from could still claim ids below our
        // current head; emitting now would commit past them.
        if self
            .peers
            .values()
            .any(|progress| !progress.seen && !progress.finalized)
        {
            return false;
        }

        if let (Some(from), Some(to)) = (self.list.ready_from(), self.list.ready_to()) {
            // While the local stream is still running, only commit up to
            // what it has already delivered; ids past that point may still
            // be produced locally and must not land below the threshold.
            let cap = if self.local_done {
                Some(to)
            } else {
                self.last_local.clone().map(|latest| to.min(latest))
            };
            if let Some(cap) = cap {
                if from <= cap {
                    if let Some(done) = self.emit_range(&from, &cap).await {
                        self.list.shrink(&done);
                    }
                }
            }
        }

        let peers_pending = self.peers.values().any(|progress| !progress.finalized);
        if !peers_pending && self.list.is_empty() && self.local_done {
            if let Some(chunk) = self.out_chunker.flush() {
                let _ = self.output_tx.send(chunk).await;
            }
            let _ = self
                .notice_tx
                .send(Notice::AggregationFinished {
                    request_id: self.request.request_id,
                })
                .await;
            return true;
        }
        false
    }

    /// Emit the ready window `[from, to]`, merging storage results with
    /// stashed propagations in id order. Returns the id through which the
    /// window may be committed: `to` on a clean pass, the last id actually
    /// emitted when the re-query fails mid-stream (the rest stays pending).
    async fn emit_range(&mut self, from: &MessageId, to: &MessageId) -> Option<MessageId> {
        let mut stream =
            run_bounded_query(&self.storage, &self.request, from.reference(), to.reference())
                .await;
        let mut last_emitted = None;
        while let Some(item) = stream.recv().await {
            match item {
                Ok(message) => {
                    let id = message.id();
                    // The reference range may include ids already committed
                    // or past the window boundary.
                    if id < *from || id > *to {
                        continue;
                    }
                    self.drain_unstored(&id, false).await;
                    self.emit(message).await;
                    last_emitted = Some(id);
                }
                Err(err) => {
                    warn!(request = %self.request.request_id, error = %err, "range re-query failed mid-stream");
                    return last_emitted;
                }
            }
        }
        self.drain_unstored(to, true).await;
        Some(to.clone())
    }

    /// Emit stashed propagations below `bound` (at `bound` too when
    /// `inclusive`), keeping the merged output in id order.
    async fn drain_unstored(&mut self, bound: &MessageId, inclusive: bool) {
        while let Some(first) = self.unstored.keys().next().cloned() {
            let past = if inclusive {
                first > *bound
            } else {
                first >= *bound
            };
            if past {
                break;
            }
            if let Some(message) = self.unstored.remove(&first) {
                self.emit(message).await;
            }
        }
    }

    async fn emit(&mut self, message: StoredMessage) {
        if let Some(chunk) = self.out_chunker.push(message) {
            let _ = self.output_tx.send(chunk).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::message::MessageRef;
    use crate::messages::QueryOptions;
    use crate::storage::{MemoryStore, MessageStream, StorageError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_CHUNKS: ChunkPolicy = ChunkPolicy {
        max_items: 100,
        max_bytes: 1024 * 1024,
    };

    async fn collect_output(mut rx: mpsc::Receiver<Vec<StoredMessage>>) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(chunk) = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("aggregator output stalled")
        {
            out.extend(chunk.into_iter().map(|m| m.timestamp));
        }
        out
    }

    fn from_query(from: i64) -> QueryRequest {
        QueryRequest::new(
            "consumer",
            "stream",
            0,
            QueryOptions::From {
                from: MessageRef::new(from, 0),
                publisher: None,
            },
        )
    }

    async fn seeded(keypair: &Keypair, timestamps: &[i64]) -> Arc<dyn Storage> {
        let store = MemoryStore::new();
        for ts in timestamps {
            let msg = StoredMessage::sign(keypair, "stream", 0, *ts, 0, "chain", vec![]);
            store.store(msg).await.unwrap();
        }
        Arc::new(store)
    }

    async fn await_finished(notice_rx: &mut mpsc::Receiver<Notice>) {
        loop {
            let notice = timeout(Duration::from_secs(2), notice_rx.recv())
                .await
                .expect("aggregator went silent")
                .expect("notice channel closed");
            if matches!(notice, Notice::AggregationFinished { .. }) {
                return;
            }
        }
    }

    /// Queries work; every store attempt fails.
    struct RejectingStore(MemoryStore);

    #[async_trait]
    impl Storage for RejectingStore {
        async fn store(&self, _message: StoredMessage) -> Result<bool, StorageError> {
            Err(StorageError::Engine("disk full".to_string()))
        }

        async fn query_last(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream {
            self.0.query_last(stream_id, partition, count).await
        }

        async fn query_first(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream {
            self.0.query_first(stream_id, partition, count).await
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
            self.0
                .query_range(stream_id, partition, from, to, publisher, msg_chain_id)
                .await
        }

        async fn query_by_refs(
            &self,
            stream_id: &str,
            partition: u16,
            refs: &[MessageRef],
        ) -> MessageStream {
            self.0.query_by_refs(stream_id, partition, refs).await
        }
    }

    /// Delegates to a memory store, but the `failing_call`-th range query
    /// yields its first item and then an engine error.
    struct FlakyRangeStore {
        inner: MemoryStore,
        calls: AtomicUsize,
        failing_call: usize,
    }

    #[async_trait]
    impl Storage for FlakyRangeStore {
        async fn store(&self, message: StoredMessage) -> Result<bool, StorageError> {
            self.inner.store(message).await
        }

        async fn query_last(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream {
            self.inner.query_last(stream_id, partition, count).await
        }

        async fn query_first(&self, stream_id: &str, partition: u16, count: u64) -> MessageStream {
            self.inner.query_first(stream_id, partition, count).await
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
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut inner = self
                .inner
                .query_range(stream_id, partition, from, to, publisher, msg_chain_id)
                .await;
            if call != self.failing_call {
                return inner;
            }
            let (tx, rx) = mpsc::channel(8);
            tokio::spawn(async move {
                if let Some(first) = inner.recv().await {
                    let _ = tx.send(first).await;
                }
                let _ = tx
                    .send(Err(StorageError::Engine("lost connection".to_string())))
                    .await;
            });
            rx
        }

        async fn query_by_refs(
            &self,
            stream_id: &str,
            partition: u16,
            refs: &[MessageRef],
        ) -> MessageStream {
            self.inner.query_by_refs(stream_id, partition, refs).await
        }
    }

    #[tokio::test]
    async fn empty_roster_streams_local_results_and_finishes() {
        let keypair = Keypair::generate();
        let storage = seeded(&keypair, &[1, 5, 9]).await;
        let (notice_tx, mut notice_rx) = mpsc::channel(64);

        let (_handle, output) =
            Aggregator::spawn(from_query(0), Vec::new(), storage, TEST_CHUNKS, notice_tx);

        assert_eq!(collect_output(output).await, vec![1, 5, 9]);

        let mut saw_final_digest = false;
        let mut saw_finished = false;
        while let Ok(Some(notice)) = timeout(Duration::from_secs(1), notice_rx.recv()).await {
            match notice {
                Notice::OwnDigest { is_final, digest, .. } => {
                    if is_final {
                        saw_final_digest = true;
                        assert!(digest.len() <= 3);
                    }
                }
                Notice::AggregationFinished { .. } => {
                    saw_finished = true;
                    break;
                }
                other => panic!("unexpected notice: {other:?}"),
            }
        }
        assert!(saw_final_digest);
        assert!(saw_finished);
    }

    #[tokio::test]
    async fn output_waits_for_silent_peer() {
        let keypair = Keypair::generate();
        let storage = seeded(&keypair, &[1, 2]).await;
        let peer = Keypair::generate().identity();
        let (notice_tx, _notice_rx) = mpsc::channel(64);

        let (handle, mut output) =
            Aggregator::spawn(from_query(0), vec![peer], storage, TEST_CHUNKS, notice_tx);

        // Nothing may be emitted while the peer is silent.
        assert!(timeout(Duration::from_millis(200), output.recv()).await.is_err());

        handle.on_foreign_response(peer, Vec::new(), true).await;
        assert_eq!(collect_output(output).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn propagated_message_is_merged_in_time_order() {
        let keypair = Keypair::generate();
        let storage = seeded(&keypair, &[5, 15]).await;
        let peer = Keypair::generate().identity();
        let missing = StoredMessage::sign(&keypair, "stream", 0, 8, 0, "chain", b"late".to_vec());
        let (notice_tx, _notice_rx) = mpsc::channel(64);

        let (handle, output) = Aggregator::spawn(
            from_query(5),
            vec![peer],
            Arc::clone(&storage),
            TEST_CHUNKS,
            notice_tx,
        );

        handle
            .on_foreign_response(peer, vec![missing.id()], true)
            .await;
        handle.on_propagation(vec![missing]).await;

        assert_eq!(collect_output(output).await, vec![5, 8, 15]);
    }

    #[tokio::test]
    async fn write_through_makes_propagated_data_durable() {
        let keypair = Keypair::generate();
        let storage = seeded(&keypair, &[]).await;
        let peer = Keypair::generate().identity();
        let missing = StoredMessage::sign(&keypair, "stream", 0, 3, 0, "chain", vec![]);
        let (notice_tx, _notice_rx) = mpsc::channel(64);

        let (handle, output) = Aggregator::spawn(
            from_query(0),
            vec![peer],
            Arc::clone(&storage),
            TEST_CHUNKS,
            notice_tx,
        );
        handle
            .on_foreign_response(peer, vec![missing.id()], true)
            .await;
        handle.on_propagation(vec![missing.clone()]).await;
        collect_output(output).await;

        // Stored locally, not just forwarded.
        assert!(!storage.store(missing).await.unwrap());
    }

    #[tokio::test]
    async fn store_failure_still_emits_propagation_and_terminates() {
        let keypair = Keypair::generate();
        let storage: Arc<dyn Storage> = Arc::new(RejectingStore(MemoryStore::new()));
        let peer = Keypair::generate().identity();
        let missing = StoredMessage::sign(&keypair, "stream", 0, 3, 0, "chain", b"kept".to_vec());
        let (notice_tx, mut notice_rx) = mpsc::channel(64);

        let (handle, output) =
            Aggregator::spawn(from_query(0), vec![peer], storage, TEST_CHUNKS, notice_tx);
        handle
            .on_foreign_response(peer, vec![missing.id()], true)
            .await;
        handle.on_propagation(vec![missing]).await;

        // The verified bytes reach the caller even though the engine
        // refused the write-through, and the worker still ends.
        assert_eq!(collect_output(output).await, vec![3]);
        await_finished(&mut notice_rx).await;
    }

    #[tokio::test]
    async fn range_requery_failure_does_not_drop_the_tail() {
        let keypair = Keypair::generate();
        let inner = MemoryStore::new();
        for ts in [1i64, 2, 3] {
            let msg = StoredMessage::sign(&keypair, "stream", 0, ts, 0, "chain", vec![]);
            inner.store(msg).await.unwrap();
        }
        // Call 0 is the aggregator's own local query; call 1 is the first
        // emission re-query, which breaks after one item.
        let storage: Arc<dyn Storage> = Arc::new(FlakyRangeStore {
            inner,
            calls: AtomicUsize::new(0),
            failing_call: 1,
        });
        let peer = Keypair::generate().identity();
        let (notice_tx, mut notice_rx) = mpsc::channel(64);

        let (handle, output) =
            Aggregator::spawn(from_query(0), vec![peer], storage, TEST_CHUNKS, notice_tx);

        // Hold the gate until the local stream is fully delivered so the
        // re-query call order is deterministic.
        loop {
            let notice = timeout(Duration::from_secs(2), notice_rx.recv())
                .await
                .expect("aggregator went silent")
                .expect("notice channel closed");
            if matches!(notice, Notice::OwnDigest { is_final: true, .. }) {
                break;
            }
        }
        handle.on_foreign_response(peer, Vec::new(), false).await;
        handle.on_foreign_response(peer, Vec::new(), true).await;

        // The broken re-query commits only its emitted head; the next pass
        // delivers the rest exactly once.
        assert_eq!(collect_output(output).await, vec![1, 2, 3]);
        await_finished(&mut notice_rx).await;
    }
}
