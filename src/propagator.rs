//! # Propagator (responding role)
//!
//! One propagator runs per foreign query this node helps answer. It runs
//! the same local query the requester ran, reports its own find-set as
//! digest chunks, and as the requester's digest streams in, computes which
//! local messages the requester is missing and ships their bytes back as
//! propagation chunks.
//!
//! The worker carries its own deadline equal to the requester's resolution
//! timeout: a requester that went away can never strand a propagator.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::chunker::{ChunkPolicy, Chunker};
use crate::crypto::ContentHash;
use crate::executor::run_local_query;
use crate::identity::Identity;
use crate::manager::Notice;
use crate::message::{MessageId, MessageRef, StoredMessage};
use crate::messages::QueryRequest;
use crate::reconcile::PropagationList;
use crate::storage::Storage;

const COMMAND_CHANNEL_CAPACITY: usize = 256;

enum Command {
    PrimaryResponse {
        ids: Vec<MessageId>,
        is_final: bool,
    },
}

/// Handle to a running propagator.
pub struct Propagator {
    cmd_tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl Propagator {
    pub fn spawn(
        request: QueryRequest,
        requester: Identity,
        storage: Arc<dyn Storage>,
        chunks: ChunkPolicy,
        deadline: Duration,
        notice_tx: mpsc::Sender<Notice>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = PropagatorActor {
            list: PropagationList::new(),
            digest_chunker: chunks.chunker(),
            prop_chunker: chunks.chunker(),
            local_done: false,
            request,
            requester,
            storage,
            notice_tx,
        };
        let task = tokio::spawn(actor.run(cmd_rx, deadline));
        Self { cmd_tx, task }
    }

    /// Feed one digest chunk published by the requester itself.
    pub async fn on_primary_response(&self, ids: Vec<MessageId>, is_final: bool) {
        let _ = self
            .cmd_tx
            .send(Command::PrimaryResponse { ids, is_final })
            .await;
    }

    pub fn abort(&self) {
        self.task.abort();
    }
}

struct PropagatorActor {
    request: QueryRequest,
    requester: Identity,
    storage: Arc<dyn Storage>,
    list: PropagationList,
    digest_chunker: Chunker<(MessageId, ContentHash)>,
    prop_chunker: Chunker<StoredMessage>,
    local_done: bool,
    notice_tx: mpsc::Sender<Notice>,
}

impl PropagatorActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>, deadline: Duration) {
        let mut local = run_local_query(&self.storage, &self.request).await;
        let give_up = tokio::time::sleep(deadline);
        tokio::pin!(give_up);

        loop {
            let finished = tokio::select! {
                _ = &mut give_up => {
                    debug!(request = %self.request.request_id, "propagator deadline reached");
                    self.send_finished().await;
                    break;
                }
                item = local.recv(), if !self.local_done => {
                    self.handle_local_item(item).await
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::PrimaryResponse { ids, is_final }) => {
                            self.handle_primary_response(ids, is_final).await
                        }
                        None => {
                            debug!(request = %self.request.request_id, "propagator handle dropped");
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
                self.list.push_foreign(id.clone());
                if let Some(chunk) = self.digest_chunker.push((id, message.content_hash())) {
                    self.send_digest(chunk, false).await;
                }
            }
            Some(Err(err)) => {
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
        self.list.finalize_foreign();
        let chunk = self.digest_chunker.flush().unwrap_or_default();
        self.send_digest(chunk, true).await;
    }

    async fn handle_primary_response(&mut self, ids: Vec<MessageId>, is_final: bool) -> bool {
        for id in ids {
            self.list.push_primary(id);
        }
        if is_final {
            self.list.finalize_primary();
        }
        self.do_check().await
    }

    /// Drain what the requester is known to be missing, then decide whether
    /// anything can still change. Returns true when the worker is done.
    async fn do_check(&mut self) -> bool {
        let missing = self.list.get_diff_and_shrink();
        if !missing.is_empty() {
            self.propagate(&missing).await;
        }

        if self.list.is_finalized() && self.list.is_empty() && self.local_done {
            if let Some(chunk) = self.prop_chunker.flush() {
                self.send_propagation(chunk).await;
            }
            self.send_finished().await;
            return true;
        }
        false
    }

    async fn propagate(&mut self, ids: &[MessageId]) {
        let wanted: HashSet<&MessageId> = ids.iter().collect();
        let mut refs: Vec<MessageRef> = ids.iter().map(MessageId::reference).collect();
        refs.sort_unstable();
        refs.dedup();

        let mut stream = self
            .storage
            .query_by_refs(&self.request.stream_id, self.request.partition, &refs)
            .await;
        while let Some(item) = stream.recv().await {
            match item {
                Ok(message) => {
                    // A position lookup can surface other publishers'
                    // messages at the same position; ship only the exact
                    // ids the requester lacks.
                    if !wanted.contains(&message.id()) {
                        continue;
                    }
                    if let Some(chunk) = self.prop_chunker.push(message) {
                        self.send_propagation(chunk).await;
                    }
                }
                Err(err) => {
                    warn!(request = %self.request.request_id, error = %err, "point lookup failed mid-stream");
                    break;
                }
            }
        }
    }

    async fn send_digest(&self, digest: Vec<(MessageId, ContentHash)>, is_final: bool) {
        let _ = self
            .notice_tx
            .send(Notice::ForeignDigest {
                request_id: self.request.request_id,
                requester: self.requester,
                digest,
                is_final,
            })
            .await;
    }

    async fn send_propagation(&self, messages: Vec<StoredMessage>) {
        let _ = self
            .notice_tx
            .send(Notice::Propagation {
                request_id: self.request.request_id,
                requester: self.requester,
                messages,
            })
            .await;
    }

    async fn send_finished(&self) {
        let _ = self
            .notice_tx
            .send(Notice::PropagationFinished {
                request_id: self.request.request_id,
            })
            .await;
    }
}
