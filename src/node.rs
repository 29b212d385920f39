//! # Node Query Service
//!
//! The network-facing layer that binds per-request workers to the pub/sub
//! bus. One [`NetworkQueryService`] actor runs per node and owns:
//!
//! - the heartbeat loop and the [`PeerRoster`]
//! - an [`Aggregator`] per query this node originated, plus its
//!   [`QueryResolutionState`] and the caller waiting on it
//! - a [`Propagator`] per foreign query this node is assigned to help with
//!
//! All registries are explicit: entries are removed on completion and on
//! the resolution timeout, and timed-out workers are aborted rather than
//! left to drain on their own.
//!
//! [`StandaloneQueryService`] is the degenerate single-node mode: queries go
//! straight to local storage with no reconciliation machinery engaged.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::bus::{BusEnvelope, MessageBus};
use crate::chunker::{ChunkPolicy, Chunker};
use crate::crypto::ContentHash;
use crate::executor::run_local_query;
use crate::identity::{now_ms, Identity};
use crate::liveness::{OnlinePeer, PeerRoster};
use crate::manager::{Notice, Registry};
use crate::message::{MessageId, StoredMessage};
use crate::messages::{
    deserialize_system, serialize_system, NodeHeartbeat, QueryPropagate, QueryRequest,
    QueryResponse, SystemMessage, HEARTBEAT_TOPIC, QUERY_TOPIC,
};
use crate::propagator::Propagator;
use crate::resolution::QueryResolutionState;
use crate::storage::Storage;

const COMMAND_CHANNEL_CAPACITY: usize = 256;
const NOTICE_CHANNEL_CAPACITY: usize = 1024;
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// Node-level tunables. Defaults match the production protocol constants;
/// tests shrink the intervals.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Hard deadline for a query's resolution.
    pub resolution_timeout: Duration,
    /// Heartbeat broadcast period.
    pub heartbeat_interval: Duration,
    /// A peer is online if heard from within this window.
    pub liveness_threshold: Duration,
    /// Chunk bounds for digest, propagation, and output batching.
    pub chunks: ChunkPolicy,
    /// Endpoint metadata advertised in heartbeats.
    pub endpoint: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            resolution_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(1),
            liveness_threshold: Duration::from_secs(60),
            chunks: ChunkPolicy::default(),
            endpoint: String::new(),
        }
    }
}

/// Failure surfaced to the query caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// The request failed validation at the public boundary.
    InvalidRequest(String),
    /// Resolution did not complete within the timeout; no partial result
    /// is returned.
    Timeout,
    /// The service actor is gone.
    ServiceUnavailable,
}

impl std::fmt::Display for QueryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryError::InvalidRequest(msg) => write!(f, "invalid query: {msg}"),
            QueryError::Timeout => write!(f, "query resolution timed out"),
            QueryError::ServiceUnavailable => write!(f, "query service unavailable"),
        }
    }
}

impl std::error::Error for QueryError {}

/// A resolved query: the chunked data stream plus the peers that took part
/// in reconciliation.
pub struct QueryAnswer {
    pub data: mpsc::Receiver<Vec<StoredMessage>>,
    pub participants: Vec<Identity>,
}

/// Point-in-time service state, for operators and tests.
#[derive(Clone, Debug, Default)]
pub struct NodeTelemetry {
    pub online_peers: Vec<OnlinePeer>,
    pub active_aggregations: usize,
    pub active_propagations: usize,
    pub pending_resolutions: usize,
}

/// Decides which stream parts this node stores and therefore answers
/// foreign queries for.
pub trait StreamPartAssignments: Send + Sync + 'static {
    fn is_assigned(&self, stream_id: &str, partition: u16) -> bool;

    /// The concrete assignment set, or `None` for oracles that hold every
    /// part.
    fn stream_parts(&self) -> Option<HashSet<(String, u16)>>;
}

/// Every node holds every stream part. The right default for small
/// fully-replicated clusters.
pub struct AssignAll;

impl StreamPartAssignments for AssignAll {
    fn is_assigned(&self, _stream_id: &str, _partition: u16) -> bool {
        true
    }

    fn stream_parts(&self) -> Option<HashSet<(String, u16)>> {
        None
    }
}

/// Fixed assignment table.
pub struct StaticAssignments {
    parts: HashSet<(String, u16)>,
}

impl StaticAssignments {
    pub fn new(parts: impl IntoIterator<Item = (String, u16)>) -> Self {
        Self {
            parts: parts.into_iter().collect(),
        }
    }
}

impl StreamPartAssignments for StaticAssignments {
    fn is_assigned(&self, stream_id: &str, partition: u16) -> bool {
        self.parts.contains(&(stream_id.to_string(), partition))
    }

    fn stream_parts(&self) -> Option<HashSet<(String, u16)>> {
        Some(self.parts.clone())
    }
}

/// Query entry point, implemented by both deployment modes.
#[async_trait]
pub trait QueryService: Send + Sync + 'static {
    async fn process_query(&self, request: QueryRequest) -> Result<QueryAnswer, QueryError>;
    async fn online_nodes(&self) -> Vec<Identity>;
    async fn telemetry(&self) -> NodeTelemetry;
}

// ============================================================================
// Standalone mode
// ============================================================================

/// Single-node mode: no roster, no reconciliation, just the local engine
/// behind the same chunked interface.
pub struct StandaloneQueryService {
    storage: Arc<dyn Storage>,
    chunks: ChunkPolicy,
}

impl StandaloneQueryService {
    pub fn new(storage: Arc<dyn Storage>, chunks: ChunkPolicy) -> Self {
        Self { storage, chunks }
    }
}

#[async_trait]
impl QueryService for StandaloneQueryService {
    async fn process_query(&self, request: QueryRequest) -> Result<QueryAnswer, QueryError> {
        request.validate().map_err(QueryError::InvalidRequest)?;

        let mut stream = run_local_query(&self.storage, &request).await;
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut chunker: Chunker<StoredMessage> = self.chunks.chunker();
        tokio::spawn(async move {
            while let Some(item) = stream.recv().await {
                match item {
                    Ok(message) => {
                        if let Some(chunk) = chunker.push(message) {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => {
                        warn!(request = %request.request_id, error = %err, "local query stream failed");
                        break;
                    }
                }
            }
            if let Some(chunk) = chunker.flush() {
                let _ = tx.send(chunk).await;
            }
        });

        Ok(QueryAnswer {
            data: rx,
            participants: Vec::new(),
        })
    }

    async fn online_nodes(&self) -> Vec<Identity> {
        Vec::new()
    }

    async fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry::default()
    }
}

// ============================================================================
// Network mode
// ============================================================================

enum Command {
    ProcessQuery {
        request: QueryRequest,
        reply: oneshot::Sender<Result<QueryAnswer, QueryError>>,
    },
    ResolutionTimeout {
        request_id: Uuid,
    },
    OnlineNodes {
        reply: oneshot::Sender<Vec<Identity>>,
    },
    Telemetry {
        reply: oneshot::Sender<NodeTelemetry>,
    },
    Quit,
}

/// Handle to the node service actor. Cheap to clone.
#[derive(Clone)]
pub struct NetworkQueryService {
    cmd_tx: mpsc::Sender<Command>,
}

impl NetworkQueryService {
    /// Subscribe to the system topics and start the service actor.
    pub async fn spawn(
        identity: Identity,
        bus: Arc<dyn MessageBus>,
        storage: Arc<dyn Storage>,
        assignments: Arc<dyn StreamPartAssignments>,
        config: NodeConfig,
    ) -> anyhow::Result<Self> {
        let query_rx = bus.subscribe(QUERY_TOPIC).await?;
        let heartbeat_rx = bus.subscribe(HEARTBEAT_TOPIC).await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);

        let actor = ServiceActor {
            roster: PeerRoster::new(identity, config.liveness_threshold.as_millis() as u64),
            aggregations: Registry::new(),
            propagators: Registry::new(),
            resolutions: Registry::new(),
            waiters: Registry::new(),
            cmd_tx: cmd_tx.clone(),
            identity,
            bus,
            storage,
            assignments,
            config,
            notice_tx,
        };
        tokio::spawn(actor.run(cmd_rx, notice_rx, query_rx, heartbeat_rx));

        info!(node = %identity, "query service started");
        Ok(Self { cmd_tx })
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

#[async_trait]
impl QueryService for NetworkQueryService {
    async fn process_query(&self, request: QueryRequest) -> Result<QueryAnswer, QueryError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ProcessQuery {
                request,
                reply: tx,
            })
            .await
            .map_err(|_| QueryError::ServiceUnavailable)?;
        rx.await.map_err(|_| QueryError::ServiceUnavailable)?
    }

    async fn online_nodes(&self) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::OnlineNodes { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    async fn telemetry(&self) -> NodeTelemetry {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Telemetry { reply: tx }).await.is_err() {
            return NodeTelemetry::default();
        }
        rx.await.unwrap_or_default()
    }
}

/// An originated query's aggregator plus the request it serves, kept
/// together so inbound traffic can be checked against the request.
struct ActiveAggregation {
    request: QueryRequest,
    handle: Aggregator,
}

/// The caller blocked on resolution, plus everything that must be handed
/// over or torn down when it completes.
struct PendingQuery {
    reply: oneshot::Sender<Result<QueryAnswer, QueryError>>,
    data: Option<mpsc::Receiver<Vec<StoredMessage>>>,
    /// Own digest chunks accumulated until the local stream finishes.
    digest_buffer: Vec<(MessageId, ContentHash)>,
}

struct ServiceActor {
    identity: Identity,
    bus: Arc<dyn MessageBus>,
    storage: Arc<dyn Storage>,
    assignments: Arc<dyn StreamPartAssignments>,
    config: NodeConfig,
    roster: PeerRoster,
    aggregations: Registry<ActiveAggregation>,
    propagators: Registry<Propagator>,
    resolutions: Registry<QueryResolutionState>,
    waiters: Registry<PendingQuery>,
    cmd_tx: mpsc::Sender<Command>,
    notice_tx: mpsc::Sender<Notice>,
}

impl ServiceActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut notice_rx: mpsc::Receiver<Notice>,
        mut query_rx: mpsc::Receiver<BusEnvelope>,
        mut heartbeat_rx: mpsc::Receiver<BusEnvelope>,
    ) {
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::ProcessQuery { request, reply }) => {
                            self.handle_process_query(request, reply).await;
                        }
                        Some(Command::ResolutionTimeout { request_id }) => {
                            self.handle_timeout(request_id);
                        }
                        Some(Command::OnlineNodes { reply }) => {
                            let _ = reply.send(self.roster.online_nodes(now_ms()));
                        }
                        Some(Command::Telemetry { reply }) => {
                            let _ = reply.send(self.telemetry());
                        }
                        Some(Command::Quit) | None => {
                            debug!(node = %self.identity, "query service actor quitting");
                            break;
                        }
                    }
                }
                Some(notice) = notice_rx.recv() => {
                    self.handle_notice(notice).await;
                }
                Some(envelope) = query_rx.recv() => {
                    self.handle_query_traffic(envelope).await;
                }
                Some(envelope) = heartbeat_rx.recv() => {
                    self.handle_heartbeat(envelope);
                }
                _ = heartbeat.tick() => {
                    self.publish_heartbeat().await;
                }
            }
        }

        // Tear down in-flight workers so shutdown is immediate.
        for aggregation in self.aggregations.values() {
            aggregation.handle.abort();
        }
        for propagator in self.propagators.values() {
            propagator.abort();
        }
    }

    fn telemetry(&self) -> NodeTelemetry {
        NodeTelemetry {
            online_peers: self.roster.online_peers(now_ms()),
            active_aggregations: self.aggregations.len(),
            active_propagations: self.propagators.len(),
            pending_resolutions: self.resolutions.len(),
        }
    }

    async fn handle_process_query(
        &mut self,
        request: QueryRequest,
        reply: oneshot::Sender<Result<QueryAnswer, QueryError>>,
    ) {
        if let Err(msg) = request.validate() {
            let _ = reply.send(Err(QueryError::InvalidRequest(msg)));
            return;
        }
        if !self
            .assignments
            .is_assigned(&request.stream_id, request.partition)
        {
            let _ = reply.send(Err(QueryError::InvalidRequest(format!(
                "stream part {}/{} is not assigned to this node",
                request.stream_id, request.partition
            ))));
            return;
        }

        let request_id = request.request_id;
        let roster = self.roster.online_nodes(now_ms());
        debug!(request = %request_id, peers = roster.len(), "processing query");

        let (handle, output) = Aggregator::spawn(
            request.clone(),
            roster.clone(),
            Arc::clone(&self.storage),
            self.config.chunks,
            self.notice_tx.clone(),
        );
        self.aggregations.insert(
            request_id,
            ActiveAggregation {
                request: request.clone(),
                handle,
            },
        );
        self.resolutions
            .insert(request_id, QueryResolutionState::new(roster));
        self.waiters.insert(
            request_id,
            PendingQuery {
                reply,
                data: Some(output),
                digest_buffer: Vec::new(),
            },
        );

        self.publish(SystemMessage::QueryRequest(request)).await;

        let cmd_tx = self.cmd_tx.clone();
        let timeout = self.config.resolution_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = cmd_tx.send(Command::ResolutionTimeout { request_id }).await;
        });

        // An empty roster resolves with no network round trip at all.
        self.try_complete(request_id);
    }

    /// Fires for every query, resolved or not; only still-pending ones are
    /// torn down.
    fn handle_timeout(&mut self, request_id: Uuid) {
        let Some(pending) = self.waiters.remove(&request_id) else {
            return;
        };
        warn!(request = %request_id, "query resolution timed out");
        self.resolutions.remove(&request_id);
        if let Some(aggregation) = self.aggregations.remove(&request_id) {
            aggregation.handle.abort();
        }
        let _ = pending.reply.send(Err(QueryError::Timeout));
    }

    fn try_complete(&mut self, request_id: Uuid) {
        let ready = self
            .resolutions
            .get(&request_id)
            .map_or(false, QueryResolutionState::is_ready);
        if !ready {
            return;
        }
        let Some(state) = self.resolutions.remove(&request_id) else {
            return;
        };
        let Some(mut pending) = self.waiters.remove(&request_id) else {
            return;
        };
        debug!(request = %request_id, "query resolution ready");
        let data = match pending.data.take() {
            Some(data) => data,
            None => mpsc::channel(1).1,
        };
        let _ = pending.reply.send(Ok(QueryAnswer {
            data,
            participants: state.participants(),
        }));
    }

    async fn handle_notice(&mut self, notice: Notice) {
        match notice {
            Notice::OwnDigest {
                request_id,
                digest,
                is_final,
            } => {
                if let Some(pending) = self.waiters.get_mut(&request_id) {
                    pending.digest_buffer.extend(digest.iter().cloned());
                    if is_final {
                        let full = std::mem::take(&mut pending.digest_buffer);
                        if let Some(state) = self.resolutions.get_mut(&request_id) {
                            state.set_primary_digest(full);
                        }
                    }
                }
                self.publish(SystemMessage::QueryResponse(QueryResponse {
                    request_id,
                    requester: self.identity,
                    digest,
                    is_final,
                }))
                .await;
                self.try_complete(request_id);
            }
            Notice::ForeignDigest {
                request_id,
                requester,
                digest,
                is_final,
            } => {
                self.publish(SystemMessage::QueryResponse(QueryResponse {
                    request_id,
                    requester,
                    digest,
                    is_final,
                }))
                .await;
            }
            Notice::Propagation {
                request_id,
                requester,
                messages,
            } => {
                self.publish(SystemMessage::QueryPropagate(QueryPropagate {
                    request_id,
                    requester,
                    payload: messages,
                }))
                .await;
            }
            Notice::AggregationFinished { request_id } => {
                self.aggregations.remove(&request_id);
            }
            Notice::PropagationFinished { request_id } => {
                self.propagators.remove(&request_id);
            }
        }
    }

    async fn handle_query_traffic(&mut self, envelope: BusEnvelope) {
        let message = match deserialize_system(&envelope.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(publisher = %envelope.publisher, error = %err, "dropping malformed query traffic");
                return;
            }
        };
        match message {
            SystemMessage::QueryRequest(request) => {
                self.handle_foreign_request(envelope.publisher, request);
            }
            SystemMessage::QueryResponse(response) => {
                self.handle_response(envelope.publisher, response).await;
            }
            SystemMessage::QueryPropagate(propagate) => {
                if propagate.requester == self.identity && envelope.publisher != self.identity {
                    self.handle_inbound_propagation(propagate.request_id, propagate.payload)
                        .await;
                }
            }
            SystemMessage::Heartbeat(_) => {
                debug!(publisher = %envelope.publisher, "heartbeat on query topic ignored");
            }
        }
    }

    fn handle_foreign_request(&mut self, publisher: Identity, request: QueryRequest) {
        if publisher == self.identity {
            return;
        }
        if request.validate().is_err() {
            warn!(request = %request.request_id, publisher = %publisher, "ignoring invalid foreign query");
            return;
        }
        if !self
            .assignments
            .is_assigned(&request.stream_id, request.partition)
        {
            debug!(request = %request.request_id, stream = %request.stream_id, "stream part not assigned here");
            return;
        }
        if self.propagators.contains(&request.request_id) {
            return;
        }
        debug!(request = %request.request_id, requester = %publisher, "helping with foreign query");
        let propagator = Propagator::spawn(
            request.clone(),
            publisher,
            Arc::clone(&self.storage),
            self.config.chunks,
            self.config.resolution_timeout,
            self.notice_tx.clone(),
        );
        self.propagators.insert(request.request_id, propagator);
    }

    async fn handle_response(&mut self, publisher: Identity, response: QueryResponse) {
        if response.requester == self.identity {
            // Traffic about a query we originated. Our own digest chunks
            // echo back from the bus; they were already applied via notices.
            if publisher == self.identity {
                return;
            }
            let ids: Vec<MessageId> =
                response.digest.iter().map(|(id, _)| id.clone()).collect();
            if let Some(aggregation) = self.aggregations.get(&response.request_id) {
                aggregation
                    .handle
                    .on_foreign_response(publisher, ids, response.is_final)
                    .await;
            }
            if let Some(state) = self.resolutions.get_mut(&response.request_id) {
                state.on_foreign_response(publisher, response.digest, response.is_final);
            }
            self.try_complete(response.request_id);
        } else if publisher == response.requester {
            // The requester's own digest for a query we are helping with.
            let ids: Vec<MessageId> =
                response.digest.into_iter().map(|(id, _)| id).collect();
            if let Some(propagator) = self.propagators.get(&response.request_id) {
                propagator.on_primary_response(ids, response.is_final).await;
            }
        }
    }

    async fn handle_inbound_propagation(
        &mut self,
        request_id: Uuid,
        mut messages: Vec<StoredMessage>,
    ) {
        // Payloads must belong to the stream part the query named.
        if let Some(aggregation) = self.aggregations.get(&request_id) {
            let stream_id = aggregation.request.stream_id.clone();
            let partition = aggregation.request.partition;
            messages.retain(|message| {
                let consistent =
                    message.stream_id == stream_id && message.partition == partition;
                if !consistent {
                    warn!(request = %request_id, message = %message.id(), "propagated message for the wrong stream part");
                }
                consistent
            });
        }

        let accepted = match self.resolutions.get_mut(&request_id) {
            Some(state) => state.on_propagation(messages),
            // Resolution already completed; the aggregator may still want
            // the bytes, but they must pass the same verification.
            None => messages
                .into_iter()
                .filter(|message| message.verify().is_ok())
                .collect(),
        };
        if accepted.is_empty() {
            return;
        }
        if let Some(aggregation) = self.aggregations.get(&request_id) {
            aggregation.handle.on_propagation(accepted).await;
        }
        self.try_complete(request_id);
    }

    fn handle_heartbeat(&mut self, envelope: BusEnvelope) {
        match deserialize_system(&envelope.payload) {
            Ok(SystemMessage::Heartbeat(heartbeat)) => {
                self.roster
                    .observe(envelope.publisher, heartbeat.endpoint, now_ms());
            }
            Ok(_) => {
                debug!(publisher = %envelope.publisher, "non-heartbeat traffic on heartbeat topic");
            }
            Err(err) => {
                warn!(publisher = %envelope.publisher, error = %err, "dropping malformed heartbeat");
            }
        }
    }

    async fn publish_heartbeat(&self) {
        let message = SystemMessage::Heartbeat(NodeHeartbeat {
            endpoint: self.config.endpoint.clone(),
        });
        match serialize_system(&message) {
            Ok(bytes) => {
                if let Err(err) = self.bus.publish(HEARTBEAT_TOPIC, bytes).await {
                    warn!(error = %err, "heartbeat publish failed");
                }
            }
            Err(err) => warn!(error = %err, "heartbeat serialization failed"),
        }
    }

    async fn publish(&self, message: SystemMessage) {
        match serialize_system(&message) {
            Ok(bytes) => {
                if let Err(err) = self.bus.publish(QUERY_TOPIC, bytes).await {
                    warn!(error = %err, "query topic publish failed");
                }
            }
            Err(err) => warn!(error = %err, "query message serialization failed"),
        }
    }
}

// ============================================================================
// Node facade
// ============================================================================

/// A logmesh node in either deployment mode.
pub struct Node {
    service: Arc<dyn QueryService>,
}

impl Node {
    /// Clustered mode: reconcile queries with peers over the bus.
    pub async fn network(
        identity: Identity,
        bus: Arc<dyn MessageBus>,
        storage: Arc<dyn Storage>,
        assignments: Arc<dyn StreamPartAssignments>,
        config: NodeConfig,
    ) -> anyhow::Result<Self> {
        let service = NetworkQueryService::spawn(identity, bus, storage, assignments, config).await?;
        Ok(Self {
            service: Arc::new(service),
        })
    }

    /// Single-node mode: answer from local storage only.
    pub fn standalone(storage: Arc<dyn Storage>, config: NodeConfig) -> Self {
        Self {
            service: Arc::new(StandaloneQueryService::new(storage, config.chunks)),
        }
    }

    pub async fn process_query_request(
        &self,
        request: QueryRequest,
    ) -> Result<QueryAnswer, QueryError> {
        self.service.process_query(request).await
    }

    pub async fn online_nodes(&self) -> Vec<Identity> {
        self.service.online_nodes().await
    }

    pub async fn telemetry(&self) -> NodeTelemetry {
        self.service.telemetry().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;
    use crate::message::MessageRef;
    use crate::messages::QueryOptions;
    use crate::storage::MemoryStore;

    async fn drain(mut answer: QueryAnswer) -> Vec<i64> {
        let mut out = Vec::new();
        while let Some(chunk) = answer.data.recv().await {
            out.extend(chunk.into_iter().map(|m| m.timestamp));
        }
        out
    }

    #[tokio::test]
    async fn standalone_last_n_returns_newest_messages() {
        let store = MemoryStore::shared();
        let keypair = Keypair::generate();
        for ts in [1i64, 2, 3] {
            let msg = StoredMessage::sign(&keypair, "stream", 0, ts, 0, "chain", vec![]);
            store.store(msg).await.unwrap();
        }
        let node = Node::standalone(store, NodeConfig::default());

        let answer = node
            .process_query_request(QueryRequest::new(
                "consumer",
                "stream",
                0,
                QueryOptions::Last { count: 2 },
            ))
            .await
            .unwrap();
        assert!(answer.participants.is_empty());
        assert_eq!(drain(answer).await, vec![2, 3]);
    }

    #[tokio::test]
    async fn standalone_rejects_invalid_options() {
        let node = Node::standalone(MemoryStore::shared(), NodeConfig::default());
        let result = node
            .process_query_request(QueryRequest::new(
                "consumer",
                "stream",
                0,
                QueryOptions::Range {
                    from: MessageRef::new(10, 0),
                    to: MessageRef::new(1, 0),
                    publisher: None,
                    msg_chain_id: None,
                },
            ))
            .await;
        assert!(matches!(result, Err(QueryError::InvalidRequest(_))));
    }

    #[test]
    fn static_assignments_gate_by_stream_part() {
        let assignments = StaticAssignments::new([("events".to_string(), 0)]);
        assert!(assignments.is_assigned("events", 0));
        assert!(!assignments.is_assigned("events", 1));
        assert!(!assignments.is_assigned("other", 0));

        let parts = assignments.stream_parts().unwrap();
        assert_eq!(parts.len(), 1);
        assert!(parts.contains(&("events".to_string(), 0)));

        assert!(AssignAll.is_assigned("anything", 42));
        assert!(AssignAll.stream_parts().is_none());
    }
}
