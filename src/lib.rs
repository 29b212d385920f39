//! # Logmesh - Distributed Query Reconciliation for Log Streams
//!
//! Logmesh answers client queries over decentralized log storage by
//! reconciling the answering node's local data with what its peers hold:
//!
//! - **Identity**: Ed25519-based cryptographic identities (32-byte public keys)
//! - **Digests**: peers exchange compact `(message id, content hash)` claims
//!   instead of full payloads
//! - **Propagation**: only the messages the requester is actually missing
//!   travel over the bus, each verified against its publisher's signature
//! - **Liveness**: a heartbeat roster decides which peers a query waits for
//!
//! ## Architecture
//!
//! The codebase uses the **Actor Pattern** for concurrent state:
//! - The node service, each aggregator, and each propagator is a private
//!   actor behind a cheap-to-clone handle
//! - Actors own all mutable state and process commands sequentially
//!
//! ## Security Model
//!
//! - Every stored message is signed by its publisher with domain separation
//! - Propagated messages are re-verified before they are stored or emitted
//! - Wire deserialization is size-bounded; reconciliation tables are bounded
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | Query service actors and the `Node` facade |
//! | `identity` | Keypairs and node identities |
//! | `crypto` | Domain-separated signatures and content hashing |
//! | `message` | `MessageRef` ordering, ids, signed stored messages |
//! | `messages` | Wire types and bounded serialization |
//! | `bus` | Pub/sub transport seam plus in-process loopback |
//! | `storage` | Storage engine seam plus in-memory reference engine |
//! | `reconcile` | Aggregation and propagation lists |
//! | `resolution` | Per-request readiness consensus |
//! | `liveness` | Heartbeat peer roster |
//! | `executor` | Query-options dispatch onto storage |
//! | `chunker` | Bounded output batching |
//! | `aggregator` | Originating-role worker |
//! | `propagator` | Responding-role worker |
//! | `manager` | Worker registries and notices |

mod aggregator;
mod bus;
mod chunker;
mod crypto;
mod executor;
mod identity;
mod liveness;
mod manager;
mod message;
mod messages;
mod node;
mod propagator;
mod reconcile;
mod resolution;
mod storage;

pub use bus::{BusEnvelope, LoopbackBroker, LoopbackBus, MessageBus};
pub use chunker::ChunkPolicy;
pub use crypto::{ContentHash, SignatureError};
pub use identity::{Identity, Keypair};
pub use liveness::OnlinePeer;
pub use message::{MessageId, MessageRef, StoredMessage};
pub use messages::{
    deserialize_bounded, deserialize_system, serialize_system, NodeHeartbeat, QueryOptions,
    QueryPropagate, QueryRequest, QueryResponse, SystemMessage, HEARTBEAT_TOPIC, MAX_WIRE_SIZE,
    QUERY_TOPIC,
};
pub use node::{
    AssignAll, NetworkQueryService, Node, NodeConfig, NodeTelemetry, QueryAnswer, QueryError,
    QueryService, StandaloneQueryService, StaticAssignments, StreamPartAssignments,
};
pub use storage::{MemoryStore, MessageStream, Storage, StorageError};
