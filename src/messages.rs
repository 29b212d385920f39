//! # Wire Protocol Messages
//!
//! Serializable message types exchanged over the system message bus during
//! query reconciliation. Messages are serialized with bincode under an
//! explicit size limit to prevent memory exhaustion from hostile peers.
//!
//! ## Message Types
//!
//! | Message | Direction | Purpose |
//! |---------|-----------|---------|
//! | `QueryRequest` | primary → all | announce a query, ask peers to help |
//! | `QueryResponse` | any → all | compact digest of what the sender has |
//! | `QueryPropagate` | foreign → primary | actual bytes of missing messages |
//! | `NodeHeartbeat` | all → all | liveness broadcast with endpoint metadata |
//!
//! Every query message carries the `request_id` (UUIDv4, globally unique per
//! query) and the requester's address for routing and self-filtering.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::ContentHash;
use crate::identity::Identity;
use crate::message::{MessageId, MessageRef, StoredMessage};

/// Topic carrying all query reconciliation traffic.
pub const QUERY_TOPIC: &str = "logmesh/system/query";

/// Topic carrying node liveness heartbeats.
pub const HEARTBEAT_TOPIC: &str = "logmesh/system/heartbeat";

/// Maximum serialized size of a single bus payload.
/// Sized to hold a full propagation chunk (chunk byte threshold plus
/// framing headroom).
pub const MAX_WIRE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Slightly larger than MAX_WIRE_SIZE to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_WIRE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_system(message: &SystemMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

pub fn deserialize_system(bytes: &[u8]) -> Result<SystemMessage, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Client-selected shape of a query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryOptions {
    /// The last `count` messages of the partition.
    Last { count: u64 },
    /// Everything from `from` (inclusive) onward, optionally filtered
    /// to one publisher.
    From {
        from: MessageRef,
        publisher: Option<Identity>,
    },
    /// Everything between `from` and `to` (both inclusive), optionally
    /// filtered to one publisher and message chain.
    Range {
        from: MessageRef,
        to: MessageRef,
        publisher: Option<Identity>,
        msg_chain_id: Option<String>,
    },
}

impl QueryOptions {
    /// Validate a query at the public boundary. Invalid shapes are fatal
    /// for the single request, never for the node.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            QueryOptions::Last { count } => {
                if *count == 0 {
                    return Err("last-N query with count 0".to_string());
                }
            }
            QueryOptions::From { .. } => {}
            QueryOptions::Range { from, to, .. } => {
                if from > to {
                    return Err(format!("inverted range: {from} > {to}"));
                }
            }
        }
        Ok(())
    }
}

/// A query as published on the system bus. Created once per client query;
/// immutable; identified by `request_id` for the lifetime of resolution.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub request_id: Uuid,
    pub consumer_id: String,
    pub stream_id: String,
    pub partition: u16,
    pub options: QueryOptions,
}

impl QueryRequest {
    /// Validate a request at the public boundary and on receipt from the
    /// bus. Invalid requests are fatal for the single request only.
    pub fn validate(&self) -> Result<(), String> {
        if self.stream_id.is_empty() {
            return Err("empty stream id".to_string());
        }
        self.options.validate()
    }

    pub fn new(
        consumer_id: impl Into<String>,
        stream_id: impl Into<String>,
        partition: u16,
        options: QueryOptions,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            consumer_id: consumer_id.into(),
            stream_id: stream_id.into(),
            partition,
            options,
        }
    }
}

/// One node's compact claim about what it has for a request: an enumerable
/// digest of message ids and content hashes. A node may emit multiple
/// partial responses before `is_final`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub request_id: Uuid,
    /// Address of the node that originated the request, for routing:
    /// responses where this equals the local identity belong to a query we
    /// are resolving; responses published *by* this address carry the
    /// primary's own digest.
    pub requester: Identity,
    pub digest: Vec<(MessageId, ContentHash)>,
    pub is_final: bool,
}

/// Actual bytes of messages the requester is missing, each independently
/// verifiable via its publisher signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPropagate {
    pub request_id: Uuid,
    pub requester: Identity,
    pub payload: Vec<StoredMessage>,
}

/// Liveness broadcast. The payload is endpoint metadata so peers can route
/// client traffic; the sender's identity comes from the bus envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHeartbeat {
    pub endpoint: String,
}

/// Envelope for everything logmesh puts on the bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum SystemMessage {
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
    QueryPropagate(QueryPropagate),
    Heartbeat(NodeHeartbeat),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    fn make_id(ts: i64, seq: i32) -> MessageId {
        MessageId {
            timestamp: ts,
            sequence_number: seq,
            publisher: Identity::from_bytes([1u8; 32]),
            msg_chain_id: "chain".to_string(),
        }
    }

    #[test]
    fn request_round_trip() {
        let request = QueryRequest::new(
            "consumer",
            "stream",
            3,
            QueryOptions::Range {
                from: MessageRef::new(5, 0),
                to: MessageRef::new(15, 0),
                publisher: None,
                msg_chain_id: None,
            },
        );
        let bytes = serialize_system(&SystemMessage::QueryRequest(request.clone())).unwrap();
        match deserialize_system(&bytes).unwrap() {
            SystemMessage::QueryRequest(decoded) => assert_eq!(decoded, request),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn response_round_trip() {
        let response = QueryResponse {
            request_id: Uuid::new_v4(),
            requester: Identity::from_bytes([2u8; 32]),
            digest: vec![(make_id(1, 0), [9u8; 32]), (make_id(2, 0), [8u8; 32])],
            is_final: true,
        };
        let bytes = serialize_system(&SystemMessage::QueryResponse(response.clone())).unwrap();
        match deserialize_system(&bytes).unwrap() {
            SystemMessage::QueryResponse(decoded) => assert_eq!(decoded, response),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn propagate_round_trip_preserves_message_bytes() {
        let keypair = Keypair::generate();
        let msg = StoredMessage::sign(&keypair, "stream", 0, 8, 0, "chain", b"payload".to_vec());
        let propagate = QueryPropagate {
            request_id: Uuid::new_v4(),
            requester: Identity::from_bytes([3u8; 32]),
            payload: vec![msg.clone()],
        };
        let bytes = serialize_system(&SystemMessage::QueryPropagate(propagate)).unwrap();
        match deserialize_system(&bytes).unwrap() {
            SystemMessage::QueryPropagate(decoded) => {
                assert_eq!(decoded.payload[0], msg);
                assert!(decoded.payload[0].verify().is_ok());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn malformed_data_rejected() {
        let garbage = vec![0xFF, 0xFE, 0xFD, 0xFC, 0xFB];
        assert!(deserialize_system(&garbage).is_err());

        let heartbeat = SystemMessage::Heartbeat(NodeHeartbeat {
            endpoint: "http://127.0.0.1:8080".to_string(),
        });
        let bytes = serialize_system(&heartbeat).unwrap();
        let truncated = &bytes[..bytes.len() / 2];
        assert!(deserialize_system(truncated).is_err());
    }

    #[test]
    fn options_validation() {
        assert!(QueryOptions::Last { count: 0 }.validate().is_err());
        assert!(QueryOptions::Last { count: 2 }.validate().is_ok());
        assert!(QueryOptions::Range {
            from: MessageRef::new(10, 0),
            to: MessageRef::new(5, 0),
            publisher: None,
            msg_chain_id: None,
        }
        .validate()
        .is_err());
        assert!(QueryOptions::From {
            from: MessageRef::new(0, 0),
            publisher: None,
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn request_validation_rejects_empty_stream_id() {
        let request = QueryRequest::new("consumer", "", 0, QueryOptions::Last { count: 1 });
        assert!(request.validate().is_err());

        let request = QueryRequest::new("consumer", "stream", 0, QueryOptions::Last { count: 1 });
        assert!(request.validate().is_ok());
    }
}
