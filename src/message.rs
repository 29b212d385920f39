//! # Stream Messages and Ordering Primitives
//!
//! The data model the reconciliation protocol operates on:
//!
//! - [`MessageRef`]: comparable `(timestamp, sequence_number)` pair; the
//!   total order over messages within one stream partition and the unit of
//!   reconciliation (full messages are never exchanged when a reference
//!   suffices)
//! - [`MessageId`]: a reference plus publisher and message-chain id; the
//!   globally unique key digests are built over
//! - [`StoredMessage`]: the signed message blob the storage engine holds,
//!   with derivable fields, a canonical content hash, and signature
//!   verification

use serde::{Deserialize, Serialize};

use crate::crypto::{
    content_hash, sign_with_domain, verify_with_domain, ContentHash, SignatureError,
    MESSAGE_SIGNATURE_DOMAIN,
};
use crate::identity::{Identity, Keypair};

/// Position of a message within a stream partition.
///
/// Total order: primarily by timestamp, then by sequence number (the derived
/// `Ord` gives exactly that with this field order). Immutable value type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageRef {
    pub timestamp: i64,
    pub sequence_number: i32,
}

impl MessageRef {
    pub const fn new(timestamp: i64, sequence_number: i32) -> Self {
        Self {
            timestamp,
            sequence_number,
        }
    }

    /// Sentinel used as the open upper bound for "from now on" queries.
    pub const MAX: MessageRef = MessageRef {
        timestamp: i64::MAX,
        sequence_number: i32::MAX,
    };
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.timestamp, self.sequence_number)
    }
}

/// Globally unique message key within one stream partition.
///
/// Two publishers may legitimately produce messages at the same
/// `(timestamp, sequence_number)`, so digest entries carry the full id while
/// reconciliation lists order by [`MessageRef`] alone.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub timestamp: i64,
    pub sequence_number: i32,
    pub publisher: Identity,
    pub msg_chain_id: String,
}

impl MessageId {
    #[inline]
    pub fn reference(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.timestamp,
            self.sequence_number,
            &self.publisher.to_hex()[..16],
            self.msg_chain_id
        )
    }
}

/// A stream message as held by the storage engine.
///
/// The reconciliation core treats the payload as opaque bytes it can hash,
/// verify, and re-store. The signature covers the canonical signed payload
/// (stream id, partition, position, publisher, chain id, payload bytes)
/// with domain separation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub stream_id: String,
    pub partition: u16,
    pub timestamp: i64,
    pub sequence_number: i32,
    pub publisher: Identity,
    pub msg_chain_id: String,
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl StoredMessage {
    /// Create and sign a message. Used by publishers and tests; storage
    /// nodes only verify.
    #[allow(clippy::too_many_arguments)]
    pub fn sign(
        keypair: &Keypair,
        stream_id: impl Into<String>,
        partition: u16,
        timestamp: i64,
        sequence_number: i32,
        msg_chain_id: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        let stream_id = stream_id.into();
        let msg_chain_id = msg_chain_id.into();
        let publisher = keypair.identity();
        let signed = build_signed_payload(
            &stream_id,
            partition,
            timestamp,
            sequence_number,
            &publisher,
            &msg_chain_id,
            &payload,
        );
        let signature = sign_with_domain(keypair, MESSAGE_SIGNATURE_DOMAIN, &signed);
        Self {
            stream_id,
            partition,
            timestamp,
            sequence_number,
            publisher,
            msg_chain_id,
            payload,
            signature,
        }
    }

    #[inline]
    pub fn reference(&self) -> MessageRef {
        MessageRef::new(self.timestamp, self.sequence_number)
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            timestamp: self.timestamp,
            sequence_number: self.sequence_number,
            publisher: self.publisher,
            msg_chain_id: self.msg_chain_id.clone(),
        }
    }

    /// BLAKE3 hash over the canonical signed payload. This is the value
    /// exchanged in query digests: equal hashes mean byte-identical content.
    pub fn content_hash(&self) -> ContentHash {
        content_hash(&self.signed_payload())
    }

    /// Verify the publisher's signature over the canonical payload.
    pub fn verify(&self) -> Result<(), SignatureError> {
        verify_with_domain(
            &self.publisher,
            MESSAGE_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
    }

    fn signed_payload(&self) -> Vec<u8> {
        build_signed_payload(
            &self.stream_id,
            self.partition,
            self.timestamp,
            self.sequence_number,
            &self.publisher,
            &self.msg_chain_id,
            &self.payload,
        )
    }
}

/// Canonical byte layout signed by the publisher. Length-prefixed fields so
/// no two distinct messages can share an encoding.
fn build_signed_payload(
    stream_id: &str,
    partition: u16,
    timestamp: i64,
    sequence_number: i32,
    publisher: &Identity,
    msg_chain_id: &str,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        8 + stream_id.len() + 2 + 8 + 4 + 32 + 8 + msg_chain_id.len() + 8 + payload.len(),
    );
    out.extend_from_slice(&(stream_id.len() as u64).to_le_bytes());
    out.extend_from_slice(stream_id.as_bytes());
    out.extend_from_slice(&partition.to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&sequence_number.to_le_bytes());
    out.extend_from_slice(publisher.as_bytes());
    out.extend_from_slice(&(msg_chain_id.len() as u64).to_le_bytes());
    out.extend_from_slice(msg_chain_id.as_bytes());
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(payload);
    out
}
