//! # Message Bus Abstraction
//!
//! The pub/sub transport is an external collaborator: logmesh consumes it
//! through the [`MessageBus`] trait and never assumes more than
//! at-least-once delivery with no cross-publisher ordering. Self-messages
//! may or may not be filtered by the transport, so consumers re-check the
//! envelope publisher against their own identity.
//!
//! [`LoopbackBroker`] is the in-process implementation used by tests and the
//! demo binary: one broker, one [`LoopbackBus`] client per node, full
//! fan-out including the sender.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::identity::{now_ms, Identity};

/// Per-subscriber channel capacity. Slow subscribers shed messages rather
/// than stall the publisher (at-least-once transports redeliver).
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 1024;

/// A delivered bus message plus transport-level metadata.
#[derive(Clone, Debug)]
pub struct BusEnvelope {
    /// Transport-verified address of the publisher.
    pub publisher: Identity,
    /// Publish time in milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

/// Publish/subscribe transport seam.
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    /// Publish a payload on a topic. Resolves when the transport has
    /// accepted the message, not when peers have received it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a topic, receiving every delivered message as an
    /// envelope. Dropping the receiver unsubscribes.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusEnvelope>>;
}

type TopicSubscribers = HashMap<String, Vec<mpsc::Sender<BusEnvelope>>>;

/// In-process broker shared by all [`LoopbackBus`] clients of one test
/// cluster or demo process.
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    topics: Arc<Mutex<TopicSubscribers>>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bus client bound to one node identity.
    pub fn client(&self, identity: Identity) -> LoopbackBus {
        LoopbackBus {
            broker: self.clone(),
            identity,
        }
    }

    fn deliver(&self, topic: &str, envelope: BusEnvelope) {
        let mut topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(subscribers) = topics.get_mut(topic) else {
            return;
        };
        // Drop closed subscribers in place; shed on full channels.
        subscribers.retain(|tx| match tx.try_send(envelope.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(topic = %topic, "loopback subscriber lagging, message dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    fn register(&self, topic: &str, tx: mpsc::Sender<BusEnvelope>) {
        let mut topics = match self.topics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics.entry(topic.to_string()).or_default().push(tx);
    }
}

/// One node's handle onto the loopback broker.
#[derive(Clone)]
pub struct LoopbackBus {
    broker: LoopbackBroker,
    identity: Identity,
}

#[async_trait]
impl MessageBus for LoopbackBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let envelope = BusEnvelope {
            publisher: self.identity,
            timestamp_ms: now_ms(),
            payload,
        };
        // Delivered to every subscriber including the sender; consumers are
        // expected to self-filter.
        self.broker.deliver(topic, envelope);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<BusEnvelope>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.broker.register(topic, tx);
        Ok(rx)
    }
}
