//! Inbound message types shared across the pipeline
//!
//! Defines the delivery tag scheme ((epoch, seq) pairs that stay unique
//! across reconnects) and the message record the transport adapter hands
//! to the inbox and dispatcher.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Quality-of-service level for a subscription or delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QosLevel {
    /// At most once - fire and forget, no acknowledgement
    AtMostOnce,
    /// At least once - acknowledged delivery, duplicates possible
    AtLeastOnce,
    /// Exactly once at the transport layer (delegated to the broker client)
    ExactlyOnce,
}

impl QosLevel {
    /// Whether deliveries at this level carry an acknowledgement obligation
    pub fn requires_ack(&self) -> bool {
        !matches!(self, QosLevel::AtMostOnce)
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = InvalidQos;

    fn try_from(level: u8) -> Result<Self, InvalidQos> {
        match level {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(InvalidQos(other)),
        }
    }
}

impl From<QosLevel> for u8 {
    fn from(qos: QosLevel) -> u8 {
        match qos {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

/// Error for QoS values outside 0..=2
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid QoS level {0}, expected 0, 1 or 2")]
pub struct InvalidQos(pub u8);

/// Identifier of one delivery within a connection's lifetime
///
/// `seq` increases monotonically per connection segment and resets on
/// reconnect; `epoch` increments on every re-established connection, so the
/// pair stays globally unique for the life of the consumer. Ordering is
/// epoch-major, which makes "older than the current connection" a simple
/// comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag {
    /// Connection segment counter, incremented on each successful (re)connect
    pub epoch: u32,
    /// Per-segment sequence number, starting at 0
    pub seq: u64,
}

impl DeliveryTag {
    pub fn new(epoch: u32, seq: u64) -> Self {
        Self { epoch, seq }
    }
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.seq)
    }
}

/// A topic filter paired with the QoS to request when subscribing
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct TopicSubscription {
    /// MQTT topic filter, wildcards allowed
    pub filter: String,
    /// QoS requested from the broker
    pub qos: QosLevel,
}

impl TopicSubscription {
    pub fn new(filter: impl Into<String>, qos: QosLevel) -> Self {
        Self {
            filter: filter.into(),
            qos,
        }
    }
}

/// One received application payload, created by the transport adapter
///
/// The payload is reference-counted (`Bytes`) and the topic shared
/// (`Arc<str>`), so cloning a message for retry or dead-letter bookkeeping
/// does not copy the body.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Delivery tag assigned on receipt
    pub tag: DeliveryTag,
    /// Topic the message arrived on
    pub topic: Arc<str>,
    /// Raw payload bytes
    pub payload: Bytes,
    /// QoS the broker delivered at
    pub qos: QosLevel,
    /// Broker marked this delivery as a retransmission
    pub redelivered: bool,
    /// Receipt timestamp, assigned by the adapter
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        tag: DeliveryTag,
        topic: impl Into<Arc<str>>,
        payload: impl Into<Bytes>,
        qos: QosLevel,
        redelivered: bool,
    ) -> Self {
        Self {
            tag,
            topic: topic.into(),
            payload: payload.into(),
            qos,
            redelivered,
            received_at: Utc::now(),
        }
    }

    /// Payload rendered as UTF-8, with invalid sequences replaced
    pub fn payload_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
