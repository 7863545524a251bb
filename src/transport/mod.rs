//! Transport layer for broker communication
//!
//! This module provides the transport abstraction the reconnection
//! supervisor drives, plus the MQTT implementation. The abstraction exists
//! so the pipeline can be exercised against an in-memory transport in
//! tests.

use crate::error::TransportError;
use crate::message::{DeliveryTag, InboundMessage, QosLevel, TopicSubscription};

pub mod mqtt;

/// Event produced by [`Transport::next_event`]
#[derive(Debug)]
pub enum TransportEvent {
    /// An application message arrived on a subscribed topic
    Message(InboundMessage),
    /// The connection ended; the supervisor decides whether to reconnect
    Disconnected { reason: String },
}

/// Transport trait for broker sessions
///
/// One connection segment at a time: `connect` tears down any previous
/// session state, bumps the delivery epoch and establishes a fresh link.
/// The supervisor owns the transport exclusively, so every method takes
/// `&mut self`.
#[async_trait::async_trait]
pub trait Transport: Send {
    /// Establish a connection, returning the new delivery epoch
    async fn connect(&mut self) -> Result<u32, TransportError>;

    /// Subscribe to the given topic filters on the current connection
    async fn subscribe(
        &mut self,
        subscriptions: &[TopicSubscription],
    ) -> Result<(), TransportError>;

    /// Wait for the next inbound event
    ///
    /// Returns `Disconnected` exactly once per connection loss; after that
    /// the caller must `connect` again before polling.
    async fn next_event(&mut self) -> TransportEvent;

    /// Acknowledge a delivery from the current epoch
    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Publish a message on the current connection
    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError>;

    /// Close the session for good; `connect` fails afterwards
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    /// Delivery epoch of the current connection segment
    fn epoch(&self) -> u32;

    /// Whether a live connection is currently held
    fn is_connected(&self) -> bool;
}

/// Type alias for the MQTT transport
pub type MqttTransport = mqtt::MqttTransport;
