//! Impure I/O operations for the MQTT transport
//!
//! This module owns the rumqttc client and event loop, maps polled events
//! into pipeline messages and sends manual acks. Connection lifecycle
//! decisions (when to reconnect, how long to wait) belong to the
//! supervisor, not here.

use super::connection::{configure_mqtt_options, from_mqtt_qos, to_mqtt_qos};
use super::events::{route_event, EventRoute};
use crate::config::MqttSection;
use crate::error::TransportError;
use crate::message::{DeliveryTag, InboundMessage, QosLevel, TopicSubscription};
use crate::observability::metrics::METRICS;
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::v5::{ConnectReturnCode, Packet, Publish};
use rumqttc::v5::{AsyncClient, Event, EventLoop};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// MQTT implementation of [`Transport`]
///
/// Holds at most one live connection. Each successful `connect` bumps the
/// delivery epoch and resets per-connection state: the sequence counter
/// and the map of unacked publishes kept for manual acks.
pub struct MqttTransport {
    client_id: String,
    config: MqttSection,
    client: Option<AsyncClient>,
    event_loop: Option<EventLoop>,
    epoch: u32,
    next_seq: u64,
    pending: HashMap<u64, Publish>,
    closed: bool,
}

impl MqttTransport {
    /// Create a transport for the given broker settings
    ///
    /// Resolves the client id once so every reconnect presents the same
    /// identity, and validates the broker URL eagerly so a typo fails at
    /// startup instead of looping through reconnect attempts.
    pub fn new(config: MqttSection) -> Result<Self, TransportError> {
        let client_id = config.resolved_client_id();
        configure_mqtt_options(&client_id, &config)?;

        Ok(Self {
            client_id,
            config,
            client: None,
            event_loop: None,
            epoch: 0,
            next_seq: 0,
            pending: HashMap::new(),
            closed: false,
        })
    }

    /// Client id presented to the broker
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Drop the dead connection handles and the acks they owed
    fn teardown(&mut self) {
        self.client = None;
        self.event_loop = None;
        if !self.pending.is_empty() {
            debug!(
                unacked = self.pending.len(),
                "Dropping unacked deliveries from dead connection; broker will redeliver"
            );
            self.pending.clear();
        }
    }

    /// Poll the fresh event loop until the broker confirms the connection
    async fn wait_for_connack(
        event_loop: &mut EventLoop,
        timeout_ms: u64,
    ) -> Result<bool, TransportError> {
        let wait = async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if matches!(ack.code, ConnectReturnCode::Success) {
                            return Ok(ack.session_present);
                        }
                        return Err(TransportError::connect_refused(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(TransportError::connect_failed(
                            "connection attempt failed",
                            e,
                        ))
                    }
                }
            }
        };

        match tokio::time::timeout(std::time::Duration::from_millis(timeout_ms), wait).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::ConnectTimeout { timeout_ms }),
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&mut self) -> Result<u32, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let options = configure_mqtt_options(&self.client_id, &self.config)?;
        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);

        let session_present =
            Self::wait_for_connack(&mut event_loop, self.config.connect_timeout_ms).await?;

        self.epoch += 1;
        self.next_seq = 0;
        self.pending.clear();
        self.client = Some(client);
        self.event_loop = Some(event_loop);

        info!(
            client_id = %self.client_id,
            epoch = self.epoch,
            session_present,
            "Connected to MQTT broker"
        );
        Ok(self.epoch)
    }

    async fn subscribe(
        &mut self,
        subscriptions: &[TopicSubscription],
    ) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::Closed)?;

        for sub in subscriptions {
            client
                .subscribe(sub.filter.as_str(), to_mqtt_qos(sub.qos))
                .await
                .map_err(|e| TransportError::SubscribeFailed {
                    filter: sub.filter.clone(),
                    message: e.to_string(),
                })?;
            debug!(filter = %sub.filter, qos = ?sub.qos, "Subscription requested");
        }
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        loop {
            let polled = match self.event_loop.as_mut() {
                Some(event_loop) => event_loop.poll().await,
                None => {
                    return TransportEvent::Disconnected {
                        reason: "transport not connected".to_string(),
                    }
                }
            };

            match polled {
                Ok(event) => match route_event(event) {
                    EventRoute::Deliver(publish) => {
                        let seq = self.next_seq;
                        self.next_seq += 1;

                        let tag = DeliveryTag::new(self.epoch, seq);
                        let qos = from_mqtt_qos(publish.qos);
                        let topic: Arc<str> =
                            Arc::from(String::from_utf8_lossy(&publish.topic).into_owned());
                        let message = InboundMessage::new(
                            tag,
                            topic,
                            publish.payload.clone(),
                            qos,
                            publish.dup,
                        );

                        if qos.requires_ack() {
                            self.pending.insert(seq, publish);
                        }

                        METRICS.record_message_received();
                        return TransportEvent::Message(message);
                    }
                    EventRoute::ConnectionClosed(reason) => {
                        self.teardown();
                        return TransportEvent::Disconnected { reason };
                    }
                    EventRoute::SubscribeAck { packet_id, failures } => {
                        if failures.is_empty() {
                            debug!(packet_id, "Subscription confirmed");
                        } else {
                            warn!(packet_id, ?failures, "Broker rejected subscription");
                        }
                    }
                    EventRoute::Infrastructure(event) => {
                        debug!(target: "mqtt_transport", event = %event, "MQTT event");
                    }
                    EventRoute::Outgoing => {}
                },
                Err(e) => {
                    self.teardown();
                    return TransportEvent::Disconnected {
                        reason: e.to_string(),
                    };
                }
            }
        }
    }

    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        if tag.epoch != self.epoch {
            return Err(TransportError::StaleDelivery { tag });
        }

        let publish = self
            .pending
            .remove(&tag.seq)
            .ok_or(TransportError::UnknownDelivery { tag })?;

        let client = self
            .client
            .as_ref()
            .ok_or_else(|| TransportError::connection_lost("connection lost before ack"))?;

        client
            .ack(&publish)
            .await
            .map_err(|e| TransportError::connection_lost(format!("ack failed: {e}")))?;

        debug!(%tag, "Delivery acknowledged");
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::Closed)?;

        client
            .publish(topic, to_mqtt_qos(qos), retain, payload)
            .await
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.disconnect().await {
                debug!("Disconnect request failed: {e}");
            }
        }
        self.event_loop = None;
        self.pending.clear();
        self.closed = true;
        info!(client_id = %self.client_id, "MQTT transport closed");
        Ok(())
    }

    fn epoch(&self) -> u32 {
        self.epoch
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && !self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::QoS;

    fn test_transport() -> MqttTransport {
        let config: MqttSection =
            toml::from_str(r#"broker_url = "mqtt://localhost:1883""#).unwrap();
        MqttTransport::new(config).unwrap()
    }

    fn pending_publish(pkid: u16) -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("sensors/kitchen/temp"),
            pkid,
            payload: Bytes::from("21.5"),
            properties: None,
        }
    }

    #[test]
    fn test_new_rejects_invalid_url() {
        let config: MqttSection = toml::from_str(r#"broker_url = "nonsense""#).unwrap();
        assert!(matches!(
            MqttTransport::new(config),
            Err(TransportError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_generated_client_id_is_stable_across_connects() {
        let transport = test_transport();
        let id = transport.client_id().to_string();
        assert!(id.starts_with("inletmq-"));
        // The id is resolved once in new(); connect() reuses self.client_id
        assert_eq!(transport.client_id(), id);
    }

    #[tokio::test]
    async fn test_connect_fails_fast_on_refused_port() {
        let config: MqttSection = toml::from_str(
            r#"
broker_url = "mqtt://127.0.0.1:1"
connect_timeout_ms = 2000
"#,
        )
        .unwrap();
        let mut transport = MqttTransport::new(config).unwrap();

        let result = transport.connect().await;
        assert!(result.is_err());
        assert!(!transport.is_connected());
        assert_eq!(transport.epoch(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_stale_epoch() {
        let mut transport = test_transport();
        transport.epoch = 3;

        let result = transport.acknowledge(DeliveryTag::new(2, 0)).await;
        assert!(matches!(result, Err(TransportError::StaleDelivery { .. })));
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_seq() {
        let mut transport = test_transport();
        transport.epoch = 1;

        let result = transport.acknowledge(DeliveryTag::new(1, 42)).await;
        assert!(matches!(result, Err(TransportError::UnknownDelivery { .. })));
    }

    #[tokio::test]
    async fn test_double_acknowledge_is_unknown() {
        let mut transport = test_transport();
        transport.epoch = 1;
        transport.pending.insert(0, pending_publish(1));
        // No live client: the first ack consumes the pending entry and then
        // fails at the send stage, the second no longer finds it
        let first = transport.acknowledge(DeliveryTag::new(1, 0)).await;
        assert!(matches!(first, Err(TransportError::ConnectionLost { .. })));

        let second = transport.acknowledge(DeliveryTag::new(1, 0)).await;
        assert!(matches!(second, Err(TransportError::UnknownDelivery { .. })));
    }

    #[tokio::test]
    async fn test_next_event_without_connection() {
        let mut transport = test_transport();
        match transport.next_event().await {
            TransportEvent::Disconnected { reason } => {
                assert!(reason.contains("not connected"));
            }
            other => panic!("Expected Disconnected, got {other:?}"),
        }
    }

    #[test]
    fn test_teardown_clears_pending() {
        let mut transport = test_transport();
        transport.pending.insert(0, pending_publish(1));
        transport.pending.insert(1, pending_publish(2));

        transport.teardown();
        assert!(transport.pending.is_empty());
        assert!(!transport.is_connected());
    }
}
