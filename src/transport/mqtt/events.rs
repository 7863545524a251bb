//! Pure routing of rumqttc events
//!
//! Classifies each polled event into the small set of outcomes the
//! transport cares about. Routing decisions are pure so they can be tested
//! against hand-built packets.

use rumqttc::v5::mqttbytes::v5::{Packet, Publish, SubscribeReasonCode};
use rumqttc::v5::Event;

/// Routing decision for one polled event
#[derive(Debug)]
pub enum EventRoute {
    /// Application message to hand to the pipeline
    Deliver(Publish),
    /// The broker ended the connection
    ConnectionClosed(String),
    /// Subscription acknowledgement; failures carry the rejected codes
    SubscribeAck {
        packet_id: u16,
        failures: Vec<String>,
    },
    /// Protocol chatter (ping responses, mid-stream acks)
    Infrastructure(String),
    /// Outgoing event, handled by rumqttc internally
    Outgoing,
}

/// Route one rumqttc event
pub fn route_event(event: Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::Publish(publish) => EventRoute::Deliver(publish),
            Packet::Disconnect(disconnect) => EventRoute::ConnectionClosed(format!(
                "broker disconnect: {:?}",
                disconnect.reason_code
            )),
            Packet::SubAck(suback) => EventRoute::SubscribeAck {
                packet_id: suback.pkid,
                failures: suback_failures(&suback.return_codes),
            },
            other => EventRoute::Infrastructure(format!("{other:?}")),
        },
        Event::Outgoing(_) => EventRoute::Outgoing,
    }
}

/// Collect the reason codes in a SubAck that denied the subscription
///
/// QoS0/1/2 codes are grants (possibly downgraded); everything else is a
/// refusal worth surfacing.
pub fn suback_failures(return_codes: &[SubscribeReasonCode]) -> Vec<String> {
    return_codes
        .iter()
        .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
        .map(|code| format!("{code:?}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::v5::mqttbytes::v5::{
        ConnAck, ConnectReturnCode, Disconnect, DisconnectReasonCode, SubAck,
    };
    use rumqttc::v5::mqttbytes::QoS;

    fn sample_publish() -> Publish {
        Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Bytes::from("sensors/kitchen/temp"),
            pkid: 7,
            payload: Bytes::from("21.5"),
            properties: None,
        }
    }

    #[test]
    fn test_publish_routes_to_deliver() {
        let event = Event::Incoming(Packet::Publish(sample_publish()));
        match route_event(event) {
            EventRoute::Deliver(publish) => {
                assert_eq!(publish.topic, Bytes::from("sensors/kitchen/temp"));
                assert_eq!(publish.pkid, 7);
            }
            other => panic!("Expected Deliver, got {other:?}"),
        }
    }

    #[test]
    fn test_disconnect_routes_to_closed_with_reason() {
        let event = Event::Incoming(Packet::Disconnect(Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: None,
        }));
        match route_event(event) {
            EventRoute::ConnectionClosed(reason) => {
                assert!(reason.contains("NormalDisconnection"));
            }
            other => panic!("Expected ConnectionClosed, got {other:?}"),
        }
    }

    #[test]
    fn test_suback_splits_grants_from_failures() {
        let event = Event::Incoming(Packet::SubAck(SubAck {
            pkid: 3,
            return_codes: vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::NotAuthorized,
            ],
            properties: None,
        }));
        match route_event(event) {
            EventRoute::SubscribeAck { packet_id, failures } => {
                assert_eq!(packet_id, 3);
                assert_eq!(failures, vec!["NotAuthorized".to_string()]);
            }
            other => panic!("Expected SubscribeAck, got {other:?}"),
        }
    }

    #[test]
    fn test_all_grants_yield_no_failures() {
        let codes = [
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::Success(QoS::AtLeastOnce),
            SubscribeReasonCode::Success(QoS::ExactlyOnce),
        ];
        assert!(suback_failures(&codes).is_empty());
    }

    #[test]
    fn test_connack_is_infrastructure_after_connect() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: true,
            code: ConnectReturnCode::Success,
            properties: None,
        }));
        assert!(matches!(
            route_event(event),
            EventRoute::Infrastructure(_)
        ));
    }
}
