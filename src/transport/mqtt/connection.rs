//! Pure configuration handling for the MQTT transport
//!
//! Option building and QoS conversions live here, away from the I/O in
//! [`super::client`], so they can be tested without a broker.

use crate::config::MqttSection;
use crate::error::TransportError;
use crate::message::QosLevel;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use url::Url;

/// Build rumqttc options from config
///
/// The client id is passed in, not taken from the config, because the
/// caller resolves it once at startup and must reuse the same id on every
/// reconnect for broker-side session resumption.
pub fn configure_mqtt_options(
    client_id: &str,
    config: &MqttSection,
) -> Result<MqttOptions, TransportError> {
    // Parse broker URL to extract host and port
    let url = Url::parse(&config.broker_url)
        .map_err(|_| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;

    if !matches!(url.scheme(), "mqtt" | "mqtts") {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{} (scheme must be mqtt or mqtts)",
            config.broker_url
        )));
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    // Enable TLS for mqtts:// URLs
    if url.scheme() == "mqtts" {
        let transport = RumqttcTransport::tls_with_default_config();
        mqtt_options.set_transport(transport);
    }

    // Set authentication from environment variables
    if let Some(username) = config.username() {
        let password = config.password().unwrap_or_default();
        mqtt_options.set_credentials(&username, &password);
    }

    mqtt_options.set_keep_alive(config.keep_alive());

    // Resume the broker-side session so undelivered QoS>0 messages survive
    // a reconnect under the same client id
    mqtt_options.set_clean_start(false);

    // Acks are sent explicitly after handler completion, not on receipt
    mqtt_options.set_manual_acks(true);

    // Raise the incoming packet cap above the 10KB default; payloads are
    // opaque and can be large
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    Ok(mqtt_options)
}

/// Convert pipeline QoS to the rumqttc wire type
pub fn to_mqtt_qos(qos: QosLevel) -> QoS {
    match qos {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Convert the rumqttc wire type to pipeline QoS
pub fn from_mqtt_qos(qos: QoS) -> QosLevel {
    match qos {
        QoS::AtMostOnce => QosLevel::AtMostOnce,
        QoS::AtLeastOnce => QosLevel::AtLeastOnce,
        QoS::ExactlyOnce => QosLevel::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mqtt_config() -> MqttSection {
        toml::from_str(r#"broker_url = "mqtt://localhost:1883""#).unwrap()
    }

    #[test]
    fn test_configure_mqtt_options() {
        let config = test_mqtt_config();
        let options = configure_mqtt_options("test-consumer", &config).unwrap();
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_default_port_follows_scheme() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtts://broker.example.com".to_string();
        let options = configure_mqtt_options("test-consumer", &config).unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 8883)
        );

        config.broker_url = "mqtt://broker.example.com".to_string();
        let options = configure_mqtt_options("test-consumer", &config).unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.example.com".to_string(), 1883)
        );
    }

    #[test]
    fn test_explicit_port_wins() {
        let mut config = test_mqtt_config();
        config.broker_url = "mqtt://localhost:2883".to_string();
        let options = configure_mqtt_options("test-consumer", &config).unwrap();
        assert_eq!(options.broker_address().1, 2883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = test_mqtt_config();
        config.broker_url = "not a url".to_string();

        let result = configure_mqtt_options("test-consumer", &config);
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_unsupported_scheme_rejected() {
        let mut config = test_mqtt_config();
        config.broker_url = "http://localhost:1883".to_string();

        let result = configure_mqtt_options("test-consumer", &config);
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_qos_conversion_round_trip() {
        for qos in [
            QosLevel::AtMostOnce,
            QosLevel::AtLeastOnce,
            QosLevel::ExactlyOnce,
        ] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }
}
