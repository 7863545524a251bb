//! MQTT transport adapter built on rumqttc
//!
//! This module keeps pure decision logic separate from I/O so the tricky
//! parts stay unit-testable without a broker.
//!
//! # Architecture
//!
//! The module is split into three focused sub-modules:
//!
//! - [`connection`] - Pure option building and QoS conversions
//! - [`events`] - Pure routing of rumqttc events
//! - [`client`] - The transport itself: connect, subscribe, deliver, ack
//!
//! # Usage
//!
//! ```rust,no_run
//! use inletmq::config::MqttSection;
//! use inletmq::transport::mqtt::MqttTransport;
//! use inletmq::transport::Transport;
//!
//! # tokio_test::block_on(async {
//! let mqtt: MqttSection = toml::from_str(r#"broker_url = "mqtt://localhost:1883""#)?;
//!
//! let mut transport = MqttTransport::new(mqtt)?;
//! transport.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod events;

// Re-export public types for convenience
pub use client::MqttTransport;
pub use connection::configure_mqtt_options;
pub use events::EventRoute;
