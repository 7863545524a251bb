//! Test message injection utility
//!
//! Publishes a payload to a broker topic so a running consumer can be
//! exercised without standing up a real producer.
//!
//! ## Usage
//!
//! ```bash
//! # Single message at the default QoS 1
//! inject-message --topic sensors/line-a --payload '{"temp": 21.4}'
//!
//! # Burst of numbered messages to watch ordering
//! inject-message --topic sensors/line-a --payload reading --count 10
//!
//! # Retained message against a remote broker
//! inject-message --broker-url mqtts://broker.example.com:8883 \
//!   --topic config/thresholds --payload '42' --retain
//! ```

use clap::Parser;
use inletmq::config::MqttSection;
use inletmq::message::QosLevel;
use inletmq::transport::{MqttTransport, Transport};

#[derive(Parser)]
#[command(
    name = "inject-message",
    about = "Publish test messages to an MQTT topic for a running consumer"
)]
struct Args {
    /// Topic to publish to
    #[arg(long, required = true)]
    topic: String,

    /// Message payload
    #[arg(long, required = true)]
    payload: String,

    /// QoS level (0, 1 or 2)
    #[arg(long, default_value = "1")]
    qos: u8,

    /// Publish the message with the retain flag set
    #[arg(long)]
    retain: bool,

    /// Number of copies to publish; payloads get a `-N` suffix when > 1
    #[arg(long, default_value = "1")]
    count: u32,

    /// MQTT broker URL
    #[arg(long, default_value = "mqtt://localhost:1883")]
    broker_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let qos = QosLevel::try_from(args.qos)?;

    let mqtt = MqttSection {
        broker_url: args.broker_url.clone(),
        client_id: None,
        username_env: Some("MQTT_USERNAME".to_string()),
        password_env: Some("MQTT_PASSWORD".to_string()),
        keep_alive_secs: 60,
        connect_timeout_ms: 10_000,
        default_qos: args.qos,
    };

    let mut transport = MqttTransport::new(mqtt)?;
    println!("Connecting to {}...", args.broker_url);
    transport.connect().await?;

    for i in 0..args.count {
        let payload = if args.count > 1 {
            format!("{}-{i}", args.payload)
        } else {
            args.payload.clone()
        };
        transport
            .publish(&args.topic, payload.into_bytes(), qos, args.retain)
            .await?;
    }
    println!(
        "Published {} message(s) to '{}' at QoS {}",
        args.count, args.topic, args.qos
    );

    transport.disconnect().await?;
    Ok(())
}
