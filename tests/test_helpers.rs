//! Test helpers and utilities for integration tests

use async_trait::async_trait;
use inletmq::config::{
    ConsumerConfig, DispatchSection, InboxSection, MqttSection, OverflowPolicy, ReconnectSection,
    SubscriptionEntry,
};
use inletmq::dispatch::{HandlerOutcome, MessageHandler};
use inletmq::error::HandlerError;
use inletmq::message::InboundMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Create a test configuration with short delays for integration tests
#[allow(dead_code)]
pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        mqtt: MqttSection {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: Some("test-consumer".to_string()),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            connect_timeout_ms: 5000,
            default_qos: 1,
        },
        subscriptions: vec![SubscriptionEntry {
            filter: "sensors/#".to_string(),
            qos: None,
        }],
        inbox: InboxSection {
            capacity: 32,
            overflow: OverflowPolicy::Block,
        },
        reconnect: ReconnectSection {
            base_delay_ms: 10,
            max_delay_ms: 50,
            max_attempts: 0,
        },
        dispatch: DispatchSection {
            workers: 2,
            retry_limit: 2,
            retry_delay_ms: 5,
            drain_timeout_ms: 2000,
        },
    }
}

/// Handler that sleeps before acking, for backpressure and drain tests
#[allow(dead_code)]
pub struct SlowHandler {
    delay: Duration,
    seen: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Payloads handled so far, in completion order
    pub async fn seen(&self) -> Vec<String> {
        self.seen.lock().await.clone()
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl MessageHandler for SlowHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<HandlerOutcome, HandlerError> {
        tokio::time::sleep(self.delay).await;
        self.seen
            .lock()
            .await
            .push(message.payload_lossy().into_owned());
        Ok(HandlerOutcome::Ack)
    }
}
