//! Mock implementations for testing
//!
//! Provides a scriptable in-memory Transport, recording handlers and a
//! recording dead-letter sink to enable comprehensive pipeline testing
//! without an MQTT broker.

use crate::dispatch::{DeadLetterSink, HandlerOutcome, MessageHandler};
use crate::error::{DeadLetterError, HandlerError, TransportError};
use crate::message::{DeliveryTag, InboundMessage, QosLevel, TopicSubscription};
use crate::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

/// Event a test injects into a [`MockTransport`]
#[derive(Debug)]
pub enum MockEvent {
    /// Deliver a payload on a topic
    Deliver {
        topic: String,
        payload: Vec<u8>,
        qos: QosLevel,
        redelivered: bool,
    },
    /// Drop the connection with the given reason
    Drop { reason: String },
}

/// In-memory transport driven by a [`MockTransportHandle`]
///
/// Behaves like the MQTT adapter: each `connect` bumps the epoch and
/// resets the sequence counter, acknowledgements are rejected for stale
/// epochs, and a dropped connection must be re-established before events
/// flow again. When the test script runs dry, `next_event` simply waits,
/// so a quiet connection stays connected.
pub struct MockTransport {
    events_rx: mpsc::UnboundedReceiver<MockEvent>,
    connect_failures: Arc<Mutex<VecDeque<String>>>,
    subscribe_failures: Arc<AtomicU32>,
    connect_attempts: Arc<AtomicU32>,
    subscribed: Arc<Mutex<Vec<Vec<TopicSubscription>>>>,
    acked: Arc<Mutex<Vec<DeliveryTag>>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    epoch: u32,
    next_seq: u64,
    connected: bool,
    closed: bool,
}

/// Test-side controls and recorders for a [`MockTransport`]
#[derive(Clone)]
pub struct MockTransportHandle {
    events_tx: mpsc::UnboundedSender<MockEvent>,
    connect_failures: Arc<Mutex<VecDeque<String>>>,
    subscribe_failures: Arc<AtomicU32>,
    connect_attempts: Arc<AtomicU32>,
    subscribed: Arc<Mutex<Vec<Vec<TopicSubscription>>>>,
    acked: Arc<Mutex<Vec<DeliveryTag>>>,
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockTransportHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connect_failures = Arc::new(Mutex::new(VecDeque::new()));
        let subscribe_failures = Arc::new(AtomicU32::new(0));
        let connect_attempts = Arc::new(AtomicU32::new(0));
        let subscribed = Arc::new(Mutex::new(Vec::new()));
        let acked = Arc::new(Mutex::new(Vec::new()));
        let published = Arc::new(Mutex::new(Vec::new()));

        let transport = Self {
            events_rx,
            connect_failures: connect_failures.clone(),
            subscribe_failures: subscribe_failures.clone(),
            connect_attempts: connect_attempts.clone(),
            subscribed: subscribed.clone(),
            acked: acked.clone(),
            published: published.clone(),
            epoch: 0,
            next_seq: 0,
            connected: false,
            closed: false,
        };
        let handle = MockTransportHandle {
            events_tx,
            connect_failures,
            subscribe_failures,
            connect_attempts,
            subscribed,
            acked,
            published,
        };
        (transport, handle)
    }

    /// Transport whose first `failures` connect attempts are refused
    pub fn failing_connects(failures: u32) -> (Self, MockTransportHandle) {
        let (transport, handle) = Self::new();
        {
            let mut scripted = handle.connect_failures.try_lock().expect("fresh mutex");
            for attempt in 0..failures {
                scripted.push_back(format!("scripted connect failure {}", attempt + 1));
            }
        }
        (transport, handle)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<u32, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(reason) = self.connect_failures.lock().await.pop_front() {
            return Err(TransportError::connect_refused(reason));
        }

        self.epoch += 1;
        self.next_seq = 0;
        self.connected = true;
        Ok(self.epoch)
    }

    async fn subscribe(
        &mut self,
        subscriptions: &[TopicSubscription],
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::connection_lost("not connected"));
        }
        if self.subscribe_failures.load(Ordering::SeqCst) > 0 {
            self.subscribe_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(TransportError::SubscribeFailed {
                filter: subscriptions
                    .first()
                    .map(|s| s.filter.clone())
                    .unwrap_or_default(),
                message: "scripted subscribe failure".to_string(),
            });
        }
        self.subscribed.lock().await.push(subscriptions.to_vec());
        Ok(())
    }

    async fn next_event(&mut self) -> TransportEvent {
        if !self.connected {
            return TransportEvent::Disconnected {
                reason: "not connected".to_string(),
            };
        }
        match self.events_rx.recv().await {
            Some(MockEvent::Deliver {
                topic,
                payload,
                qos,
                redelivered,
            }) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                TransportEvent::Message(InboundMessage::new(
                    DeliveryTag::new(self.epoch, seq),
                    topic,
                    payload,
                    qos,
                    redelivered,
                ))
            }
            Some(MockEvent::Drop { reason }) => {
                self.connected = false;
                TransportEvent::Disconnected { reason }
            }
            // Handle dropped: stay quiet instead of fabricating events
            None => std::future::pending().await,
        }
    }

    async fn acknowledge(&mut self, tag: DeliveryTag) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::connection_lost("not connected"));
        }
        if tag.epoch != self.epoch {
            return Err(TransportError::StaleDelivery { tag });
        }
        self.acked.lock().await.push(tag);
        Ok(())
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        _qos: QosLevel,
        _retain: bool,
    ) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::connection_lost("not connected"));
        }
        self.published.lock().await.push((topic.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        self.closed = true;
        Ok(())
    }

    fn epoch(&self) -> u32 {
        self.epoch
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl MockTransportHandle {
    /// Inject a delivery on the given topic
    pub fn deliver(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QosLevel) {
        let _ = self.events_tx.send(MockEvent::Deliver {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            redelivered: false,
        });
    }

    /// Inject a delivery carrying the broker redelivery flag
    pub fn redeliver(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QosLevel) {
        let _ = self.events_tx.send(MockEvent::Deliver {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            redelivered: true,
        });
    }

    /// Sever the connection; the supervisor will reconnect
    pub fn drop_connection(&self, reason: impl Into<String>) {
        let _ = self.events_tx.send(MockEvent::Drop {
            reason: reason.into(),
        });
    }

    /// Queue a refusal for the next connect attempt
    pub async fn fail_next_connect(&self, reason: impl Into<String>) {
        self.connect_failures.lock().await.push_back(reason.into());
    }

    /// Make the next `count` subscribe calls fail
    pub fn fail_subscribes(&self, count: u32) {
        self.subscribe_failures.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub async fn acked(&self) -> Vec<DeliveryTag> {
        self.acked.lock().await.clone()
    }

    pub async fn subscribe_rounds(&self) -> Vec<Vec<TopicSubscription>> {
        self.subscribed.lock().await.clone()
    }

    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().await.clone()
    }
}

enum HandlerMode {
    Ack,
    Nack,
    FailFirst(AtomicU32),
}

/// Handler that records every message it sees
///
/// The constructors pick what it answers: always `Ack`, always `Nack`,
/// or fail the first N invocations and ack afterwards.
pub struct RecordingHandler {
    seen: Arc<Mutex<Vec<InboundMessage>>>,
    mode: HandlerMode,
}

impl RecordingHandler {
    pub fn acking() -> Arc<Self> {
        Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            mode: HandlerMode::Ack,
        })
    }

    pub fn nacking() -> Arc<Self> {
        Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            mode: HandlerMode::Nack,
        })
    }

    pub fn failing_first(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            mode: HandlerMode::FailFirst(AtomicU32::new(failures)),
        })
    }

    pub async fn seen(&self) -> Vec<InboundMessage> {
        self.seen.lock().await.clone()
    }

    pub async fn seen_count(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<HandlerOutcome, HandlerError> {
        self.seen.lock().await.push(message.clone());
        match &self.mode {
            HandlerMode::Ack => Ok(HandlerOutcome::Ack),
            HandlerMode::Nack => Ok(HandlerOutcome::Nack),
            HandlerMode::FailFirst(remaining) => {
                let before = remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    })
                    .unwrap_or(0);
                if before > 0 {
                    Err(HandlerError::new("scripted handler failure"))
                } else {
                    Ok(HandlerOutcome::Ack)
                }
            }
        }
    }
}

/// Dead-letter sink that records what it receives
#[derive(Default)]
pub struct RecordingDeadLetter {
    received: Arc<Mutex<Vec<(InboundMessage, String)>>>,
}

impl RecordingDeadLetter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn received(&self) -> Vec<(InboundMessage, String)> {
        self.received.lock().await.clone()
    }

    pub async fn received_count(&self) -> usize {
        self.received.lock().await.len()
    }
}

#[async_trait]
impl DeadLetterSink for RecordingDeadLetter {
    async fn deliver(
        &self,
        message: &InboundMessage,
        reason: &str,
    ) -> Result<(), DeadLetterError> {
        self.received
            .lock()
            .await
            .push((message.clone(), reason.to_string()));
        Ok(())
    }
}

/// Poll `condition` until it returns true or the timeout expires
///
/// Returns false on timeout so the caller can assert with its own
/// message.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
