//! Message dispatch from the inbox to a pluggable handler
//!
//! A router task pulls messages off the bounded inbox and hands each one
//! to a worker chosen by hashing the topic, so all messages for a topic
//! flow through the same worker in arrival order. Handler outcomes drive
//! acknowledgement timing: `Ack` confirms the delivery immediately,
//! `Nack` and handler errors are retried a bounded number of times and
//! then routed to the dead-letter sink, after which the message is
//! acknowledged anyway so the broker stops redelivering it.

pub mod dead_letter;

use crate::ack::AckTracker;
use crate::config::DispatchSection;
use crate::dispatch_span;
use crate::error::HandlerError;
use crate::inbox::Inbox;
use crate::message::InboundMessage;
use crate::observability::metrics::METRICS;
use crate::supervisor::AckRequest;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn, Instrument};

pub use dead_letter::{DeadLetterSink, LogDeadLetter};

/// What the handler wants done with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Processing succeeded, acknowledge the delivery
    Ack,
    /// Processing declined, redeliver locally up to the retry limit
    Nack,
}

/// Application-supplied message processor
///
/// Handlers receive every message exactly as the broker delivered it and
/// decide its fate. They must tolerate duplicates: at-least-once delivery
/// means a message acknowledged moments before a connection loss can
/// arrive again with `redelivered` set.
#[async_trait::async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage)
        -> Result<HandlerOutcome, HandlerError>;
}

// Workers buffer at most one message each so backpressure stays visible
// at the inbox instead of hiding in channel queues.
const WORKER_CHANNEL_CAPACITY: usize = 1;

struct WorkerContext {
    tracker: Arc<AckTracker>,
    handler: Arc<dyn MessageHandler>,
    dead_letter: Arc<dyn DeadLetterSink>,
    ack_tx: mpsc::Sender<AckRequest>,
    retry_limit: u32,
    retry_delay: Duration,
}

/// Worker pool consuming the inbox
pub struct Dispatcher {
    router: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the router and worker tasks
    ///
    /// The pool runs until the shutdown signal fires; the router then
    /// stops pulling from the inbox and drops the worker channels, and
    /// each worker finishes the message it already holds before exiting.
    pub fn spawn(
        config: &DispatchSection,
        inbox: Arc<Inbox>,
        tracker: Arc<AckTracker>,
        handler: Arc<dyn MessageHandler>,
        dead_letter: Arc<dyn DeadLetterSink>,
        ack_tx: mpsc::Sender<AckRequest>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let mut senders = Vec::with_capacity(config.workers);
        let mut workers = Vec::with_capacity(config.workers);

        // Workers end up holding the only ack senders, so the ack channel
        // closes exactly when the last worker stops.
        for worker_id in 0..config.workers {
            let (tx, rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            senders.push(tx);
            let context = WorkerContext {
                tracker: tracker.clone(),
                handler: handler.clone(),
                dead_letter: dead_letter.clone(),
                ack_tx: ack_tx.clone(),
                retry_limit: config.retry_limit,
                retry_delay: config.retry_delay(),
            };
            workers.push(tokio::spawn(run_worker(worker_id, rx, context)));
        }
        drop(ack_tx);

        let router = tokio::spawn(route_messages(inbox, senders, shutdown_rx));
        Self { router, workers }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Wait for the pool to wind down after the shutdown signal
    ///
    /// Returns true when every task finished inside the deadline. Tasks
    /// still running at the deadline are aborted and their in-flight
    /// messages left unacknowledged for the broker to redeliver.
    pub async fn drain(mut self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        if tokio::time::timeout_at(deadline, &mut self.router)
            .await
            .is_err()
        {
            self.router.abort();
        }

        let mut aborted = 0usize;
        for worker in &mut self.workers {
            match tokio::time::timeout_at(deadline, &mut *worker).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    error!(error = %join_error, "dispatch worker terminated abnormally");
                }
                Err(_) => {
                    worker.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            warn!(
                aborted,
                "drain deadline expired with handlers still in flight"
            );
        }
        aborted == 0
    }
}

/// Stable topic-to-worker assignment, the basis of per-topic FIFO
fn worker_for_topic(topic: &str, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

async fn route_messages(
    inbox: Arc<Inbox>,
    senders: Vec<mpsc::Sender<InboundMessage>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    debug!(workers = senders.len(), "dispatch router started");
    loop {
        let message = tokio::select! {
            _ = shutdown_rx.changed() => break,
            message = inbox.pop() => message,
        };

        let worker = worker_for_topic(&message.topic, senders.len());
        let handoff = tokio::select! {
            // Dropping the handoff on shutdown leaves the message
            // unacknowledged; the broker redelivers it next session
            _ = shutdown_rx.changed() => None,
            result = senders[worker].send(message) => Some(result),
        };
        match handoff {
            Some(Ok(())) => {}
            Some(Err(_)) => {
                debug!(worker, "worker channel closed, router stopping");
                break;
            }
            None => break,
        }
    }
    debug!("dispatch router stopped");
}

async fn run_worker(worker_id: usize, mut rx: mpsc::Receiver<InboundMessage>, context: WorkerContext) {
    debug!(worker_id, "dispatch worker started");
    while let Some(message) = rx.recv().await {
        let span = dispatch_span!(
            worker_id,
            topic = %message.topic,
            tag = %message.tag,
            redelivered = message.redelivered
        );
        if !process_message(message, &context).instrument(span).await {
            debug!(worker_id, "acknowledgement channel closed, worker exiting");
            break;
        }
    }
    debug!(worker_id, "dispatch worker stopped");
}

/// Drive one message to completion: handle, retry, dead-letter, settle
///
/// Returns false when the supervisor side of the ack channel is gone,
/// which tells the worker loop to stop.
async fn process_message(message: InboundMessage, context: &WorkerContext) -> bool {
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let failure = match invoke_handler(&context.handler, &message).await {
            Ok(HandlerOutcome::Ack) => {
                METRICS.record_message_handled(started.elapsed());
                return settle(&message, context).await;
            }
            Ok(HandlerOutcome::Nack) => "handler requested redelivery".to_string(),
            Err(error) => error.to_string(),
        };
        METRICS.record_handler_failure(started.elapsed());

        if attempt < context.retry_limit {
            attempt += 1;
            METRICS.record_handler_retry();
            debug!(
                topic = %message.topic,
                tag = %message.tag,
                attempt,
                reason = %failure,
                "handler attempt failed, retrying"
            );
            tokio::time::sleep(context.retry_delay).await;
            continue;
        }

        // Retries exhausted: hand the message to the dead-letter sink,
        // then acknowledge regardless so the broker stops redelivering
        warn!(
            topic = %message.topic,
            tag = %message.tag,
            attempts = attempt + 1,
            reason = %failure,
            "handler retries exhausted, dead-lettering message"
        );
        if let Err(sink_error) = context.dead_letter.deliver(&message, &failure).await {
            error!(
                topic = %message.topic,
                tag = %message.tag,
                error = %sink_error,
                "dead-letter sink failed, message lost to downstream"
            );
        }
        METRICS.record_message_dead_lettered();
        return settle(&message, context).await;
    }
}

/// Run one handler invocation in its own task so a panicking handler
/// surfaces as a failure instead of killing the worker
async fn invoke_handler(
    handler: &Arc<dyn MessageHandler>,
    message: &InboundMessage,
) -> Result<HandlerOutcome, HandlerError> {
    let handler = handler.clone();
    let message = message.clone();
    match tokio::spawn(async move { handler.handle(&message).await }).await {
        Ok(outcome) => outcome,
        Err(join_error) => Err(HandlerError::new(format!("handler panicked: {join_error}"))),
    }
}

/// Acknowledge the delivery (when its QoS requires one) and release the
/// tracker entry
///
/// Ack failures are not retried here: the entry stays pending and the
/// broker redelivers the message after the next reconnect.
async fn settle(message: &InboundMessage, context: &WorkerContext) -> bool {
    if !message.qos.requires_ack() {
        return true;
    }

    let (reply_tx, reply_rx) = oneshot::channel();
    let request = AckRequest {
        tag: message.tag,
        reply: reply_tx,
    };
    if context.ack_tx.send(request).await.is_err() {
        return false;
    }

    match reply_rx.await {
        Ok(Ok(())) => {
            context.tracker.confirm(&message.topic, message.tag);
            METRICS.record_ack_sent();
            true
        }
        Ok(Err(error)) => {
            METRICS.record_ack_failure();
            warn!(
                topic = %message.topic,
                tag = %message.tag,
                error = %error,
                "acknowledge failed, broker will redeliver"
            );
            true
        }
        // Supervisor dropped the reply mid-service, pipeline is closing
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::error::{DeadLetterError, TransportError};
    use crate::message::{DeliveryTag, QosLevel};
    use bytes::Bytes;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    fn msg(seq: u64, topic: &str, qos: QosLevel) -> InboundMessage {
        InboundMessage::new(
            DeliveryTag::new(1, seq),
            topic,
            Bytes::from_static(b"payload"),
            qos,
            false,
        )
    }

    struct ScriptedHandler {
        outcome: Result<HandlerOutcome, String>,
        invocations: AtomicU32,
    }

    impl ScriptedHandler {
        fn new(outcome: Result<HandlerOutcome, String>) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                invocations: AtomicU32::new(0),
            })
        }

        fn invocations(&self) -> u32 {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle(
            &self,
            _message: &InboundMessage,
        ) -> Result<HandlerOutcome, HandlerError> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            match &self.outcome {
                Ok(outcome) => Ok(*outcome),
                Err(reason) => Err(HandlerError::new(reason.clone())),
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: StdMutex<Vec<(String, String)>>,
    }

    impl RecordingSink {
        fn delivered(&self) -> Vec<(String, String)> {
            self.delivered.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl DeadLetterSink for RecordingSink {
        async fn deliver(
            &self,
            message: &InboundMessage,
            reason: &str,
        ) -> Result<(), DeadLetterError> {
            self.delivered
                .lock()
                .unwrap()
                .push((message.topic.to_string(), reason.to_string()));
            Ok(())
        }
    }

    /// Answers every ack request and reports how many it served
    fn spawn_ack_service(
        mut rx: mpsc::Receiver<AckRequest>,
        succeed: bool,
    ) -> JoinHandle<usize> {
        tokio::spawn(async move {
            let mut served = 0usize;
            while let Some(request) = rx.recv().await {
                served += 1;
                let result = if succeed {
                    Ok(())
                } else {
                    Err(TransportError::connection_lost("scripted failure"))
                };
                let _ = request.reply.send(result);
            }
            served
        })
    }

    fn context(
        handler: Arc<dyn MessageHandler>,
        sink: Arc<dyn DeadLetterSink>,
        ack_tx: mpsc::Sender<AckRequest>,
        retry_limit: u32,
    ) -> WorkerContext {
        WorkerContext {
            tracker: Arc::new(AckTracker::new()),
            handler,
            dead_letter: sink,
            ack_tx,
            retry_limit,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_worker_assignment_is_stable_and_bounded() {
        for workers in 1..8 {
            let first = worker_for_topic("sensors/temperature", workers);
            let second = worker_for_topic("sensors/temperature", workers);
            assert_eq!(first, second);
            assert!(first < workers);
        }
    }

    proptest! {
        #[test]
        fn prop_routing_is_stable_and_in_range(
            topic in "[a-zA-Z0-9/_-]{1,60}",
            workers in 1usize..32,
        ) {
            let assigned = worker_for_topic(&topic, workers);
            prop_assert_eq!(assigned, worker_for_topic(&topic, workers));
            prop_assert!(assigned < workers);
        }
    }

    #[tokio::test]
    async fn test_ack_outcome_confirms_and_acknowledges() {
        let handler = ScriptedHandler::new(Ok(HandlerOutcome::Ack));
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let service = spawn_ack_service(ack_rx, true);

        let ctx = context(handler.clone(), sink.clone(), ack_tx, 3);
        let message = msg(0, "sensors/a", QosLevel::AtLeastOnce);
        ctx.tracker.track(&message);

        assert!(process_message(message, &ctx).await);
        assert_eq!(handler.invocations(), 1);
        assert_eq!(ctx.tracker.pending_count(), 0);
        assert!(sink.delivered().is_empty());

        drop(ctx);
        assert_eq!(service.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_nack_retries_then_dead_letters_then_acks() {
        let handler = ScriptedHandler::new(Ok(HandlerOutcome::Nack));
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let service = spawn_ack_service(ack_rx, true);

        let retry_limit = 2;
        let ctx = context(handler.clone(), sink.clone(), ack_tx, retry_limit);
        let message = msg(0, "sensors/a", QosLevel::AtLeastOnce);
        ctx.tracker.track(&message);

        assert!(process_message(message, &ctx).await);

        // retry_limit + 1 invocations, one dead-letter, one ack
        assert_eq!(handler.invocations(), retry_limit + 1);
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, "sensors/a");
        assert_eq!(ctx.tracker.pending_count(), 0);

        drop(ctx);
        assert_eq!(service.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_reason_reaches_sink() {
        let handler = ScriptedHandler::new(Err("schema mismatch".to_string()));
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let _service = spawn_ack_service(ack_rx, true);

        let ctx = context(handler, sink.clone(), ack_tx, 0);
        let message = msg(0, "sensors/a", QosLevel::AtLeastOnce);
        ctx.tracker.track(&message);

        assert!(process_message(message, &ctx).await);
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1.contains("schema mismatch"));
    }

    #[tokio::test]
    async fn test_qos0_never_requests_an_ack() {
        let handler = ScriptedHandler::new(Ok(HandlerOutcome::Ack));
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let service = spawn_ack_service(ack_rx, true);

        let ctx = context(handler, sink, ack_tx, 3);
        let message = msg(0, "sensors/a", QosLevel::AtMostOnce);

        assert!(process_message(message, &ctx).await);

        drop(ctx);
        assert_eq!(service.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ack_failure_leaves_entry_pending() {
        let handler = ScriptedHandler::new(Ok(HandlerOutcome::Ack));
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let _service = spawn_ack_service(ack_rx, false);

        let ctx = context(handler, sink, ack_tx, 0);
        let message = msg(0, "sensors/a", QosLevel::AtLeastOnce);
        ctx.tracker.track(&message);

        // Failed ack is surfaced as "keep going"; redelivery settles it
        assert!(process_message(message, &ctx).await);
        assert_eq!(ctx.tracker.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_ack_channel_stops_worker() {
        let handler = ScriptedHandler::new(Ok(HandlerOutcome::Ack));
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        drop(ack_rx);

        let ctx = context(handler, sink, ack_tx, 0);
        let message = msg(0, "sensors/a", QosLevel::AtLeastOnce);

        assert!(!process_message(message, &ctx).await);
    }

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(
            &self,
            _message: &InboundMessage,
        ) -> Result<HandlerOutcome, HandlerError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_is_dead_lettered() {
        let sink = Arc::new(RecordingSink::default());
        let (ack_tx, ack_rx) = mpsc::channel(4);
        let _service = spawn_ack_service(ack_rx, true);

        let ctx = context(Arc::new(PanickingHandler), sink.clone(), ack_tx, 1);
        let message = msg(0, "sensors/a", QosLevel::AtLeastOnce);
        ctx.tracker.track(&message);

        assert!(process_message(message, &ctx).await);
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1.contains("panicked"));
        assert_eq!(ctx.tracker.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fifo_per_topic_through_the_pool() {
        struct OrderRecorder {
            seen: StdMutex<Vec<(String, u64)>>,
        }

        #[async_trait::async_trait]
        impl MessageHandler for OrderRecorder {
            async fn handle(
                &self,
                message: &InboundMessage,
            ) -> Result<HandlerOutcome, HandlerError> {
                self.seen
                    .lock()
                    .unwrap()
                    .push((message.topic.to_string(), message.tag.seq));
                Ok(HandlerOutcome::Ack)
            }
        }

        let recorder = Arc::new(OrderRecorder {
            seen: StdMutex::new(Vec::new()),
        });
        let inbox = Arc::new(Inbox::new(32, OverflowPolicy::Block));
        let tracker = Arc::new(AckTracker::new());
        let (ack_tx, ack_rx) = mpsc::channel(8);
        let _service = spawn_ack_service(ack_rx, true);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let config = DispatchSection {
            workers: 4,
            retry_limit: 0,
            retry_delay_ms: 1,
            drain_timeout_ms: 1000,
        };
        let dispatcher = Dispatcher::spawn(
            &config,
            inbox.clone(),
            tracker,
            recorder.clone(),
            Arc::new(LogDeadLetter),
            ack_tx,
            shutdown_rx,
        );
        assert_eq!(dispatcher.worker_count(), 4);

        let topics = ["plant/line-a", "plant/line-b", "plant/line-c"];
        let mut seq = 0u64;
        for _round in 0..4 {
            for topic in topics {
                inbox.push(msg(seq, topic, QosLevel::AtLeastOnce)).await;
                seq += 1;
            }
        }

        // Wait for all twelve messages to be handled
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if recorder.seen.lock().unwrap().len() == 12 {
                break;
            }
            assert!(Instant::now() < deadline, "dispatch did not finish in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        assert!(dispatcher.drain(Duration::from_secs(1)).await);

        let seen = recorder.seen.lock().unwrap().clone();
        for topic in topics {
            let seqs: Vec<u64> = seen
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(seqs.len(), 4);
            assert!(seqs.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }
}
