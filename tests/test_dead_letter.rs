//! Retry and dead-letter behavior: bounded handler retries, sink
//! hand-off after exhaustion, and acknowledgement of poison messages.

mod test_helpers;

use inletmq::consumer::Consumer;
use inletmq::message::QosLevel;
use inletmq::supervisor::ConnectionState;
use inletmq::testing::mocks::{
    wait_until, MockTransport, MockTransportHandle, RecordingDeadLetter, RecordingHandler,
};
use std::sync::Arc;
use std::time::Duration;

fn start_with_handler(
    handler: Arc<RecordingHandler>,
) -> (Consumer, MockTransportHandle, Arc<RecordingDeadLetter>) {
    let (transport, handle) = MockTransport::new();
    let sink = RecordingDeadLetter::new();
    let consumer = Consumer::start_with_transport(
        test_helpers::test_config(),
        transport,
        handler,
        sink.clone(),
    )
    .expect("pipeline should start");
    (consumer, handle, sink)
}

async fn wait_connected(consumer: &Consumer) {
    assert!(
        wait_until(Duration::from_secs(2), || async {
            consumer.state() == ConnectionState::Connected
        })
        .await
    );
}

#[tokio::test]
async fn test_exhausted_retries_reach_dead_letter_sink() {
    let handler = RecordingHandler::nacking();
    let (consumer, handle, sink) = start_with_handler(handler.clone());
    wait_connected(&consumer).await;

    handle.deliver("sensors/poison", "unparseable", QosLevel::AtLeastOnce);

    assert!(
        wait_until(Duration::from_secs(2), || async {
            sink.received_count().await == 1
        })
        .await,
        "exhausted message should reach the sink"
    );

    // retry_limit = 2 means three invocations in total
    assert_eq!(handler.seen_count().await, 3);

    let received = sink.received().await;
    assert_eq!(received[0].0.payload_lossy(), "unparseable");
    assert_eq!(received[0].1, "handler requested redelivery");

    // Dead-lettered messages are still settled with the broker
    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.acked().await.len() == 1
        })
        .await,
        "poison message must be acknowledged after dead-lettering"
    );
    assert!(
        wait_until(Duration::from_secs(2), || async {
            consumer.pending_acks() == 0
        })
        .await
    );

    consumer.shutdown().await;
}

#[tokio::test]
async fn test_transient_failure_recovers_without_dead_letter() {
    let handler = RecordingHandler::failing_first(1);
    let (consumer, handle, sink) = start_with_handler(handler.clone());
    wait_connected(&consumer).await;

    handle.deliver("sensors/flaky", "eventually-fine", QosLevel::AtLeastOnce);

    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.acked().await.len() == 1
        })
        .await,
        "second attempt should succeed and acknowledge"
    );
    assert_eq!(handler.seen_count().await, 2);
    assert_eq!(sink.received_count().await, 0);

    consumer.shutdown().await;
}

#[tokio::test]
async fn test_handler_error_message_reaches_sink() {
    let handler = RecordingHandler::failing_first(u32::MAX);
    let (consumer, handle, sink) = start_with_handler(handler);
    wait_connected(&consumer).await;

    handle.deliver("sensors/broken", "payload", QosLevel::AtLeastOnce);

    assert!(
        wait_until(Duration::from_secs(2), || async {
            sink.received_count().await == 1
        })
        .await
    );
    let received = sink.received().await;
    assert_eq!(received[0].1, "scripted handler failure");

    consumer.shutdown().await;
}

#[tokio::test]
async fn test_each_message_retries_independently() {
    let mut config = test_helpers::test_config();
    config.dispatch.retry_limit = 1;

    let handler = RecordingHandler::nacking();
    let (transport, handle) = MockTransport::new();
    let sink = RecordingDeadLetter::new();
    let consumer =
        Consumer::start_with_transport(config, transport, handler.clone(), sink.clone())
            .expect("pipeline should start");
    wait_connected(&consumer).await;

    for i in 0..3 {
        handle.deliver("sensors/poison", format!("bad-{i}"), QosLevel::AtLeastOnce);
    }

    assert!(
        wait_until(Duration::from_secs(2), || async {
            sink.received_count().await == 3
        })
        .await,
        "every message should be dead-lettered on its own"
    );
    // Two invocations each under retry_limit = 1
    assert_eq!(handler.seen_count().await, 6);
    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.acked().await.len() == 3
        })
        .await
    );

    consumer.shutdown().await;
}
