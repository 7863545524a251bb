//! Inbox overflow behavior under a slow handler: lossless intake with
//! the blocking policy, bounded shedding with drop-oldest.

mod test_helpers;

use inletmq::config::OverflowPolicy;
use inletmq::consumer::Consumer;
use inletmq::message::QosLevel;
use inletmq::supervisor::ConnectionState;
use inletmq::testing::mocks::{wait_until, MockTransport, RecordingDeadLetter};
use std::time::Duration;
use test_helpers::SlowHandler;

#[tokio::test]
async fn test_block_policy_delivers_every_message() {
    let mut config = test_helpers::test_config();
    config.inbox.capacity = 2;
    config.dispatch.workers = 1;

    let (transport, handle) = MockTransport::new();
    let handler = SlowHandler::new(Duration::from_millis(5));
    let consumer = Consumer::start_with_transport(
        config,
        transport,
        handler.clone(),
        RecordingDeadLetter::new(),
    )
    .expect("pipeline should start");

    assert!(
        wait_until(Duration::from_secs(2), || async {
            consumer.state() == ConnectionState::Connected
        })
        .await
    );

    for i in 0..10 {
        handle.deliver("sensors/flood", format!("m-{i}"), QosLevel::AtLeastOnce);
    }

    assert!(
        wait_until(Duration::from_secs(5), || async {
            handle.acked().await.len() == 10
        })
        .await,
        "blocking intake must not lose messages"
    );

    let seen = handler.seen().await;
    let expected: Vec<String> = (0..10).map(|i| format!("m-{i}")).collect();
    assert_eq!(seen, expected, "arrival order must survive the stall");

    let report = consumer.shutdown().await;
    assert!(report.clean);
    assert_eq!(report.unacked, 0);
}

#[tokio::test]
async fn test_drop_oldest_sheds_head_of_backlog() {
    let mut config = test_helpers::test_config();
    config.inbox.capacity = 4;
    config.inbox.overflow = OverflowPolicy::DropOldest;
    config.dispatch.workers = 1;

    let (transport, handle) = MockTransport::new();
    let handler = SlowHandler::new(Duration::from_millis(25));
    let consumer = Consumer::start_with_transport(
        config,
        transport,
        handler.clone(),
        RecordingDeadLetter::new(),
    )
    .expect("pipeline should start");

    assert!(
        wait_until(Duration::from_secs(2), || async {
            consumer.state() == ConnectionState::Connected
        })
        .await
    );

    for i in 0..16 {
        handle.deliver("sensors/flood", format!("{i:02}"), QosLevel::AtLeastOnce);
    }

    // The newest message is never displaced, so the flood ends with it
    assert!(
        wait_until(Duration::from_secs(5), || async {
            handler.seen().await.last().map(String::as_str) == Some("15")
        })
        .await,
        "the final message should survive the shedding"
    );

    let seen = handler.seen().await;
    assert!(
        seen.len() < 16,
        "a slow handler behind a 4-slot inbox must shed, saw {}",
        seen.len()
    );
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted, "survivors must keep arrival order");

    // Displaced messages are never acknowledged; handled ones all are
    assert!(
        wait_until(Duration::from_secs(2), || async {
            handle.acked().await.len() == handler.seen_count().await
        })
        .await
    );
    assert!(
        wait_until(Duration::from_secs(2), || async {
            consumer.pending_acks() == 0
        })
        .await,
        "displaced entries should be discarded, handled ones confirmed"
    );

    let report = consumer.shutdown().await;
    assert!(report.clean);
}
