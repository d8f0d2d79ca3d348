use hostpulse_bus::{Consumer, ConsumerStats, LinkState, StreamEnd, METRICS_QUEUE};
use hostpulse_devkit::{
    wait_until, within, MessageBuilder, MockBroker, RecordingSink, TestHarness,
};
use std::sync::Arc;
use std::time::Duration;

const SHORT: Duration = Duration::from_secs(2);

fn consumer(harness: &TestHarness) -> Consumer<MockBroker, RecordingSink> {
    Consumer::new(harness.broker.clone(), harness.sink.clone())
        .with_retry_delay(Duration::from_millis(20))
        .with_requeue_delay(Duration::from_millis(20))
}

#[tokio::test]
async fn test_valid_message_is_saved_then_acked() {
    let harness = TestHarness::new();
    harness.enqueue(&MessageBuilder::host_a());

    let consumer = Arc::new(consumer(&harness));
    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    harness.wait_for_acked(1).await.unwrap();
    assert_eq!(harness.sink.saved(), vec![MessageBuilder::host_a().build()]);
    assert_eq!(harness.broker.unacked(METRICS_QUEUE), 0);

    harness.cancel.cancel();
    within(SHORT, task).await.unwrap().unwrap();
    assert_eq!(harness.broker.live_sessions(), 0);
    assert_eq!(consumer.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_poison_messages_are_dropped_without_blocking() {
    let harness = TestHarness::new();
    harness.enqueue_raw(b"{not json");
    harness.enqueue(&MessageBuilder::new("host-b").cpu(180.0));
    harness.enqueue(&MessageBuilder::host_a());

    let consumer = Arc::new(consumer(&harness));
    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    harness.wait_for_saved(1).await.unwrap();
    let broker = harness.broker.clone();
    assert!(wait_until(SHORT, || broker.dead_letters(METRICS_QUEUE).len() == 2).await);
    assert_eq!(harness.sink.saved()[0].hostname(), "host-a");
    assert_eq!(harness.sink.attempts(), 1);
    assert_eq!(
        consumer.stats(),
        ConsumerStats {
            acked: 1,
            requeued: 0,
            dropped: 2
        }
    );

    harness.cancel.cancel();
    within(SHORT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_store_outage_requeues_then_saves_once() {
    let harness = TestHarness::new();
    harness.sink.set_outage(true);
    harness.enqueue(&MessageBuilder::host_a());

    let consumer = Arc::new(consumer(&harness));
    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    let sink = harness.sink.clone();
    assert!(wait_until(SHORT, || sink.attempts() >= 2).await);
    assert_eq!(harness.sink.saved_count(), 0);
    assert!(harness.broker.redelivered(METRICS_QUEUE) >= 1);
    assert_eq!(harness.broker.acked(METRICS_QUEUE), 0);

    harness.sink.set_outage(false);
    harness.wait_for_acked(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.sink.saved_count(), 1);
    assert_eq!(harness.broker.acked(METRICS_QUEUE), 1);
    assert_eq!(harness.broker.ready(METRICS_QUEUE), 0);
    assert!(harness.broker.dead_letters(METRICS_QUEUE).is_empty());
    assert!(consumer.stats().requeued >= 1);

    harness.cancel.cancel();
    within(SHORT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_rejected_message_is_dropped() {
    let harness = TestHarness::new();
    harness.sink.set_rejecting(true);
    harness.enqueue(&MessageBuilder::host_a());

    let consumer = Arc::new(consumer(&harness));
    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    let broker = harness.broker.clone();
    assert!(wait_until(SHORT, || broker.dead_letters(METRICS_QUEUE).len() == 1).await);
    assert_eq!(consumer.stats().dropped, 1);
    assert_eq!(harness.broker.redelivered(METRICS_QUEUE), 0);

    harness.cancel.cancel();
    within(SHORT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_resumes_after_broker_drops_connection() {
    let harness = TestHarness::new();
    let consumer = Arc::new(consumer(&harness));
    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    let broker = harness.broker.clone();
    assert!(wait_until(SHORT, || broker.opens() == 1).await);
    harness.broker.drop_connections("broker restart");
    assert!(wait_until(SHORT, || broker.opens() == 2).await);

    harness.enqueue(&MessageBuilder::host_a());
    harness.wait_for_saved(1).await.unwrap();
    assert_eq!(consumer.reconnects(), 1);

    harness.cancel.cancel();
    within(SHORT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_consume_returns_cancelled() {
    let harness = TestHarness::new();
    let consumer = consumer(&harness);
    harness.cancel.cancel();

    let end = within(SHORT, consumer.consume(&harness.cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(end, StreamEnd::Cancelled);
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_messages_are_processed_in_order() {
    let harness = TestHarness::new();
    for minute in 0..5 {
        harness.enqueue(&MessageBuilder::host_a().minutes_after_base(minute));
    }

    let consumer = Arc::new(consumer(&harness));
    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    harness.wait_for_saved(5).await.unwrap();
    let times: Vec<_> = harness.sink.saved().iter().map(|m| m.metric.time).collect();
    let mut sorted = times.clone();
    sorted.sort();
    assert_eq!(times, sorted);

    harness.cancel.cancel();
    within(SHORT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_cancel_during_backoff_stops_without_reconnecting() {
    let harness = TestHarness::new();
    harness.broker.fail_connections();
    let consumer = Arc::new(
        Consumer::new(harness.broker.clone(), harness.sink.clone())
            .with_retry_delay(Duration::from_secs(30)),
    );

    let task = {
        let consumer = consumer.clone();
        let cancel = harness.cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    let broker = harness.broker.clone();
    assert!(wait_until(SHORT, || broker.attempts() == 1).await);
    harness.cancel.cancel();

    within(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_eq!(harness.broker.attempts(), 1);
    assert_eq!(harness.broker.opens(), 0);
    assert_eq!(consumer.state(), LinkState::Disconnected);
}
