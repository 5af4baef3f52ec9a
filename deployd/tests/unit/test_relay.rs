//! Telemetry relay tests

use std::time::Duration;

use deployd::models::new_task_id;
use deployd::telemetry::{RelayEvent, TelemetryRelay};

#[tokio::test]
async fn test_stalled_observer_drops_without_slowing_peers() {
    let relay = TelemetryRelay::new(100);
    let id = new_task_id();

    let mut stalled = relay.subscribe(id);
    let mut reader = relay.subscribe(id);

    let reading = tokio::spawn(async move {
        let mut received = Vec::new();
        loop {
            match reader.recv().await {
                RelayEvent::Chunk(chunk) => received.push(chunk),
                RelayEvent::End => break,
            }
        }
        (received, reader.dropped())
    });

    for i in 0..10_000 {
        relay.broadcast(id, &format!("line {}\n", i));
        // Let the reading observer keep up
        if i % 50 == 0 {
            tokio::task::yield_now().await;
        }
    }
    relay.close(id);

    let mut delivered = 0;
    while let RelayEvent::Chunk(chunk) = stalled.recv().await {
        if delivered == 0 {
            assert_eq!(chunk, "line 0\n");
        }
        delivered += 1;
    }
    assert_eq!(delivered, 100);
    assert_eq!(stalled.dropped(), 9_900);

    let (received, dropped) = tokio::time::timeout(Duration::from_secs(10), reading)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.len() as u64 + dropped, 10_000);
    // Whatever the reader got is in production order
    let numbers: Vec<usize> = received
        .iter()
        .map(|l| l.trim_start_matches("line ").trim_end().parse().unwrap())
        .collect();
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(flavor = "current_thread")]
async fn test_reading_observer_receives_everything() {
    let relay = TelemetryRelay::new(100);
    let id = new_task_id();
    let mut stalled = relay.subscribe(id);
    let mut reader = relay.subscribe(id);

    // Drain the reader between batches that fit its buffer
    let mut received = 0;
    for batch in 0..100 {
        for i in 0..100 {
            relay.broadcast(id, &format!("{}-{}", batch, i));
        }
        while let Some(RelayEvent::Chunk(_)) = reader.try_recv() {
            received += 1;
        }
    }
    relay.close(id);

    assert_eq!(received, 10_000);
    assert_eq!(reader.dropped(), 0);
    assert_eq!(reader.recv().await, RelayEvent::End);
    assert_eq!(stalled.dropped(), 9_900);
}

#[tokio::test]
async fn test_broadcast_without_observers_is_noop() {
    let relay = TelemetryRelay::default();
    let id = new_task_id();
    relay.broadcast(id, "nobody listens");
    assert_eq!(relay.observer_count(id), 0);
}

#[tokio::test]
async fn test_subscribe_after_close_ends_immediately() {
    let relay = TelemetryRelay::new(10);
    let id = new_task_id();
    relay.close(id);

    let mut late = relay.subscribe(id);
    assert_eq!(late.recv().await, RelayEvent::End);
    assert_eq!(relay.observer_count(id), 0);
}

#[tokio::test]
async fn test_unsubscribe_only_affects_one_observer() {
    let relay = TelemetryRelay::new(10);
    let id = new_task_id();
    let mut leaving = relay.subscribe(id);
    let mut staying = relay.subscribe(id);

    relay.broadcast(id, "before");
    relay.unsubscribe(id, &leaving);
    relay.broadcast(id, "after");

    assert_eq!(leaving.recv().await, RelayEvent::Chunk("before".into()));
    assert_eq!(leaving.recv().await, RelayEvent::End);

    assert_eq!(staying.recv().await, RelayEvent::Chunk("before".into()));
    assert_eq!(staying.recv().await, RelayEvent::Chunk("after".into()));
    assert_eq!(staying.try_recv(), None);
}

#[tokio::test]
async fn test_channels_are_isolated_per_trace() {
    let relay = TelemetryRelay::new(10);
    let a = new_task_id();
    let b = new_task_id();
    let mut sub_a = relay.subscribe(a);
    let mut sub_b = relay.subscribe(b);

    relay.broadcast(a, "for a");
    relay.close(a);

    assert_eq!(sub_a.recv().await, RelayEvent::Chunk("for a".into()));
    assert_eq!(sub_a.recv().await, RelayEvent::End);
    assert_eq!(sub_b.try_recv(), None);
}
