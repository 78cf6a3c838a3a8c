//! Heartbeats against a broker that enforces ack-wait.

use std::time::Duration;

use media_admission_pipeline::core::{ConsumerOptions, HeartbeatManager, MessageSource};
use media_admission_pipeline::infra::InMemoryBroker;

async fn broker_with_ack_wait(ack_wait: Duration) -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker
        .configure_consumer(&ConsumerOptions {
            ack_wait,
            max_ack_pending: 10,
            ..ConsumerOptions::default()
        })
        .await
        .unwrap();
    broker
}

#[tokio::test]
async fn test_unattended_delivery_is_redelivered_after_ack_wait() {
    let broker = broker_with_ack_wait(Duration::from_millis(150)).await;
    let id = broker.push("work");
    let held = broker.fetch(1, Duration::from_millis(20)).await.unwrap();
    assert_eq!(held.len(), 1);

    tokio::time::sleep(Duration::from_millis(400)).await;
    let again = broker.fetch(1, Duration::from_millis(20)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(broker.record(id).unwrap().expirations, 1);

    // The stale delivery may still be acked; the broker ignores it.
    for message in held {
        message.delivery.ack().await.unwrap();
    }
    for message in again {
        message.delivery.ack().await.unwrap();
    }
    let record = broker.record(id).unwrap();
    assert_eq!((record.acks, record.naks), (1, 0));
    assert_eq!(record.late_dispositions, 1);
}

#[tokio::test]
async fn test_heartbeat_keeps_delivery_alive_past_ack_wait() {
    let broker = broker_with_ack_wait(Duration::from_millis(150)).await;
    let heartbeats = HeartbeatManager::new(Duration::from_millis(30));
    let id = broker.push("work");

    let mut batch = broker.fetch(1, Duration::from_millis(20)).await.unwrap();
    let message = batch.remove(0);
    let handle = heartbeats.start_heartbeat("uploads/long.mp4", message.delivery);
    assert_eq!(heartbeats.active_heartbeat_count(), 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(broker
        .fetch(1, Duration::from_millis(20))
        .await
        .unwrap()
        .is_empty());

    heartbeats.stop_and_ack(handle).await.unwrap();
    let record = broker.record(id).unwrap();
    assert_eq!(record.deliveries, 1);
    assert_eq!(record.expirations, 0);
    assert_eq!((record.acks, record.naks), (1, 0));
    assert!(record.in_progress >= 5);
    assert_eq!(heartbeats.active_heartbeat_count(), 0);
    assert!(heartbeats.total_ticks() >= 5);
}

#[tokio::test]
async fn test_stopped_heartbeat_returns_delivery_for_requeue() {
    let broker = broker_with_ack_wait(Duration::from_secs(5)).await;
    let heartbeats = HeartbeatManager::new(Duration::from_millis(10));
    let id = broker.push("work");

    let mut batch = broker.fetch(1, Duration::from_millis(20)).await.unwrap();
    let handle = heartbeats.start_heartbeat("uploads/a.mp4", batch.remove(0).delivery);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let delivery = heartbeats.stop_heartbeat(handle).await;

    let ticks = broker.record(id).unwrap().in_progress;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.record(id).unwrap().in_progress, ticks, "no ticks after stop");
    assert_eq!(broker.record(id).unwrap().terminal_dispositions(), 0);

    delivery.nak().await.unwrap();
    assert_eq!(broker.ready_count(), 1);
}

#[tokio::test]
async fn test_refused_keep_alive_is_counted() {
    let broker = broker_with_ack_wait(Duration::from_millis(40)).await;
    let heartbeats = HeartbeatManager::new(Duration::from_millis(100));
    broker.push("work");

    let mut batch = broker.fetch(1, Duration::from_millis(20)).await.unwrap();
    let handle = heartbeats.start_heartbeat("uploads/late.mp4", batch.remove(0).delivery);
    // Expire the delivery before the first keep-alive lands.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(broker.fetch(1, Duration::from_millis(20)).await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(heartbeats.failed_ticks() >= 1);
    drop(heartbeats.stop_heartbeat(handle).await);
}
