use super::*;
use crate::transport::MemoryBroker;
use std::time::Duration;

async fn connected(broker: &MemoryBroker, slot: &ConnectionSlot, generation: u64) -> LiveConnection {
    let connection = broker.connect_raw().await.unwrap();
    connection.declare_queue("jobs", false).await.unwrap();
    let live = LiveConnection {
        connection,
        generation,
    };
    slot.set_connected(live.clone());
    live
}

fn tracker(slot: &Arc<ConnectionSlot>) -> Arc<OutboundTracker> {
    Arc::new(OutboundTracker::new(Arc::clone(slot), 2, Some(100)))
}

#[tokio::test]
async fn test_send_resolves_on_ack() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connected(&broker, &slot, 1).await;
    let outbound = tracker(&slot);

    outbound
        .send(Target::queue("jobs"), b"{}".to_vec(), MessageProperties::json())
        .await
        .unwrap();

    assert!(outbound.is_empty());
    assert_eq!(broker.published(), 1);
}

#[tokio::test]
async fn test_send_while_disconnected_waits_for_replay() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    let outbound = tracker(&slot);

    let done = outbound
        .enqueue(Target::queue("jobs"), b"1".to_vec(), MessageProperties::json())
        .unwrap();
    assert_eq!(outbound.len(), 1);
    assert_eq!(broker.published(), 0);

    let connection = broker.connect_raw().await.unwrap();
    connection.declare_queue("jobs", false).await.unwrap();
    let live = LiveConnection {
        connection,
        generation: 1,
    };
    outbound.replay_all(&live).await;

    assert!(done.await.unwrap().is_ok());
    assert!(outbound.is_empty());
    assert_eq!(broker.published(), 1);
}

#[tokio::test]
async fn test_flush_sends_entries_registered_while_connecting() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    let outbound = tracker(&slot);

    slot.set_connecting();
    let done = outbound
        .enqueue(Target::queue("jobs"), b"1".to_vec(), MessageProperties::json())
        .unwrap();
    connected(&broker, &slot, 1).await;
    outbound.flush();
    // A second flush on the same generation must not publish again.
    outbound.flush();

    assert!(done.await.unwrap().is_ok());
    assert_eq!(broker.published(), 1);
}

#[tokio::test]
async fn test_nack_is_retried_then_acked() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connected(&broker, &slot, 1).await;
    let outbound = tracker(&slot);
    broker.nack_next_publishes(1);

    outbound
        .send(Target::queue("jobs"), b"x".to_vec(), MessageProperties::json())
        .await
        .unwrap();

    assert!(outbound.is_empty());
}

#[tokio::test]
async fn test_repeated_nacks_give_up() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connected(&broker, &slot, 1).await;
    let outbound = tracker(&slot);
    broker.nack_next_publishes(10);

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        outbound.send(Target::queue("jobs"), b"x".to_vec(), MessageProperties::json()),
    )
    .await
    .unwrap();

    match result {
        Err(EmitterError::Nacked { target, attempts }) => {
            assert_eq!(target, "jobs");
            assert_eq!(attempts, 3);
        }
        other => panic!("expected Nacked, got {:?}", other),
    }
    assert!(outbound.is_empty());
}

#[tokio::test]
async fn test_pending_bound_applies_backpressure() {
    let slot = Arc::new(ConnectionSlot::new());
    let outbound = Arc::new(OutboundTracker::new(Arc::clone(&slot), 2, Some(1)));

    let _first = outbound
        .enqueue(Target::queue("jobs"), b"1".to_vec(), MessageProperties::json())
        .unwrap();
    let second = outbound.enqueue(Target::queue("jobs"), b"2".to_vec(), MessageProperties::json());

    assert!(matches!(second, Err(EmitterError::Backpressure { pending: 1 })));
}

#[tokio::test]
async fn test_interrupted_publish_is_replayed_on_next_generation() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connected(&broker, &slot, 1).await;
    let outbound = tracker(&slot);
    broker.hold_confirms(true);

    let done = outbound
        .enqueue(Target::queue("jobs"), b"x".to_vec(), MessageProperties::json())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.sever_connections();
    slot.set_disconnected();
    broker.hold_confirms(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(outbound.len(), 1);

    let connection = broker.connect_raw().await.unwrap();
    let live = LiveConnection {
        connection,
        generation: 2,
    };
    outbound.replay_all(&live).await;

    assert!(done.await.unwrap().is_ok());
    assert!(outbound.is_empty());
}

#[test]
fn test_target_display() {
    assert_eq!(Target::queue("log.pub").to_string(), "log.pub");
    assert_eq!(
        Target::exchange("eventemitter", "log.send").to_string(),
        "eventemitter/log.send"
    );
}
