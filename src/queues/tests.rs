use super::*;
use crate::connection::LiveConnection;
use crate::transport::{Delivery, MemoryBroker, MessageProperties};
use futures::future::BoxFuture;
use std::time::Duration;
use tokio::sync::mpsc;

struct Forward(mpsc::UnboundedSender<String>);

impl DeliveryHandler for Forward {
    fn handle(&self, mut delivery: Delivery) -> BoxFuture<'static, ()> {
        let tx = self.0.clone();
        Box::pin(async move {
            let _ = delivery.ack().await;
            let _ = tx.send(delivery.routing_key.clone());
        })
    }
}

fn forward() -> (Arc<dyn DeliveryHandler>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Forward(tx)), rx)
}

async fn connect(broker: &MemoryBroker, slot: &ConnectionSlot, generation: u64) -> Arc<dyn Connection> {
    let connection = broker.connect_raw().await.unwrap();
    connection.declare_exchange("events").await.unwrap();
    slot.set_connected(LiveConnection {
        connection: Arc::clone(&connection),
        generation,
    });
    connection
}

#[tokio::test]
async fn test_ensure_one_declares_named_queue() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connect(&broker, &slot, 1).await;
    let tracker = QueueTracker::new("events", Arc::clone(&slot));
    let (handler, _rx) = forward();

    let id = EventId::one("log.pub");
    let mut guard = tracker.lock().await;
    assert!(guard.ensure(&id, Arc::clone(&handler)).await.unwrap());
    assert!(!guard.ensure(&id, handler).await.unwrap());
    drop(guard);

    assert!(broker.has_queue("log.pub"));
    assert_eq!(broker.consumer_count("log.pub"), 1);
    assert_eq!(tracker.bindings().await.len(), 1);
}

#[tokio::test]
async fn test_ensure_all_binds_exclusive_queue_with_topic_pattern() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    let connection = connect(&broker, &slot, 1).await;
    let tracker = QueueTracker::new("events", Arc::clone(&slot));
    let (handler, mut rx) = forward();

    let id = EventId::all("log.**");
    tracker.lock().await.ensure(&id, handler).await.unwrap();
    let binding = tracker.bindings().await.remove(0);
    assert!(binding.queue.starts_with("amq.gen-"));
    assert_eq!(broker.binding_count(), 1);

    connection
        .publish("events", "log.a.b", b"{}", &MessageProperties::json())
        .await
        .unwrap();
    let key = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "log.a.b");
}

#[tokio::test]
async fn test_ensure_while_disconnected_fails() {
    let slot = Arc::new(ConnectionSlot::new());
    let tracker = QueueTracker::new("events", slot);
    let (handler, _rx) = forward();

    let result = tracker.lock().await.ensure(&EventId::one("x"), handler).await;

    assert!(matches!(result, Err(EmitterError::NotConnected(_))));
    assert!(tracker.bindings().await.is_empty());
}

#[tokio::test]
async fn test_release_deletes_queue() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connect(&broker, &slot, 1).await;
    let tracker = QueueTracker::new("events", Arc::clone(&slot));
    let (handler, _rx) = forward();
    let id = EventId::all("log.send");

    let mut guard = tracker.lock().await;
    guard.ensure(&id, handler).await.unwrap();
    assert!(guard.release(&id).await.unwrap());
    assert!(!guard.release(&id).await.unwrap());
    assert!(!guard.is_bound(&id));
    drop(guard);

    assert_eq!(broker.binding_count(), 0);
    assert_eq!(broker.queue_count(), 0);
}

#[tokio::test]
async fn test_recreate_all_rebinds_on_new_connection() {
    let broker = MemoryBroker::new();
    let slot = Arc::new(ConnectionSlot::new());
    connect(&broker, &slot, 1).await;
    let tracker = QueueTracker::new("events", Arc::clone(&slot));
    let (handler, mut rx) = forward();

    {
        let mut guard = tracker.lock().await;
        guard.ensure(&EventId::all("tick"), Arc::clone(&handler)).await.unwrap();
        guard.ensure(&EventId::one("work"), Arc::clone(&handler)).await.unwrap();
    }
    let before: Vec<String> = tracker.bindings().await.into_iter().map(|b| b.queue).collect();

    broker.sever_connections();
    slot.set_disconnected();
    assert_eq!(broker.binding_count(), 0);

    let connection = connect(&broker, &slot, 2).await;
    tracker
        .recreate_all(&connection, |_| Arc::clone(&handler))
        .await
        .unwrap();

    let after = tracker.bindings().await;
    assert_eq!(after.len(), 2);
    let tick = after.iter().find(|b| b.id == EventId::all("tick")).unwrap();
    assert!(!before.contains(&tick.queue));
    assert_eq!(broker.binding_count(), 1);
    assert_eq!(broker.consumer_count("work"), 1);

    connection
        .publish("events", "tick", b"{}", &MessageProperties::json())
        .await
        .unwrap();
    let key = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key, "tick");
}
