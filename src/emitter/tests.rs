use super::*;
use crate::error::BoxError;
use crate::transport::MemoryBroker;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

fn emitter(broker: &MemoryBroker) -> Emitter {
    Emitter::new(EmitterConfig::for_test(), Arc::new(broker.clone()))
}

fn noop() -> impl Listener + 'static {
    |_event: String, _body: Value| async move { Ok::<Value, BoxError>(Value::Null) }
}

#[tokio::test]
async fn test_local_emit_collects_listener_values() {
    let emitter = emitter(&MemoryBroker::new());
    emitter
        .on("greet", |event: String, body: Value| async move {
            Ok::<Value, BoxError>(json!(format!("{} {}", event, body)))
        })
        .unwrap();
    emitter.on("greet", noop()).unwrap();

    let values = emitter.emit("greet", "bob").await.unwrap();

    assert_eq!(values, vec![json!("greet \"bob\""), Value::Null]);
}

#[tokio::test]
async fn test_local_once_fires_once_and_off_removes() {
    let emitter = emitter(&MemoryBroker::new());
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    emitter
        .once("ping", move |_e: String, _b: Value| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<Value, BoxError>(Value::Null)
            }
        })
        .unwrap();
    let id = emitter.on("ping", noop()).unwrap();

    emitter.emit("ping", ()).await.unwrap();
    emitter.emit("ping", ()).await.unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(emitter.off("ping", id).unwrap());
    assert!(emitter.emit("ping", ()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_local_forms_reject_multi_segment_names() {
    let emitter = emitter(&MemoryBroker::new());
    let mut events = emitter.events();

    let result = emitter.on("log.pub", noop());

    match result {
        Err(EmitterError::Usage(message)) => assert!(message.contains("on_one()")),
        other => panic!("expected usage error, got {:?}", other.map(|_| ())),
    }
    match events.recv().await.unwrap() {
        EmitterEvent::Error(e) => assert!(matches!(*e, EmitterError::Usage(_))),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(
        emitter.emit("a.b", ()).await,
        Err(EmitterError::Usage(_))
    ));
}

#[tokio::test]
async fn test_distributed_listener_requires_connection() {
    let broker = MemoryBroker::new();
    let emitter = emitter(&broker);

    let result = emitter.on_one("log.pub", noop()).await;

    assert!(matches!(result, Err(EmitterError::NotConnected(_))));
    assert!(emitter.bound_queues().await.is_empty());
    assert_eq!(broker.queue_count(), 0);
}

#[tokio::test]
async fn test_invalid_distributed_calls_are_usage_errors() {
    let broker = MemoryBroker::new();
    let emitter = emitter(&broker);
    emitter.connect().await.unwrap();

    assert!(matches!(
        emitter.on_one("log.*", noop()).await,
        Err(EmitterError::Usage(_))
    ));
    assert!(matches!(
        emitter.many_all("tick", 0, noop()).await,
        Err(EmitterError::Usage(_))
    ));
    assert!(matches!(
        emitter.on_all("a..b", noop()).await,
        Err(EmitterError::Usage(_))
    ));
    assert!(matches!(
        emitter.emit_all("log.**", json!(1)).await,
        Err(EmitterError::Usage(_))
    ));
    assert_eq!(emitter.pending_outbound(), 0);
}

#[tokio::test]
async fn test_lifecycle_events_reach_local_listeners() {
    let broker = MemoryBroker::new();
    let emitter = emitter(&broker);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    for name in ["connected", "disconnected"] {
        let tx = tx.clone();
        emitter
            .on(name, move |event: String, body: Value| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((event, body));
                    Ok::<Value, BoxError>(Value::Null)
                }
            })
            .unwrap();
    }

    emitter.connect().await.unwrap();
    assert_eq!(rx.recv().await.unwrap(), ("connected".to_string(), Value::Null));

    emitter.disconnect("done").await;
    assert_eq!(
        rx.recv().await.unwrap(),
        ("disconnected".to_string(), json!("done"))
    );
    assert_eq!(emitter.state(), ConnectionState::Disconnected);
}
