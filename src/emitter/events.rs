//! Observable emitter events.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::error::EmitterError;
use crate::event::EventName;
use crate::registry::ListenerRegistry;

/// Capacity of the observer broadcast channel. Slow observers lag and skip.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle and error notifications.
#[derive(Debug, Clone)]
pub enum EmitterEvent {
    Connected,
    Disconnected(String),
    Error(Arc<EmitterError>),
}

impl EmitterEvent {
    /// Local event name these notifications are emitted under.
    pub fn name(&self) -> &'static str {
        match self {
            EmitterEvent::Connected => "connected",
            EmitterEvent::Disconnected(_) => "disconnected",
            EmitterEvent::Error(_) => "error",
        }
    }

    fn body(&self) -> Value {
        match self {
            EmitterEvent::Connected => Value::Null,
            EmitterEvent::Disconnected(reason) => Value::String(reason.clone()),
            EmitterEvent::Error(e) => Value::String(e.to_string()),
        }
    }
}

/// Fans notifications out to broadcast subscribers and local listeners.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<EmitterEvent>,
    local: Arc<ListenerRegistry>,
}

impl Notifier {
    pub fn new(local: Arc<ListenerRegistry>) -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx, local }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EmitterEvent> {
        self.tx.subscribe()
    }

    pub fn connected(&self) {
        info!("Emitter connected");
        self.publish(EmitterEvent::Connected);
    }

    pub fn disconnected(&self, reason: &str) {
        info!(reason = %reason, "Emitter disconnected");
        self.publish(EmitterEvent::Disconnected(reason.to_string()));
    }

    pub fn error(&self, err: EmitterError) {
        match &err {
            EmitterError::Transport(_) | EmitterError::RequestTimeout { .. } => {
                warn!(error = %err, "Emitter error")
            }
            _ => error!(error = %err, "Emitter error"),
        }
        self.publish(EmitterEvent::Error(Arc::new(err)));
    }

    fn publish(&self, event: EmitterEvent) {
        let name = EventName::from(event.name());
        if self.local.has_listeners(&name) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let local = Arc::clone(&self.local);
                let body = event.body();
                runtime.spawn(async move {
                    let outcome = local.emit(&name, &name.to_string(), &body).await;
                    for result in outcome.results {
                        if let Err(e) = result {
                            warn!(event = %name, error = %e, "Local lifecycle listener failed");
                        }
                    }
                });
            }
        }
        // No receivers is fine.
        let _ = self.tx.send(event);
    }
}
