//! Dispatch router.
//!
//! Consumes every bound queue. Each queue gets its own handler carrying the
//! `EventId` it was bound for, and a delivery only reaches the listeners
//! registered under that id. Overlapping `ALL` patterns bind separate queues
//! that each receive a copy, so matching by pattern here would invoke the
//! same listener once per copy.
//!
//! Also owns listener registration for distributed events, since that is
//! where listener counts cross the 0/1 boundary that drives queue bindings.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, warn};

use crate::connection::ConnectionSlot;
use crate::emitter::Notifier;
use crate::error::{EmitterError, Result};
use crate::event::{EventId, EventMode, EventName};
use crate::outbound::{OutboundTracker, Target};
use crate::queues::QueueTracker;
use crate::registry::{Listener, ListenerId, ListenerRegistry, ListenerResult};
use crate::transport::{Delivery, DeliveryHandler, MessageProperties};

/// Routes inbound deliveries to local listeners.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ListenerRegistry>,
    queues: Arc<QueueTracker>,
    outbound: Arc<OutboundTracker>,
    slot: Arc<ConnectionSlot>,
    notifier: Notifier,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ListenerRegistry>,
        queues: Arc<QueueTracker>,
        outbound: Arc<OutboundTracker>,
        slot: Arc<ConnectionSlot>,
        notifier: Notifier,
    ) -> Self {
        Self {
            registry,
            queues,
            outbound,
            slot,
            notifier,
        }
    }

    /// Delivery handler for the queue bound to `id`.
    pub fn handler_for(&self, id: &EventId) -> Arc<dyn DeliveryHandler> {
        Arc::new(BindingHandler {
            dispatcher: self.clone(),
            id: id.clone(),
        })
    }

    /// Register a listener for `id`, binding its queue on the first one.
    ///
    /// `times` bounds the number of deliveries; `None` is unbounded.
    pub async fn subscribe(
        &self,
        id: &EventId,
        times: Option<usize>,
        listener: Arc<dyn Listener>,
    ) -> Result<ListenerId> {
        let mut queues = self.queues.lock().await;
        if !self.slot.is_connected() {
            return Err(EmitterError::NotConnected(format!(
                "cannot listen on {} while {}",
                id,
                self.slot.state()
            )));
        }

        let key = id.registry_key();
        let listener_id = match times {
            Some(times) => self.registry.many(key.clone(), times, listener),
            None => self.registry.on(key.clone(), listener),
        };

        if let Err(e) = queues.ensure(id, self.handler_for(id)).await {
            self.registry.off(&key, listener_id);
            return Err(e);
        }
        debug!(event = %id, listener = ?listener_id, "Listener registered");
        Ok(listener_id)
    }

    /// Remove a listener, releasing the queue when it was the last one.
    pub async fn unsubscribe(&self, id: &EventId, listener_id: ListenerId) -> Result<bool> {
        let mut queues = self.queues.lock().await;
        if !self.slot.is_connected() {
            return Err(EmitterError::NotConnected(format!(
                "cannot remove listener on {} while {}",
                id,
                self.slot.state()
            )));
        }

        let key = id.registry_key();
        if !self.registry.off(&key, listener_id) {
            return Ok(false);
        }
        if self.registry.listener_count(&key) == 0 {
            queues.release(id).await?;
        }
        Ok(true)
    }

    async fn dispatch(self, id: EventId, mut delivery: Delivery) {
        let event = delivery.routing_key.clone();
        debug!(event = %event, binding = %id, "Dispatching delivery");

        let body: Value = match serde_json::from_slice(&delivery.payload) {
            Ok(body) => body,
            Err(e) => {
                self.notifier.error(EmitterError::ProtocolViolation(format!(
                    "message on '{}' is not valid JSON: {}",
                    event, e
                )));
                settle(&mut delivery, &event).await;
                return;
            }
        };
        let key = id.registry_key();

        let exhausted = match id.mode {
            EventMode::All => {
                let outcome = self.registry.emit_exact(&key, &event, &body).await;
                self.report_failures(&event, &outcome.results);
                settle(&mut delivery, &event).await;
                outcome.exhausted
            }
            EventMode::One => {
                let (reply_to, correlation_id) = match (
                    delivery.properties.reply_to.clone(),
                    delivery.properties.correlation_id.clone(),
                ) {
                    (Some(reply_to), Some(correlation_id)) => (reply_to, correlation_id),
                    _ => {
                        self.notifier.error(EmitterError::ProtocolViolation(format!(
                            "request on '{}' is missing reply_to or correlation_id",
                            event
                        )));
                        settle(&mut delivery, &event).await;
                        return;
                    }
                };

                let outcome = self.registry.emit_exact(&key, &event, &body).await;
                self.report_failures(&event, &outcome.results);
                let reply = outcome
                    .results
                    .into_iter()
                    .find_map(|result| result.ok())
                    .unwrap_or(Value::Null);
                self.reply(&event, reply_to, correlation_id, &reply).await;
                settle(&mut delivery, &event).await;
                outcome.exhausted
            }
        };

        self.release_exhausted(exhausted).await;
    }

    async fn reply(&self, event: &str, reply_to: String, correlation_id: String, reply: &Value) {
        let payload = match serde_json::to_vec(reply) {
            Ok(payload) => payload,
            Err(e) => {
                self.notifier.error(e.into());
                return;
            }
        };
        let properties = MessageProperties::json().with_correlation_id(correlation_id);
        if let Err(e) = self
            .outbound
            .send(Target::queue(reply_to), payload, properties)
            .await
        {
            warn!(event = %event, error = %e, "Failed to send reply");
            self.notifier.error(e);
        }
    }

    fn report_failures(&self, event: &str, results: &[ListenerResult]) {
        for result in results {
            if let Err(e) = result {
                self.notifier.error(EmitterError::Listener {
                    event: event.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Release queues whose last bounded listener was used up.
    async fn release_exhausted(&self, exhausted: Vec<EventName>) {
        for key in exhausted {
            let Some(id) = EventId::from_registry_key(&key) else {
                continue;
            };
            let mut queues = self.queues.lock().await;
            if self.registry.listener_count(&key) > 0 {
                continue;
            }
            debug!(event = %id, "Bounded listener exhausted, releasing queue");
            if let Err(e) = queues.release(&id).await {
                self.notifier.error(e);
            }
        }
    }
}

async fn settle(delivery: &mut Delivery, event: &str) {
    if let Err(e) = delivery.ack().await {
        warn!(event = %event, error = %e, "Failed to ack delivery");
    }
}

struct BindingHandler {
    dispatcher: Dispatcher,
    id: EventId,
}

impl DeliveryHandler for BindingHandler {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        Box::pin(self.dispatcher.clone().dispatch(self.id.clone(), delivery))
    }
}
