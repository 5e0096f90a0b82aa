//! Distributed event emitter.
//!
//! `Emitter` is the application-facing API. It wires the trackers around one
//! transport and exposes three families of calls:
//!
//! - `ONE` (request/response): `on_one`, `many_one`, `once_one`, `off_one`,
//!   `emit_one`
//! - `ALL` (publish/subscribe): `on_all`, `many_all`, `once_all`, `off_all`,
//!   `emit_all`
//! - local, single-segment events that never leave the process: `on`,
//!   `once`, `many`, `off`, `emit`
//!
//! Failures are returned to the caller and also broadcast as
//! `EmitterEvent::Error`.
//!
//! ```ignore
//! let emitter = Emitter::amqp(EmitterConfig::load(None)?);
//! emitter.connect().await?;
//! emitter
//!     .on_one("log.pub", |_event: String, body: Value| async move {
//!         Ok::<_, BoxError>(json!(format!("ACK {}", body)))
//!     })
//!     .await?;
//! let reply = emitter.emit_one("log.pub", json!("hello")).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::EmitterConfig;
use crate::connection::{ConnectionSlot, ConnectionState, Lifecycle};
use crate::correlation::CorrelationTable;
use crate::dispatch::Dispatcher;
use crate::error::{EmitterError, Result};
use crate::event::{EventId, EventMode, EventName};
use crate::outbound::{OutboundTracker, Target};
use crate::queues::QueueTracker;
use crate::registry::{Listener, ListenerId, ListenerRegistry};
use crate::transport::{MessageProperties, Transport};

mod events;

pub use events::{EmitterEvent, Notifier};

/// Event emitter backed by a message broker.
pub struct Emitter {
    config: EmitterConfig,
    slot: Arc<ConnectionSlot>,
    local: Arc<ListenerRegistry>,
    outbound: Arc<OutboundTracker>,
    correlations: Arc<CorrelationTable>,
    queues: Arc<QueueTracker>,
    dispatcher: Dispatcher,
    lifecycle: Arc<Lifecycle>,
    notifier: Notifier,
}

impl Emitter {
    /// Create a disconnected emitter over `transport`.
    pub fn new(config: EmitterConfig, transport: Arc<dyn Transport>) -> Self {
        let slot = Arc::new(ConnectionSlot::new());
        let local = Arc::new(ListenerRegistry::new());
        let notifier = Notifier::new(Arc::clone(&local));

        let outbound = Arc::new(OutboundTracker::new(
            Arc::clone(&slot),
            config.max_nack_retries,
            config.max_pending_outbound,
        ));
        let correlations = Arc::new(CorrelationTable::new(
            Arc::clone(&outbound),
            notifier.clone(),
        ));
        let queues = Arc::new(QueueTracker::new(config.exchange.clone(), Arc::clone(&slot)));
        let dispatcher = Dispatcher::new(
            Arc::new(ListenerRegistry::new()),
            Arc::clone(&queues),
            Arc::clone(&outbound),
            Arc::clone(&slot),
            notifier.clone(),
        );
        let lifecycle = Arc::new(Lifecycle::new(
            config.clone(),
            transport,
            Arc::clone(&slot),
            Arc::clone(&queues),
            Arc::clone(&outbound),
            Arc::clone(&correlations),
            dispatcher.clone(),
            notifier.clone(),
        ));

        Self {
            config,
            slot,
            local,
            outbound,
            correlations,
            queues,
            dispatcher,
            lifecycle,
            notifier,
        }
    }

    /// Create an emitter that talks to RabbitMQ.
    #[cfg(feature = "amqp")]
    pub fn amqp(config: EmitterConfig) -> Self {
        Self::new(config, Arc::new(crate::transport::AmqpTransport::new()))
    }

    pub fn config(&self) -> &EmitterConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Connect, replacing any current connection. Retries until connected.
    pub async fn connect(&self) -> Result<()> {
        self.lifecycle.connect().await
    }

    pub async fn disconnect(&self, reason: &str) {
        self.lifecycle.disconnect(reason).await
    }

    pub fn state(&self) -> ConnectionState {
        self.slot.state()
    }

    /// Subscribe to `connected`, `disconnected` and `error` notifications.
    pub fn events(&self) -> broadcast::Receiver<EmitterEvent> {
        self.notifier.subscribe()
    }

    // ------------------------------------------------------------------
    // Distributed listeners
    // ------------------------------------------------------------------

    pub async fn on_one(
        &self,
        event: impl Into<EventName>,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        self.subscribe(EventMode::One, event.into(), None, Arc::new(listener))
            .await
    }

    pub async fn on_all(
        &self,
        event: impl Into<EventName>,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        self.subscribe(EventMode::All, event.into(), None, Arc::new(listener))
            .await
    }

    /// Listen for at most `times` requests, then deregister.
    pub async fn many_one(
        &self,
        event: impl Into<EventName>,
        times: usize,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        self.subscribe(EventMode::One, event.into(), Some(times), Arc::new(listener))
            .await
    }

    /// Listen for at most `times` publishes, then deregister.
    pub async fn many_all(
        &self,
        event: impl Into<EventName>,
        times: usize,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        self.subscribe(EventMode::All, event.into(), Some(times), Arc::new(listener))
            .await
    }

    pub async fn once_one(
        &self,
        event: impl Into<EventName>,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        self.many_one(event, 1, listener).await
    }

    pub async fn once_all(
        &self,
        event: impl Into<EventName>,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        self.many_all(event, 1, listener).await
    }

    pub async fn off_one(&self, event: impl Into<EventName>, id: ListenerId) -> Result<bool> {
        self.unsubscribe(EventMode::One, event.into(), id).await
    }

    pub async fn off_all(&self, event: impl Into<EventName>, id: ListenerId) -> Result<bool> {
        self.unsubscribe(EventMode::All, event.into(), id).await
    }

    async fn subscribe(
        &self,
        mode: EventMode,
        name: EventName,
        times: Option<usize>,
        listener: Arc<dyn Listener>,
    ) -> Result<ListenerId> {
        if !name.is_valid() {
            return Err(self.usage(format!("invalid event name '{}'", name)));
        }
        if mode == EventMode::One && name.has_wildcards() {
            return Err(self.usage(format!(
                "request listeners need a concrete event name, got '{}'",
                name
            )));
        }
        if times == Some(0) {
            return Err(self.usage(format!("listener on '{}' must accept at least one event", name)));
        }
        let id = EventId::new(mode, name);
        self.dispatcher
            .subscribe(&id, times, listener)
            .await
            .map_err(|e| self.report(e))
    }

    async fn unsubscribe(&self, mode: EventMode, name: EventName, id: ListenerId) -> Result<bool> {
        let event = EventId::new(mode, name);
        self.dispatcher
            .unsubscribe(&event, id)
            .await
            .map_err(|e| self.report(e))
    }

    // ------------------------------------------------------------------
    // Distributed emit
    // ------------------------------------------------------------------

    /// Send a request and wait for one listener's reply.
    ///
    /// Uses the configured request timeout.
    pub async fn emit_one(&self, event: impl Into<EventName>, body: impl Serialize) -> Result<Value> {
        self.emit_one_with_timeout(event, body, self.config.request_timeout())
            .await
    }

    pub async fn emit_one_with_timeout(
        &self,
        event: impl Into<EventName>,
        body: impl Serialize,
        timeout: Duration,
    ) -> Result<Value> {
        let name = self.concrete(event.into())?;
        let body = serde_json::to_value(body)?;
        self.correlations
            .request(&name, &body, timeout)
            .await
            .map_err(|e| self.report(e))
    }

    /// Publish to every subscriber and wait for the broker's confirmation.
    pub async fn emit_all(&self, event: impl Into<EventName>, body: impl Serialize) -> Result<()> {
        let name = self.concrete(event.into())?;
        let payload = serde_json::to_vec(&body)?;
        let target = Target::exchange(self.config.exchange.clone(), name.to_string());
        debug!(event = %name, "Publishing");
        self.outbound
            .send(target, payload, MessageProperties::json())
            .await
            .map_err(|e| self.report(e))
    }

    fn concrete(&self, name: EventName) -> Result<EventName> {
        if !name.is_valid() || name.has_wildcards() {
            return Err(self.usage(format!("cannot emit to pattern '{}'", name)));
        }
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Local events
    // ------------------------------------------------------------------

    /// Listen for a local, single-segment event.
    pub fn on(&self, event: &str, listener: impl Listener + 'static) -> Result<ListenerId> {
        let name = self.local_name(event, "on")?;
        Ok(self.local.on(name, Arc::new(listener)))
    }

    pub fn once(&self, event: &str, listener: impl Listener + 'static) -> Result<ListenerId> {
        self.many(event, 1, listener)
    }

    pub fn many(
        &self,
        event: &str,
        times: usize,
        listener: impl Listener + 'static,
    ) -> Result<ListenerId> {
        let name = self.local_name(event, "many")?;
        Ok(self.local.many(name, times, Arc::new(listener)))
    }

    pub fn off(&self, event: &str, id: ListenerId) -> Result<bool> {
        let name = self.local_name(event, "off")?;
        Ok(self.local.off(&name, id))
    }

    /// Invoke local listeners and collect their return values.
    ///
    /// Listener failures are reported as `error` events and left out.
    pub async fn emit(&self, event: &str, body: impl Serialize) -> Result<Vec<Value>> {
        let name = self.local_name(event, "emit")?;
        let body = serde_json::to_value(body)?;
        let outcome = self.local.emit(&name, event, &body).await;

        let mut values = Vec::with_capacity(outcome.results.len());
        for result in outcome.results {
            match result {
                Ok(value) => values.push(value),
                Err(e) => self.notifier.error(EmitterError::Listener {
                    event: event.to_string(),
                    message: e.to_string(),
                }),
            }
        }
        Ok(values)
    }

    fn local_name(&self, event: &str, call: &str) -> Result<EventName> {
        let name = EventName::from(event);
        if name.len() != 1 || !name.is_valid() {
            return Err(self.usage(format!(
                "{}() with '{}' is deprecated for distributed use, use {}_one() or {}_all()",
                call, event, call, call
            )));
        }
        Ok(name)
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    /// Publishes not yet acknowledged by the broker.
    pub fn pending_outbound(&self) -> usize {
        self.outbound.len()
    }

    /// Requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.correlations.len()
    }

    /// Events with a live queue binding.
    pub async fn bound_queues(&self) -> Vec<EventId> {
        self.queues
            .bindings()
            .await
            .into_iter()
            .map(|binding| binding.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    fn usage(&self, message: String) -> EmitterError {
        self.report(EmitterError::Usage(message))
    }

    /// Broadcast `err` and hand it back to the caller.
    fn report(&self, err: EmitterError) -> EmitterError {
        self.notifier.error(err.clone());
        err
    }
}

impl Drop for Emitter {
    fn drop(&mut self) {
        self.lifecycle.abandon();
    }
}

#[cfg(test)]
mod tests;
