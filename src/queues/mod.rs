//! Queue lifecycle tracker.
//!
//! Holds at most one live queue binding per `EventId`. Callers take the
//! tracker lock for the whole listener-count transition they are acting on,
//! so binding creation and teardown never interleave for the same id.
//!
//! - `ONE` binds a shared, durable queue named after the event; processes
//!   listening on it compete for messages.
//! - `ALL` binds a server-named exclusive queue to the topic exchange, so
//!   each process sees every matching message.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::connection::ConnectionSlot;
use crate::error::{EmitterError, Result};
use crate::event::{EventId, EventMode};
use crate::transport::{Connection, DeliveryHandler};

/// A live queue binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub id: EventId,
    /// Queue name on the broker; server-generated for `ALL`.
    pub queue: String,
}

/// Records live queue bindings and recreates them after reconnect.
pub struct QueueTracker {
    exchange: String,
    slot: Arc<ConnectionSlot>,
    bindings: Mutex<HashMap<EventId, Binding>>,
}

impl QueueTracker {
    pub fn new(exchange: impl Into<String>, slot: Arc<ConnectionSlot>) -> Self {
        Self {
            exchange: exchange.into(),
            slot,
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Lock the tracker for a listener-count transition.
    pub async fn lock(&self) -> QueueGuard<'_> {
        QueueGuard {
            tracker: self,
            bindings: self.bindings.lock().await,
        }
    }

    /// Snapshot of the recorded bindings.
    pub async fn bindings(&self) -> Vec<Binding> {
        self.bindings.lock().await.values().cloned().collect()
    }

    /// Re-create every recorded binding on a new connection.
    ///
    /// Bindings do not survive a reconnect; `ALL` queues get new names.
    /// `handler_for` supplies the consumer for each binding.
    pub async fn recreate_all<F>(
        &self,
        connection: &Arc<dyn Connection>,
        handler_for: F,
    ) -> Result<()>
    where
        F: Fn(&EventId) -> Arc<dyn DeliveryHandler> + Send + Sync,
    {
        let mut bindings = self.bindings.lock().await;
        let ids: Vec<EventId> = bindings.keys().cloned().collect();
        for id in ids {
            let queue = self.bind(connection, &id, handler_for(&id)).await?;
            debug!(event = %id, queue = %queue, "Recreated queue binding");
            bindings.insert(id.clone(), Binding { id, queue });
        }
        if !bindings.is_empty() {
            info!(count = bindings.len(), "Queue bindings recreated");
        }
        Ok(())
    }

    async fn bind(
        &self,
        connection: &Arc<dyn Connection>,
        id: &EventId,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String> {
        let queue = match id.mode {
            EventMode::One => connection.declare_queue(&id.name.to_string(), false).await?,
            EventMode::All => {
                let queue = connection.declare_queue("", true).await?;
                connection
                    .bind_queue(&queue, &self.exchange, &id.name.topic_pattern())
                    .await?;
                queue
            }
        };
        connection.consume(&queue, handler).await?;
        Ok(queue)
    }
}

/// Exclusive access to the binding records.
pub struct QueueGuard<'a> {
    tracker: &'a QueueTracker,
    bindings: MutexGuard<'a, HashMap<EventId, Binding>>,
}

impl QueueGuard<'_> {
    pub fn is_bound(&self, id: &EventId) -> bool {
        self.bindings.contains_key(id)
    }

    /// Create and consume the binding for `id` unless one exists.
    ///
    /// Returns true if a binding was created.
    pub async fn ensure(&mut self, id: &EventId, handler: Arc<dyn DeliveryHandler>) -> Result<bool> {
        if self.is_bound(id) {
            return Ok(false);
        }
        let live = self
            .tracker
            .slot
            .current()
            .ok_or_else(|| EmitterError::NotConnected(format!("cannot bind {}", id)))?;

        let queue = self.tracker.bind(&live.connection, id, handler).await?;
        info!(event = %id, queue = %queue, "Queue binding created");
        self.bindings.insert(
            id.clone(),
            Binding {
                id: id.clone(),
                queue,
            },
        );
        Ok(true)
    }

    /// Delete the queue bound for `id` and drop the record.
    ///
    /// The record is dropped even when the broker cannot be reached, so the
    /// binding is not recreated on the next connect.
    pub async fn release(&mut self, id: &EventId) -> Result<bool> {
        let Some(binding) = self.bindings.remove(id) else {
            return Ok(false);
        };
        let live = self
            .tracker
            .slot
            .current()
            .ok_or_else(|| EmitterError::NotConnected(format!("cannot release {}", id)))?;

        live.connection.delete_queue(&binding.queue).await?;
        info!(event = %id, queue = %binding.queue, "Queue binding released");
        Ok(true)
    }
}

#[cfg(test)]
mod tests;
