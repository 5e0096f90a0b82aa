//! Request correlation table.
//!
//! Maps correlation ids to callers waiting on a `ONE` reply. Replies arrive
//! on the connection's direct reply-to consumer, which this table serves as
//! the delivery handler for.
//!
//! A pending request ends on whichever comes first: its reply or its
//! deadline. The entry is removed on both paths; a late reply finds nothing
//! and is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::emitter::Notifier;
use crate::error::{EmitterError, Result};
use crate::event::EventName;
use crate::outbound::{OutboundTracker, Target};
use crate::transport::{Delivery, DeliveryHandler, MessageProperties, DIRECT_REPLY_TO};

type Waiters = DashMap<String, oneshot::Sender<Value>>;

/// Outstanding `ONE` requests.
pub struct CorrelationTable {
    pending: Waiters,
    outbound: Arc<OutboundTracker>,
    notifier: Notifier,
}

/// Removes a pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    pending: &'a Waiters,
    correlation_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

impl CorrelationTable {
    pub fn new(outbound: Arc<OutboundTracker>, notifier: Notifier) -> Self {
        Self {
            pending: DashMap::new(),
            outbound,
            notifier,
        }
    }

    /// Number of requests awaiting a reply.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Send `body` to the `event` queue and wait for the correlated reply.
    ///
    /// The deadline starts once the broker has acknowledged the request.
    /// Connection loss does not fail the request early.
    pub async fn request(&self, event: &EventName, body: &Value, timeout: Duration) -> Result<Value> {
        let payload = serde_json::to_vec(body)?;
        let correlation_id = Uuid::new_v4().to_string();

        // Registered before sending so an instant reply finds its waiter.
        let (tx, rx) = oneshot::channel();
        self.pending.insert(correlation_id.clone(), tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            correlation_id: correlation_id.clone(),
        };

        let properties = MessageProperties::json()
            .with_reply_to(DIRECT_REPLY_TO)
            .with_correlation_id(correlation_id.as_str());
        self.outbound
            .send(Target::queue(event.to_string()), payload, properties)
            .await?;
        debug!(event = %event, correlation_id = %correlation_id, "Request sent, awaiting reply");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(EmitterError::Shutdown),
            Err(_) => Err(EmitterError::RequestTimeout {
                event: event.to_string(),
                timeout,
            }),
        }
    }

    /// Resolve the request waiting on `correlation_id`.
    ///
    /// Returns false when nothing was waiting (timed out or unknown).
    pub fn on_reply(&self, correlation_id: &str, body: Value) -> bool {
        match self.pending.remove(correlation_id) {
            Some((_, waiter)) => waiter.send(body).is_ok(),
            None => {
                debug!(correlation_id = %correlation_id, "Reply for unknown request dropped");
                false
            }
        }
    }

    fn accept(&self, delivery: &Delivery) {
        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            warn!(routing_key = %delivery.routing_key, "Reply without correlation id dropped");
            return;
        };
        match serde_json::from_slice::<Value>(&delivery.payload) {
            Ok(body) => {
                self.on_reply(correlation_id, body);
            }
            Err(e) => {
                self.notifier.error(EmitterError::ProtocolViolation(format!(
                    "reply {} is not valid JSON: {}",
                    correlation_id, e
                )));
            }
        }
    }
}

impl DeliveryHandler for CorrelationTable {
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()> {
        // Reply deliveries are consumed without acknowledgement.
        self.accept(&delivery);
        Box::pin(future::ready(()))
    }
}
