//! Outbound delivery tracker.
//!
//! Every publish is registered as a pending entry before it is attempted and
//! stays registered until the broker confirms it. Entries survive connection
//! loss and are replayed on the next connection; the caller's wait resolves
//! on whichever attempt is acknowledged first.
//!
//! Each entry remembers the connection generation it was last attempted on.
//! An attempt must first claim the entry for the live generation, so an
//! entry is published at most once per connection (nack retries aside).

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::{join_all, BoxFuture};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::connection::{ConnectionSlot, LiveConnection};
use crate::error::{EmitterError, Result};
use crate::transport::{Confirmation, MessageProperties};
use crate::utils::retry;

/// Where a message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Exchange name; empty for a direct send to a queue.
    pub exchange: String,
    pub routing_key: String,
}

impl Target {
    /// Direct send to the named queue.
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: name.into(),
        }
    }

    pub fn exchange(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exchange.is_empty() {
            f.write_str(&self.routing_key)
        } else {
            write!(f, "{}/{}", self.exchange, self.routing_key)
        }
    }
}

struct Entry {
    target: Target,
    payload: Arc<[u8]>,
    properties: MessageProperties,
    /// Generation of the last attempt; 0 when never attempted.
    generation: u64,
    nacks: usize,
    done: Option<oneshot::Sender<Result<()>>>,
}

/// What an attempt publishes.
struct Attempt {
    target: Target,
    payload: Arc<[u8]>,
    properties: MessageProperties,
}

#[derive(Clone, Copy)]
enum Claim {
    /// First attempt on this generation.
    Fresh,
    /// Re-publish after a nack on the same generation.
    AfterNack,
}

/// Pending outbound publishes, keyed by attempt id.
pub struct OutboundTracker {
    entries: DashMap<Uuid, Entry>,
    slot: Arc<ConnectionSlot>,
    max_nack_retries: usize,
    max_pending: Option<usize>,
}

impl OutboundTracker {
    pub fn new(
        slot: Arc<ConnectionSlot>,
        max_nack_retries: usize,
        max_pending: Option<usize>,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            slot,
            max_nack_retries,
            max_pending,
        }
    }

    /// Number of publishes not yet acknowledged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Publish and wait for the broker to acknowledge it.
    ///
    /// While disconnected the wait extends until a replay on a later
    /// connection is acknowledged.
    pub async fn send(
        self: &Arc<Self>,
        target: Target,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<()> {
        let done = self.enqueue(target, payload, properties)?;
        done.await.unwrap_or(Err(EmitterError::Shutdown))
    }

    /// Register a publish and start it if connected.
    ///
    /// The entry lives on even if the returned receiver is dropped.
    pub fn enqueue(
        self: &Arc<Self>,
        target: Target,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        if let Some(max) = self.max_pending {
            let pending = self.entries.len();
            if pending >= max {
                return Err(EmitterError::Backpressure { pending });
            }
        }

        let id = Uuid::new_v4();
        let (done, rx) = oneshot::channel();
        debug!(id = %id, target = %target, "Registering outbound publish");
        self.entries.insert(
            id,
            Entry {
                target,
                payload: payload.into(),
                properties,
                generation: 0,
                nacks: 0,
                done: Some(done),
            },
        );

        if let Some(live) = self.slot.current() {
            tokio::spawn(Arc::clone(self).attempt(id, live, Claim::Fresh));
        }
        Ok(rx)
    }

    /// Re-publish every pending entry on a new connection and wait for the
    /// broker's first verdict on each.
    pub async fn replay_all(self: &Arc<Self>, live: &LiveConnection) {
        let ids: Vec<Uuid> = self.entries.iter().map(|e| *e.key()).collect();
        if ids.is_empty() {
            return;
        }
        debug!(count = ids.len(), generation = live.generation, "Replaying outbound publishes");
        let attempts = ids
            .into_iter()
            .map(|id| Arc::clone(self).attempt(id, live.clone(), Claim::Fresh));
        join_all(attempts).await;
    }

    /// Start entries registered while the connection was being established.
    pub fn flush(self: &Arc<Self>) {
        let Some(live) = self.slot.current() else {
            return;
        };
        let stale: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.generation < live.generation)
            .map(|e| *e.key())
            .collect();
        for id in stale {
            tokio::spawn(Arc::clone(self).attempt(id, live.clone(), Claim::Fresh));
        }
    }

    fn claim(&self, id: Uuid, generation: u64, claim: Claim) -> Option<Attempt> {
        let mut entry = self.entries.get_mut(&id)?;
        let allowed = match claim {
            Claim::Fresh => entry.generation < generation,
            Claim::AfterNack => entry.generation == generation,
        };
        if !allowed {
            return None;
        }
        entry.generation = generation;
        Some(Attempt {
            target: entry.target.clone(),
            payload: Arc::clone(&entry.payload),
            properties: entry.properties.clone(),
        })
    }

    fn attempt(self: Arc<Self>, id: Uuid, live: LiveConnection, claim: Claim) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let Some(attempt) = self.claim(id, live.generation, claim) else {
                return;
            };
            let result = live
                .connection
                .publish(
                    &attempt.target.exchange,
                    &attempt.target.routing_key,
                    &attempt.payload,
                    &attempt.properties,
                )
                .await;

            match result {
                Ok(Confirmation::Ack) => {
                    debug!(id = %id, target = %attempt.target, "Publish acknowledged");
                    self.complete(id, Ok(()));
                }
                Ok(Confirmation::Nack) => self.on_nack(id, live, attempt.target),
                Err(e) => {
                    debug!(id = %id, error = %e, "Publish interrupted, awaiting replay");
                }
            }
        })
    }

    fn on_nack(self: Arc<Self>, id: Uuid, live: LiveConnection, target: Target) {
        let nacks = match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.nacks += 1;
                entry.nacks
            }
            None => return,
        };

        match retry::nack_delay(self.max_nack_retries, nacks - 1) {
            Some(delay) => {
                warn!(id = %id, target = %target, nacks, delay_ms = delay.as_millis() as u64, "Publish nacked, retrying");
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    self.attempt(id, live, Claim::AfterNack).await;
                });
            }
            None => {
                warn!(id = %id, target = %target, nacks, "Publish nacked, giving up");
                self.complete(
                    id,
                    Err(EmitterError::Nacked {
                        target: target.to_string(),
                        attempts: nacks,
                    }),
                );
            }
        }
    }

    /// Remove an entry and resolve its waiter. A second completion for the
    /// same id is a no-op.
    fn complete(&self, id: Uuid, result: Result<()>) {
        if let Some((_, mut entry)) = self.entries.remove(&id) {
            if let Some(done) = entry.done.take() {
                let _ = done.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests;
