//! In-process message broker.
//!
//! Implements enough of the AMQP model for the emitter to run without a
//! RabbitMQ server: topic exchanges, named and exclusive server-named
//! queues, competing consumers (round-robin), direct reply-to and publisher
//! confirms. Ideal for local development and testing.
//!
//! Fault injection hooks (`fail_next_connects`, `nack_next_publishes`,
//! `hold_confirms`, `sever_connections`) let tests drive the reconnect and
//! redelivery paths deterministically.
//!
//! Unacknowledged deliveries are not requeued when a connection is lost.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use super::{
    Acker, CloseSender, Confirmation, Connection, Delivery, DeliveryHandler, MessageProperties,
    Result, Transport, TransportError, DIRECT_REPLY_TO,
};
use crate::config::ServerConfig;
use crate::event::{match_segments, TOPIC_WILDCARD_MANY};

/// Prefix of server-generated queue names.
const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

#[derive(Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    payload: Vec<u8>,
    properties: MessageProperties,
}

struct Consumer {
    connection: u64,
    handler: Arc<dyn DeliveryHandler>,
}

#[derive(Default)]
struct QueueState {
    exclusive_owner: Option<u64>,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    backlog: VecDeque<Message>,
}

struct Binding {
    queue: String,
    exchange: String,
    pattern: String,
}

struct ConnectionState {
    closed: CloseSender,
    severed: watch::Sender<bool>,
    replies: Option<Arc<dyn DeliveryHandler>>,
}

#[derive(Default)]
struct Stats {
    published: usize,
    acked: usize,
}

#[derive(Default)]
struct Faults {
    fail_connects: usize,
    nack_publishes: usize,
    hold_confirms: bool,
}

#[derive(Default)]
struct BrokerState {
    next_connection: u64,
    next_queue: u64,
    exchanges: HashSet<String>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionState>,
    stats: Stats,
    faults: Faults,
}

/// A ready-to-run delivery, spawned once the state lock is released.
type Dispatch = (Arc<dyn DeliveryHandler>, Delivery);

/// In-process broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.lock().faults.fail_connects = count;
    }

    /// Nack the next `count` publishes without routing them.
    pub fn nack_next_publishes(&self, count: usize) {
        self.lock().faults.nack_publishes = count;
    }

    /// While set, publishes are swallowed and never confirmed; they fail
    /// once their connection is severed or closed.
    pub fn hold_confirms(&self, hold: bool) {
        self.lock().faults.hold_confirms = hold;
    }

    /// Drop every open connection as if the network failed.
    pub fn sever_connections(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for &id in &ids {
            if let Some(conn) = remove_connection(&mut state, id) {
                let _ = conn
                    .closed
                    .send(TransportError::ConnectionLost("connection reset by broker".into()));
            }
        }
        info!(connections = ids.len(), "Severed broker connections");
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn binding_count(&self) -> usize {
        self.lock().bindings.len()
    }

    /// Confirmed publishes, including replies.
    pub fn published(&self) -> usize {
        self.lock().stats.published
    }

    pub fn acked(&self) -> usize {
        self.lock().stats.acked
    }

    /// Open a connection outside of any emitter, for driving raw traffic.
    pub async fn connect_raw(&self) -> Result<Arc<dyn Connection>> {
        let (closed, _) = tokio::sync::mpsc::unbounded_channel();
        self.open(&ServerConfig::default(), closed).await
    }
}

fn remove_connection(state: &mut BrokerState, id: u64) -> Option<ConnectionState> {
    let conn = state.connections.remove(&id)?;
    let _ = conn.severed.send(true);

    let exclusive: Vec<String> = state
        .queues
        .iter()
        .filter(|(_, q)| q.exclusive_owner == Some(id))
        .map(|(name, _)| name.clone())
        .collect();
    for name in &exclusive {
        state.queues.remove(name);
    }
    state.bindings.retain(|b| !exclusive.contains(&b.queue));

    for queue in state.queues.values_mut() {
        queue.consumers.retain(|c| c.connection != id);
    }
    Some(conn)
}

/// Hand `message` to the next consumer of `queue`, or park it.
fn enqueue(
    broker: &MemoryBroker,
    state: &mut BrokerState,
    queue_name: &str,
    message: Message,
) -> Option<Dispatch> {
    let queue = state.queues.get_mut(queue_name)?;
    if queue.consumers.is_empty() {
        queue.backlog.push_back(message);
        return None;
    }
    let index = queue.next_consumer % queue.consumers.len();
    queue.next_consumer = queue.next_consumer.wrapping_add(1);
    let consumer = &queue.consumers[index];
    Some((
        Arc::clone(&consumer.handler),
        to_delivery(broker, consumer.connection, message),
    ))
}

fn to_delivery(broker: &MemoryBroker, connection: u64, message: Message) -> Delivery {
    let acker = MemoryAcker {
        broker: broker.clone(),
        connection,
    };
    Delivery::new(
        message.exchange,
        message.routing_key,
        message.payload,
        message.properties,
    )
    .with_acker(Box::new(acker))
}

fn spawn_all(dispatches: Vec<Dispatch>) {
    for (handler, delivery) in dispatches {
        tokio::spawn(handler.handle(delivery));
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    connection: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if !state.connections.contains_key(&self.connection) {
            return Err(TransportError::Closed("delivery channel is closed".into()));
        }
        state.stats.acked += 1;
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    async fn open(
        &self,
        server: &ServerConfig,
        closed: CloseSender,
    ) -> Result<Arc<dyn Connection>> {
        let mut state = self.lock();
        if state.faults.fail_connects > 0 {
            state.faults.fail_connects -= 1;
            return Err(TransportError::Connect(format!(
                "connection refused: {}",
                server.url
            )));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (severed, _) = watch::channel(false);
        state.connections.insert(
            id,
            ConnectionState {
                closed,
                severed,
                replies: None,
            },
        );
        debug!(connection = id, url = %server.url, "Memory broker connection opened");

        Ok(Arc::new(MemoryConnection {
            id,
            broker: self.clone(),
        }))
    }
}

/// One connection to a `MemoryBroker`.
pub struct MemoryConnection {
    id: u64,
    broker: MemoryBroker,
}

impl MemoryConnection {
    fn open_state(&self) -> Result<MutexGuard<'_, BrokerState>> {
        let state = self.broker.lock();
        if state.connections.contains_key(&self.id) {
            Ok(state)
        } else {
            Err(TransportError::Closed(format!("connection {} is closed", self.id)))
        }
    }

    fn reply_address(&self) -> String {
        format!("{}.{}", DIRECT_REPLY_TO, self.id)
    }

    fn route(&self, state: &mut BrokerState, message: Message) -> Result<Vec<Dispatch>> {
        let mut dispatches = Vec::new();

        if message.exchange.is_empty() {
            if let Some(target) = message
                .routing_key
                .strip_prefix(DIRECT_REPLY_TO)
                .and_then(|rest| rest.strip_prefix('.'))
            {
                let handler = target
                    .parse::<u64>()
                    .ok()
                    .and_then(|id| state.connections.get(&id))
                    .and_then(|conn| conn.replies.clone());
                match handler {
                    Some(handler) => dispatches.push((
                        handler,
                        Delivery::new("", message.routing_key.clone(), message.payload, message.properties),
                    )),
                    None => debug!(routing_key = %message.routing_key, "Reply target gone, dropping"),
                }
            } else if state.queues.contains_key(&message.routing_key) {
                let queue = message.routing_key.clone();
                dispatches.extend(enqueue(&self.broker, state, &queue, message));
            } else {
                debug!(routing_key = %message.routing_key, "Unroutable message dropped");
            }
            return Ok(dispatches);
        }

        if !state.exchanges.contains(&message.exchange) {
            return Err(TransportError::Publish(format!(
                "no exchange '{}'",
                message.exchange
            )));
        }

        let key: Vec<&str> = message.routing_key.split('.').collect();
        let mut targets: Vec<String> = Vec::new();
        for binding in state.bindings.iter().filter(|b| b.exchange == message.exchange) {
            let pattern: Vec<&str> = binding.pattern.split('.').collect();
            if match_segments(&pattern, &key, TOPIC_WILDCARD_MANY) && !targets.contains(&binding.queue)
            {
                targets.push(binding.queue.clone());
            }
        }
        for queue in targets {
            dispatches.extend(enqueue(&self.broker, state, &queue, message.clone()));
        }
        Ok(dispatches)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.open_state()?.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String> {
        let mut state = self.open_state()?;
        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("{}{}", GENERATED_QUEUE_PREFIX, state.next_queue)
        } else {
            name.to_string()
        };

        match state.queues.get(&name) {
            Some(queue) => {
                if let Some(owner) = queue.exclusive_owner {
                    if owner != self.id {
                        return Err(TransportError::Channel(format!(
                            "queue '{}' is locked to another connection",
                            name
                        )));
                    }
                }
            }
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        exclusive_owner: exclusive.then_some(self.id),
                        ..Default::default()
                    },
                );
            }
        }
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        let mut state = self.open_state()?;
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Channel(format!("no queue '{}'", queue)));
        }
        if !state.exchanges.contains(exchange) {
            return Err(TransportError::Channel(format!("no exchange '{}'", exchange)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.pattern == pattern);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                pattern: pattern.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        let mut state = self.open_state()?;
        state.queues.remove(queue);
        state.bindings.retain(|b| b.queue != queue);
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let dispatches = {
            let mut state = self.open_state()?;
            let id = self.id;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::Consume(format!("no queue '{}'", queue)))?;
            q.consumers.push(Consumer {
                connection: id,
                handler: Arc::clone(&handler),
            });
            let backlog: Vec<Message> = q.backlog.drain(..).collect();
            backlog
                .into_iter()
                .map(|message| (Arc::clone(&handler), to_delivery(&self.broker, id, message)))
                .collect::<Vec<_>>()
        };
        spawn_all(dispatches);
        Ok(())
    }

    async fn consume_replies(&self, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        let mut state = self.open_state()?;
        if let Some(conn) = state.connections.get_mut(&self.id) {
            conn.replies = Some(handler);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<Confirmation> {
        let outcome = {
            let mut state = self.open_state()?;

            if state.faults.hold_confirms {
                let severed = state
                    .connections
                    .get(&self.id)
                    .map(|c| c.severed.subscribe());
                Err(severed)
            } else if state.faults.nack_publishes > 0 {
                state.faults.nack_publishes -= 1;
                Ok(None)
            } else {
                let mut properties = properties.clone();
                if properties.reply_to.as_deref() == Some(DIRECT_REPLY_TO) {
                    let has_consumer = state
                        .connections
                        .get(&self.id)
                        .is_some_and(|c| c.replies.is_some());
                    if !has_consumer {
                        return Err(TransportError::Publish(
                            "fast reply consumer does not exist".into(),
                        ));
                    }
                    properties.reply_to = Some(self.reply_address());
                }

                let message = Message {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    payload: payload.to_vec(),
                    properties,
                };
                let dispatches = self.route(&mut state, message)?;
                state.stats.published += 1;
                Ok(Some(dispatches))
            }
        };

        match outcome {
            Ok(Some(dispatches)) => {
                spawn_all(dispatches);
                Ok(Confirmation::Ack)
            }
            Ok(None) => Ok(Confirmation::Nack),
            Err(severed) => {
                if let Some(mut severed) = severed {
                    let _ = severed.wait_for(|s| *s).await;
                }
                Err(TransportError::Closed(
                    "connection closed before publish was confirmed".into(),
                ))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        remove_connection(&mut state, self.id);
        debug!(connection = self.id, "Memory broker connection closed");
        Ok(())
    }
}
