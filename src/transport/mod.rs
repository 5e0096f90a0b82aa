//! Messaging transport abstraction.
//!
//! The emitter drives a broker through two traits:
//! - `Transport`: opens connections
//! - `Connection`: one connection with a single confirm-mode channel
//!
//! Implementations:
//! - `MemoryBroker`: in-process broker, no external deps
//! - `AmqpTransport`: RabbitMQ via lapin (feature `amqp`)

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::config::ServerConfig;

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpTransport;
pub use memory::MemoryBroker;

/// Sentinel reply-to address. Replies published to the address the broker
/// substitutes for it arrive on the connection's reply consumer.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Content type stamped on every published message.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors reported by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Channel operation failed: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    /// The connection is gone, either closed locally or lost.
    #[error("Connection closed: {0}")]
    Closed(String),

    /// Fatal network error reported asynchronously by an open connection.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

/// Sender half given to `Transport::open` for reporting fatal connection loss.
pub type CloseSender = mpsc::UnboundedSender<TransportError>;

/// Message properties the emitter reads and writes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn json() -> Self {
        Self {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            ..Default::default()
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Broker verdict on a confirmed publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// Settles a delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
}

/// A consumed message.
pub struct Delivery {
    /// Exchange the message was published to. Empty for direct queue sends.
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            properties,
            acker: None,
        }
    }

    /// Attach the broker-side acknowledger. Deliveries without one (for
    /// example from a no-ack reply consumer) settle as no-ops.
    pub fn with_acker(mut self, acker: Box<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub async fn ack(&mut self) -> Result<()> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("properties", &self.properties)
            .finish()
    }
}

/// Handler for consumed messages.
pub trait DeliveryHandler: Send + Sync {
    /// Process one delivery. Implementations settle it themselves.
    fn handle(&self, delivery: Delivery) -> BoxFuture<'static, ()>;
}

/// Opens broker connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection with a confirm-mode channel.
    ///
    /// Fatal errors that occur after the connection is established are sent
    /// on `closed`. A local `close()` does not report anything.
    async fn open(&self, server: &ServerConfig, closed: CloseSender)
        -> Result<Arc<dyn Connection>>;
}

/// One broker connection with its channel.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Declare a topic exchange.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue and return its name. An empty `name` asks the broker
    /// to generate one.
    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Start consuming `queue`, handing every delivery to `handler`.
    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()>;

    /// Start consuming the direct reply-to pseudo queue.
    async fn consume_replies(&self, handler: Arc<dyn DeliveryHandler>) -> Result<()>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<Confirmation>;

    /// Close the channel, then the connection.
    async fn close(&self) -> Result<()>;
}
