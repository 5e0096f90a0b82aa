//! AMQP (RabbitMQ) transport.
//!
//! One lapin connection with a single confirm-mode channel per `open`.
//! Consumers run in spawned tasks and hand each delivery to the handler in
//! its own task, so slow listeners do not hold up the queue.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker as LapinAcker,
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{FieldTable, ShortString},
    BasicProperties, Channel, Connection as LapinConnection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    Acker, CloseSender, Confirmation, Connection, Delivery, DeliveryHandler, MessageProperties,
    Result, Transport, TransportError, DIRECT_REPLY_TO,
};
use crate::config::ServerConfig;

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Transport that connects to RabbitMQ.
#[derive(Clone, Debug, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open(
        &self,
        server: &ServerConfig,
        closed: CloseSender,
    ) -> Result<Arc<dyn Connection>> {
        let mut properties = ConnectionProperties::default();
        if let Some(name) = &server.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }

        let connection = LapinConnection::connect(&server.url, properties)
            .await
            .map_err(|e| TransportError::Connect(format!("Failed to connect: {}", e)))?;

        connection.on_error(move |e| {
            let _ = closed.send(TransportError::ConnectionLost(e.to_string()));
        });

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connect(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connect(format!("Failed to enable confirms: {}", e)))?;

        info!(url = %redact(&server.url), "Connected to AMQP");

        Ok(Arc::new(AmqpConnection {
            connection,
            channel,
        }))
    }
}

/// Strip credentials from a broker URL for logging.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}***{}", &url[..scheme + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// An open lapin connection and its channel.
pub struct AmqpConnection {
    connection: LapinConnection,
    channel: Channel,
}

impl AmqpConnection {
    async fn start_consumer(
        &self,
        queue: &str,
        no_ack: bool,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<()> {
        let tag = format!("relaymq-{}", Uuid::new_v4());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("Failed to start consumer: {}", e)))?;

        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let delivery = convert_delivery(delivery, no_ack);
                        tokio::spawn(handler.handle(delivery));
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "Consumer delivery error");
                        break;
                    }
                }
            }
            debug!(queue = %queue, "Consumer stream ended");
        });

        Ok(())
    }
}

fn convert_delivery(delivery: LapinDelivery, no_ack: bool) -> Delivery {
    let properties = MessageProperties {
        reply_to: delivery.properties.reply_to().as_ref().map(|s| s.to_string()),
        correlation_id: delivery
            .properties
            .correlation_id()
            .as_ref()
            .map(|s| s.to_string()),
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|s| s.to_string()),
    };
    let converted = Delivery::new(
        delivery.exchange.as_str(),
        delivery.routing_key.as_str(),
        delivery.data,
        properties,
    );
    if no_ack {
        converted
    } else {
        converted.with_acker(Box::new(AmqpAcker {
            acker: delivery.acker,
        }))
    }
}

fn to_basic_properties(properties: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(content_type) = &properties.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(reply_to) = &properties.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(correlation_id) = &properties.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.as_str()));
    }
    basic
}

struct AmqpAcker {
    acker: LapinAcker,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to ack message: {}", e)))
    }
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to declare exchange: {}", e)))
    }

    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: !exclusive,
                    exclusive,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to declare queue: {}", e)))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to bind queue: {}", e)))?;

        debug!(queue = %queue, pattern = %pattern, "Bound queue to exchange");
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| TransportError::Channel(format!("Failed to delete queue: {}", e)))?;
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        self.start_consumer(queue, false, handler).await
    }

    async fn consume_replies(&self, handler: Arc<dyn DeliveryHandler>) -> Result<()> {
        self.start_consumer(DIRECT_REPLY_TO, true, handler).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<Confirmation> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                to_basic_properties(properties),
            )
            .await
            .map_err(|e| TransportError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm.await.map_err(|e| {
            TransportError::Publish(format!("Publish confirmation failed: {}", e))
        })?;

        if confirmation.is_nack() {
            warn!(exchange = %exchange, routing_key = %routing_key, "Publish nacked by broker");
            Ok(Confirmation::Nack)
        } else {
            Ok(Confirmation::Ack)
        }
    }

    async fn close(&self) -> Result<()> {
        let channel = self.channel.close(REPLY_SUCCESS, "closing").await;
        let connection = self.connection.close(REPLY_SUCCESS, "closing").await;
        channel
            .and(connection)
            .map_err(|e| TransportError::Closed(format!("Failed to close cleanly: {}", e)))
    }
}
