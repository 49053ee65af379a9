//! AMQP (RabbitMQ) transport via lapin.
//!
//! Channels are opened in confirm mode. Publishes carry the mandatory flag;
//! lapin folds the broker's basic.return into the publisher confirm, which is
//! mapped to [`Confirmation::Returned`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation as LapinConfirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::{
    loss_reported, Acker, BrokerError, Channel, Confirmation, Connector, DeliveryStream, Link,
    OutboundMessage, QueueConfig, RawDelivery, Result,
};

/// AMQP reply code used when the client closes a channel or connection.
const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections.
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Link>> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to connect: {}", e)))?;

        let (lost, _) = watch::channel(None);
        let lost = Arc::new(lost);
        let on_error = lost.clone();
        connection.on_error(move |e| {
            error!(error = %e, "AMQP connection error");
            on_error.send_replace(Some(BrokerError::Connection(e.to_string())));
        });

        info!("AMQP connection established");
        Ok(Arc::new(AmqpLink { connection, lost }))
    }
}

struct AmqpLink {
    connection: Connection,
    lost: Arc<watch::Sender<Option<BrokerError>>>,
}

#[async_trait]
impl Link for AmqpLink {
    fn is_connected(&self) -> bool {
        self.lost.borrow().is_none() && self.connection.status().connected()
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to enable confirms: {}", e)))?;

        Ok(Arc::new(AmqpChannel { channel }))
    }

    async fn closed(&self) -> BrokerError {
        let mut rx = self.lost.subscribe();
        loss_reported(&mut rx).await
    }

    async fn close(&self) -> Result<()> {
        self.connection
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
}

fn to_field_table(headers: &BTreeMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            key.clone().into(),
            AMQPValue::LongString(value.clone().into()),
        );
    }
    table
}

fn from_properties(properties: &BasicProperties) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }
    headers
}

#[async_trait]
impl Channel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<()> {
        self.channel
            .queue_declare(
                &queue.name,
                QueueDeclareOptions {
                    durable: queue.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Channel(format!("Failed to declare queue '{}': {}", queue.name, e))
            })?;

        debug!(queue = %queue.name, durable = queue.durable, "Declared queue");
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()> {
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BrokerError::Channel(format!("Failed to declare exchange '{}': {}", exchange, e))
            })?;

        debug!(exchange = %exchange, "Declared exchange");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to bind queue: {}", e)))?;

        debug!(
            queue = %queue,
            exchange = %exchange,
            routing_key = %routing_key,
            "Bound queue to exchange"
        );
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<Confirmation> {
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(if message.persistent { 2 } else { 1 })
            .with_headers(to_field_table(&message.headers));
        if let Some(message_id) = &message.message_id {
            properties = properties.with_message_id(message_id.clone().into());
        }

        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions {
                    mandatory: message.mandatory,
                    ..Default::default()
                },
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BrokerError::Publish(format!("Publish confirmation failed: {}", e)))?;

        Ok(match confirmation {
            LapinConfirmation::Ack(None) | LapinConfirmation::NotRequested => Confirmation::Ack,
            LapinConfirmation::Ack(Some(returned)) | LapinConfirmation::Nack(Some(returned)) => {
                Confirmation::Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.as_str().to_string(),
                }
            }
            LapinConfirmation::Nack(None) => Confirmation::Nack,
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let deliveries = consumer.map(|delivery| {
            delivery
                .map(|delivery| RawDelivery {
                    headers: from_properties(&delivery.properties),
                    redelivered: delivery.redelivered,
                    acker: Box::new(AmqpAcker(delivery.acker)),
                    payload: delivery.data,
                })
                .map_err(|e| BrokerError::Channel(format!("Delivery failed: {}", e)))
        });

        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to cancel consumer: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {}", e)))
    }
}

struct AmqpAcker(lapin::acker::Acker);

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.0
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(format!("Failed to nack: {}", e)))
    }
}
