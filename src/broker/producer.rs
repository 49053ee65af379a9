//! Confirm-based producer.
//!
//! Every send waits for the broker's publisher confirm. Messages are published
//! with the mandatory flag, so a message the broker cannot route comes back as
//! a failed [`SendResult`] instead of disappearing silently.
//!
//! Failures are reported, never thrown and never retried here; retrying is the
//! caller's decision.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error};
use uuid::Uuid;

use super::envelope::Envelope;
use super::manager::{ConnectionManager, ManagedChannel};
use super::{BrokerError, Confirmation, OutboundMessage, QueueConfig, Result};

/// Per-send options.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Extra headers; `sentAt` is always set by the producer.
    pub headers: BTreeMap<String, String>,
    /// Message id; a UUID v4 is generated when absent.
    pub message_id: Option<String>,
    /// Survive broker restarts (delivery mode 2).
    pub persistent: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            headers: BTreeMap::new(),
            message_id: None,
            persistent: true,
        }
    }
}

impl SendOptions {
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// Outcome of one send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResult {
    pub success: bool,
    pub message_id: String,
    pub error: Option<BrokerError>,
    /// Queue (routing key) the message was sent to.
    pub queue: String,
    pub timestamp: DateTime<Utc>,
}

impl SendResult {
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// True when the broker reported the message unroutable.
    pub fn is_unroutable(&self) -> bool {
        matches!(self.error, Some(BrokerError::Returned { .. }))
    }
}

/// Publishes to one queue over a dedicated channel.
///
/// The channel belongs to the connection generation the producer was created
/// on; after a reconnect every send fails until the producer is recreated.
pub struct Producer {
    manager: ConnectionManager,
    queue: QueueConfig,
    channel: ManagedChannel,
}

impl Producer {
    /// Open a channel and declare the target (queue, or exchange when routed
    /// through one).
    pub async fn new(manager: &ConnectionManager, queue: QueueConfig) -> Result<Self> {
        let channel = manager.create_channel().await?;

        let declared = match &queue.exchange {
            Some(exchange) => channel.declare_exchange(exchange, queue.durable).await,
            None => channel.declare_queue(&queue).await,
        };
        if let Err(e) = declared {
            let _ = manager.release(&channel).await;
            return Err(e);
        }

        debug!(
            queue = %queue.name,
            exchange = ?queue.exchange,
            generation = channel.generation(),
            "Producer ready"
        );

        Ok(Self {
            manager: manager.clone(),
            queue,
            channel,
        })
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    /// Whether the underlying channel is still usable.
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Connection generation this producer's channel belongs to.
    pub fn generation(&self) -> u64 {
        self.channel.generation()
    }

    /// Serialize, publish, and wait for the broker's verdict.
    pub async fn send<T>(&self, message: &T, options: SendOptions) -> SendResult
    where
        T: Serialize + ?Sized,
    {
        let message_id = options
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let outcome = self.publish(message, options, &message_id).await;

        match outcome {
            Ok(()) => {
                debug!(queue = %self.queue.name, message_id = %message_id, "Message confirmed");
                SendResult {
                    success: true,
                    message_id,
                    error: None,
                    queue: self.queue.name.clone(),
                    timestamp: Utc::now(),
                }
            }
            Err(e) => {
                error!(
                    queue = %self.queue.name,
                    message_id = %message_id,
                    error = %e,
                    "Failed to send message"
                );
                SendResult {
                    success: false,
                    message_id,
                    error: Some(e),
                    queue: self.queue.name.clone(),
                    timestamp: Utc::now(),
                }
            }
        }
    }

    async fn publish<T>(&self, message: &T, options: SendOptions, message_id: &str) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let envelope = Envelope::wrap(message, options.headers)?;
        let (payload, headers) = envelope.encode()?;
        let (exchange, routing_key) = self.queue.route();

        let confirmation = self
            .channel
            .publish(OutboundMessage {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                payload,
                headers,
                message_id: Some(message_id.to_string()),
                persistent: options.persistent,
                mandatory: true,
            })
            .await?;

        match confirmation {
            Confirmation::Ack => Ok(()),
            Confirmation::Nack => Err(BrokerError::Nacked(routing_key.to_string())),
            Confirmation::Returned {
                reply_code,
                reply_text,
            } => Err(BrokerError::Returned {
                routing_key: routing_key.to_string(),
                reply_code,
                reply_text,
            }),
        }
    }

    /// Release the channel back to the manager for closing.
    pub async fn close(self) -> Result<()> {
        self.manager.release(&self.channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::test_utils::memory_manager;
    use serde_json::json;

    #[tokio::test]
    async fn test_send_to_declared_queue_succeeds() {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker).await;
        let producer = Producer::new(&manager, QueueConfig::new("score.submitted"))
            .await
            .unwrap();

        let result = producer
            .send(&json!({"score": 87.5}), SendOptions::default().with_message_id("m-1"))
            .await;

        assert!(result.is_success());
        assert_eq!(result.message_id, "m-1");
        assert_eq!(result.queue, "score.submitted");
        assert!(result.error.is_none());
        assert_eq!(broker.queue_depth("score.submitted"), 1);
    }

    #[tokio::test]
    async fn test_generated_message_id() {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker).await;
        let producer = Producer::new(&manager, QueueConfig::new("q")).await.unwrap();

        let result = producer.send(&json!({}), SendOptions::default()).await;

        assert!(result.is_success());
        assert!(Uuid::parse_str(&result.message_id).is_ok());
    }

    #[tokio::test]
    async fn test_unroutable_publish_reports_failure() {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker).await;
        let producer = Producer::new(
            &manager,
            QueueConfig::new("competition.created").via_exchange("competitions"),
        )
        .await
        .unwrap();

        let result = producer
            .send(&json!({"city": "Paris"}), SendOptions::default())
            .await;

        assert!(!result.success);
        assert!(result.is_unroutable());
        assert_eq!(result.queue, "competition.created");
        assert!(!broker.queue_exists("competition.created"));
    }

    #[tokio::test]
    async fn test_send_after_reconnect_fails_without_retry() {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker).await;
        let producer = Producer::new(&manager, QueueConfig::new("q")).await.unwrap();

        broker.drop_connections();
        manager.wait_connected().await.unwrap();

        let result = producer.send(&json!({"n": 1}), SendOptions::default()).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(BrokerError::Channel(_))));
        assert_eq!(broker.queue_depth("q"), 0);

        let fresh = Producer::new(&manager, QueueConfig::new("q")).await.unwrap();
        assert!(fresh.generation() > producer.generation());
        assert!(fresh.send(&json!({"n": 1}), SendOptions::default()).await.success);
    }

    #[tokio::test]
    async fn test_close_releases_channel() {
        let broker = MemoryBroker::new();
        let manager = memory_manager(&broker).await;
        let producer = Producer::new(&manager, QueueConfig::new("q")).await.unwrap();
        assert_eq!(manager.open_channels(), 1);

        producer.close().await.unwrap();
        assert_eq!(manager.open_channels(), 0);
    }
}
