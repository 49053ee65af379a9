//! Broker messaging layer.
//!
//! This module contains:
//! - `Connector` / `Link` / `Channel` traits: the transport seam
//! - `ConnectionManager`: owns the single live connection and reconnects on failure
//! - `Producer`: confirm-based publishing with unroutable detection
//! - `Consumer`: prefetch-bounded consumption with manual ack/nack
//! - Implementations: AMQP (RabbitMQ via lapin), in-memory

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;
use tokio::sync::watch;

use crate::config::{BrokerConfig, BrokerTransport};

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod consumer;
pub mod envelope;
pub mod manager;
pub mod memory;
pub mod producer;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
pub use consumer::{Consumer, Delivery, HandlerError, MessageHandler, ResilientConsumer};
pub use envelope::Envelope;
pub use manager::{ConnectionEvent, ConnectionManager, ManagedChannel};
pub use memory::MemoryBroker;
pub use producer::{Producer, SendOptions, SendResult};

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Message returned unroutable ({reply_code} {reply_text}) for '{routing_key}'")]
    Returned {
        routing_key: String,
        reply_code: u16,
        reply_text: String,
    },

    #[error("Broker rejected publish to '{0}'")]
    Nacked(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Malformed envelope: {0}")]
    Decode(String),

    #[error("Connection manager is closed")]
    Closed,
}

// ============================================================================
// Queue configuration
// ============================================================================

/// Default prefetch (in-flight unacknowledged deliveries per consumer).
pub const DEFAULT_PREFETCH: u16 = 10;

fn default_durable() -> bool {
    true
}

fn default_prefetch() -> u16 {
    DEFAULT_PREFETCH
}

/// Immutable description of a logical queue, supplied by the caller.
///
/// When `exchange` is set, producers publish to that exchange with the queue
/// name as routing key and consumers bind the queue to it. Otherwise messages
/// go through the default exchange straight to the named queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueueConfig {
    /// Queue name (also the routing key and the consumer tag).
    pub name: String,
    /// Survive broker restarts.
    #[serde(default = "default_durable")]
    pub durable: bool,
    /// Maximum unacknowledged deliveries held by one consumer.
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,
    /// Requeue a delivery whose handler failed.
    #[serde(default)]
    pub requeue_on_error: bool,
    /// Exchange to route through instead of the default exchange.
    #[serde(default)]
    pub exchange: Option<String>,
}

impl QueueConfig {
    /// Durable queue on the default exchange with default prefetch.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            prefetch: DEFAULT_PREFETCH,
            requeue_on_error: false,
            exchange: None,
        }
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_requeue_on_error(mut self, requeue: bool) -> Self {
        self.requeue_on_error = requeue;
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Route through a named exchange.
    pub fn via_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    /// Exchange and routing key used when publishing to this queue.
    pub fn route(&self) -> (&str, &str) {
        (self.exchange.as_deref().unwrap_or(""), &self.name)
    }
}

// ============================================================================
// Transport traits
// ============================================================================

/// A message ready for publishing.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub message_id: Option<String>,
    pub persistent: bool,
    /// Ask the broker to return the message if it cannot be routed.
    pub mandatory: bool,
}

/// Broker verdict on a single confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Message was confirmed but came back unroutable (mandatory flag).
    Returned { reply_code: u16, reply_text: String },
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A delivery as received from the transport, before envelope decoding.
pub struct RawDelivery {
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
    pub acker: Box<dyn Acker>,
}

/// Stream of deliveries for one consumer. Ends (or errors) when the channel dies.
pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// A multiplexed sub-session over a [`Link`], opened in confirm mode.
///
/// A channel is dead once its link drops; every operation on it fails from
/// then on.
#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<()>;

    async fn declare_exchange(&self, exchange: &str, durable: bool) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Bound the number of unacknowledged deliveries (0 = unbounded).
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish and wait for the broker's confirmation.
    async fn publish(&self, message: OutboundMessage) -> Result<Confirmation>;

    /// Start consuming with manual acknowledgment.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One physical connection to the broker.
#[async_trait]
pub trait Link: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Open a channel with publisher confirms enabled.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;

    /// Resolves once the connection is lost, with the reason.
    async fn closed(&self) -> BrokerError;

    async fn close(&self) -> Result<()>;
}

/// Opens physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Link>>;
}

/// Connector for the configured transport.
///
/// `Memory` yields a fresh, isolated in-process broker.
pub fn connector_for(config: &BrokerConfig) -> Result<Arc<dyn Connector>> {
    match config.transport {
        BrokerTransport::Amqp => {
            #[cfg(feature = "amqp")]
            {
                Ok(Arc::new(AmqpConnector::new()))
            }
            #[cfg(not(feature = "amqp"))]
            {
                Err(BrokerError::Connection(
                    "AMQP support requires the 'amqp' feature. Rebuild with --features amqp"
                        .to_string(),
                ))
            }
        }
        BrokerTransport::Memory => Ok(Arc::new(MemoryBroker::new())),
    }
}

/// Start a connection manager for the configured transport.
///
/// Returns immediately; the first connection is attempted in the background.
pub fn init_connection_manager(config: &BrokerConfig) -> Result<ConnectionManager> {
    let connector = connector_for(config)?;
    Ok(ConnectionManager::start(connector, config))
}

/// Wait until a watched flag becomes true (or its sender goes away).
pub(crate) async fn flag_raised(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|raised| *raised).await;
}

/// Wait until a watched connection-loss slot is filled.
pub(crate) async fn loss_reported(rx: &mut watch::Receiver<Option<BrokerError>>) -> BrokerError {
    match rx.wait_for(|lost| lost.is_some()).await {
        Ok(lost) => (*lost)
            .clone()
            .unwrap_or_else(|| BrokerError::Connection("connection lost".to_string())),
        Err(_) => BrokerError::Connection("connection dropped".to_string()),
    }
}
