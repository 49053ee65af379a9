//! In-process broker.
//!
//! Implements the [`Connector`] / [`Link`] / [`Channel`] seam without an
//! external server: direct exchanges, durable-in-memory queues, publisher
//! confirms, mandatory returns, per-channel prefetch and manual ack/nack.
//! Unacknowledged deliveries are requeued (marked redelivered) when their
//! channel dies, like an AMQP broker does.
//!
//! The broker can also be told to drop every live connection or to refuse new
//! ones, which is how reconnect behavior is exercised in tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

use super::{
    flag_raised, loss_reported, Acker, BrokerError, Channel, Confirmation, Connector,
    DeliveryStream, Link, OutboundMessage, QueueConfig, RawDelivery, Result,
};

/// AMQP reply code for an unroutable mandatory publish.
const NO_ROUTE: u16 = 312;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

#[derive(Default)]
struct MemoryQueue {
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl MemoryQueue {
    fn push_back(&self, message: StoredMessage) {
        lock(&self.ready).push_back(message);
        self.notify.notify_waiters();
    }

    fn push_front(&self, message: StoredMessage) {
        lock(&self.ready).push_front(message);
        self.notify.notify_waiters();
    }

    fn pop(&self) -> Option<StoredMessage> {
        lock(&self.ready).pop_front()
    }

    fn depth(&self) -> usize {
        lock(&self.ready).len()
    }
}

#[derive(Default)]
struct BrokerState {
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    /// exchange -> routing key -> bound queues
    exchanges: Mutex<HashMap<String, HashMap<String, Vec<String>>>>,
    links: Mutex<Vec<Arc<MemoryLink>>>,
    refuse: AtomicBool,
    connects: AtomicUsize,
}

impl BrokerState {
    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        lock(&self.queues).get(name).cloned()
    }

    /// Resolve the queues a publish lands in.
    fn route(&self, exchange: &str, routing_key: &str) -> Result<Vec<Arc<MemoryQueue>>> {
        if exchange.is_empty() {
            return Ok(self.queue(routing_key).into_iter().collect());
        }

        let exchanges = lock(&self.exchanges);
        let bindings = exchanges.get(exchange).ok_or_else(|| {
            BrokerError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;

        let names = bindings.get(routing_key).cloned().unwrap_or_default();
        drop(exchanges);

        Ok(names.iter().filter_map(|name| self.queue(name)).collect())
    }
}

/// In-process broker. Cloning shares the same queues and connections.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sever every live connection, as if the broker restarted.
    pub fn drop_connections(&self) {
        let links: Vec<_> = lock(&self.state.links).drain(..).collect();
        info!(count = links.len(), "Dropping in-memory broker connections");
        for link in links {
            link.sever(BrokerError::Connection(
                "connection reset by broker".to_string(),
            ));
        }
    }

    /// Refuse (or accept again) new connections.
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful connects so far.
    pub fn connection_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Connections accepted and not yet severed or closed.
    pub fn live_connections(&self) -> usize {
        lock(&self.state.links)
            .iter()
            .filter(|link| link.is_connected())
            .count()
    }

    /// Ready (undelivered) messages in a queue.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.queue(queue).map(|q| q.depth()).unwrap_or(0)
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.queue(queue).is_some()
    }

    /// Enqueue raw bytes directly, bypassing producers.
    pub fn inject(&self, queue: &str, payload: &[u8]) -> Result<()> {
        let target = self
            .state
            .queue(queue)
            .ok_or_else(|| BrokerError::Channel(format!("NOT_FOUND - no queue '{}'", queue)))?;
        target.push_back(StoredMessage {
            payload: payload.to_vec(),
            headers: BTreeMap::new(),
            redelivered: false,
        });
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Link>> {
        if self.state.refuse.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection(format!(
                "connection refused: {}",
                url
            )));
        }

        let (lost, _) = watch::channel(None);
        let link = Arc::new(MemoryLink {
            broker: self.state.clone(),
            lost,
            channels: Mutex::new(Vec::new()),
        });

        let mut links = lock(&self.state.links);
        links.retain(|existing| existing.is_connected());
        links.push(link.clone());
        drop(links);

        self.state.connects.fetch_add(1, Ordering::SeqCst);
        debug!(url = %url, "In-memory broker accepted connection");

        Ok(link)
    }
}

struct MemoryLink {
    broker: Arc<BrokerState>,
    lost: watch::Sender<Option<BrokerError>>,
    channels: Mutex<Vec<Arc<ChannelCore>>>,
}

impl MemoryLink {
    fn sever(&self, reason: BrokerError) {
        let newly_lost = self.lost.send_if_modified(|lost| {
            if lost.is_some() {
                return false;
            }
            *lost = Some(reason.clone());
            true
        });
        if !newly_lost {
            return;
        }

        let channels: Vec<_> = lock(&self.channels).drain(..).collect();
        for channel in channels {
            channel.shutdown();
        }
    }
}

#[async_trait]
impl Link for MemoryLink {
    fn is_connected(&self) -> bool {
        self.lost.borrow().is_none()
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_connected() {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }

        let (closed, _) = watch::channel(false);
        let core = Arc::new(ChannelCore {
            broker: self.broker.clone(),
            closed,
            prefetch: Mutex::new(None),
            unacked: Mutex::new(BTreeMap::new()),
            next_tag: AtomicU64::new(1),
            consumers: Mutex::new(HashMap::new()),
        });

        let mut channels = lock(&self.channels);
        if !self.is_connected() {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }
        channels.retain(|existing| existing.is_open());
        channels.push(core.clone());
        drop(channels);

        Ok(Arc::new(MemoryChannel { core }))
    }

    async fn closed(&self) -> BrokerError {
        let mut rx = self.lost.subscribe();
        loss_reported(&mut rx).await
    }

    async fn close(&self) -> Result<()> {
        self.sever(BrokerError::Connection("closed by client".to_string()));
        Ok(())
    }
}

struct Unacked {
    queue: Arc<MemoryQueue>,
    message: StoredMessage,
    _permit: Option<OwnedSemaphorePermit>,
}

struct ChannelCore {
    broker: Arc<BrokerState>,
    closed: watch::Sender<bool>,
    prefetch: Mutex<Option<Arc<Semaphore>>>,
    unacked: Mutex<BTreeMap<u64, Unacked>>,
    next_tag: AtomicU64,
    /// consumer tag -> cancel flag
    consumers: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl ChannelCore {
    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::Channel("channel is closed".to_string()))
        }
    }

    /// Close the channel and give its unacknowledged deliveries back.
    fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        for (_, cancel) in lock(&self.consumers).drain() {
            cancel.send_replace(true);
        }

        let pending: Vec<_> = std::mem::take(&mut *lock(&self.unacked))
            .into_values()
            .collect();
        // Front-insert in reverse so the original delivery order is kept.
        for unacked in pending.into_iter().rev() {
            let mut message = unacked.message;
            message.redelivered = true;
            unacked.queue.push_front(message);
        }
    }

    fn settle(&self, tag: u64, requeue: Option<bool>) -> Result<()> {
        self.ensure_open()?;

        let unacked = lock(&self.unacked).remove(&tag).ok_or_else(|| {
            BrokerError::Channel(format!("PRECONDITION_FAILED - unknown delivery tag {}", tag))
        })?;

        if requeue == Some(true) {
            let mut message = unacked.message;
            message.redelivered = true;
            unacked.queue.push_front(message);
        }
        Ok(())
    }

    /// Wait for the next message for one consumer. `None` once the channel
    /// closes or the consumer is cancelled.
    async fn next_delivery(
        self: &Arc<Self>,
        queue: &Arc<MemoryQueue>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<RawDelivery> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() || *cancel.borrow() {
            return None;
        }

        let semaphore = lock(&self.prefetch).clone();
        let permit = match semaphore {
            Some(semaphore) => tokio::select! {
                permit = semaphore.acquire_owned() => Some(permit.ok()?),
                _ = flag_raised(&mut closed) => return None,
                _ = flag_raised(cancel) => return None,
            },
            None => None,
        };

        let message = loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.is_open() || *cancel.borrow() {
                return None;
            }
            if let Some(message) = queue.pop() {
                break message;
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = flag_raised(&mut closed) => return None,
                _ = flag_raised(cancel) => return None,
            }
        };

        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        {
            let mut unacked = lock(&self.unacked);
            if !self.is_open() {
                drop(unacked);
                let mut message = message;
                message.redelivered = true;
                queue.push_front(message);
                return None;
            }
            unacked.insert(
                tag,
                Unacked {
                    queue: queue.clone(),
                    message: message.clone(),
                    _permit: permit,
                },
            );
        }

        Some(RawDelivery {
            payload: message.payload,
            headers: message.headers,
            redelivered: message.redelivered,
            acker: Box::new(MemoryAcker {
                core: self.clone(),
                tag,
            }),
        })
    }
}

struct MemoryAcker {
    core: Arc<ChannelCore>,
    tag: u64,
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.core.settle(self.tag, None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.core.settle(self.tag, Some(requeue))
    }
}

/// Channel on the in-process broker.
pub struct MemoryChannel {
    core: Arc<ChannelCore>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    async fn declare_queue(&self, queue: &QueueConfig) -> Result<()> {
        self.core.ensure_open()?;
        lock(&self.core.broker.queues)
            .entry(queue.name.clone())
            .or_default();
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str, _durable: bool) -> Result<()> {
        self.core.ensure_open()?;
        lock(&self.core.broker.exchanges)
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.core.ensure_open()?;
        if self.core.broker.queue(queue).is_none() {
            return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{}'", queue)));
        }

        let mut exchanges = lock(&self.core.broker.exchanges);
        let bindings = exchanges.get_mut(exchange).ok_or_else(|| {
            BrokerError::Channel(format!("NOT_FOUND - no exchange '{}'", exchange))
        })?;
        let bound = bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|name| name == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.core.ensure_open()?;
        let semaphore = (count > 0).then(|| Arc::new(Semaphore::new(usize::from(count))));
        *lock(&self.core.prefetch) = semaphore;
        Ok(())
    }

    async fn publish(&self, message: OutboundMessage) -> Result<Confirmation> {
        self.core.ensure_open()?;

        let targets = self
            .core
            .broker
            .route(&message.exchange, &message.routing_key)?;

        if targets.is_empty() {
            if message.mandatory {
                return Ok(Confirmation::Returned {
                    reply_code: NO_ROUTE,
                    reply_text: "NO_ROUTE".to_string(),
                });
            }
            return Ok(Confirmation::Ack);
        }

        for queue in targets {
            queue.push_back(StoredMessage {
                payload: message.payload.clone(),
                headers: message.headers.clone(),
                redelivered: false,
            });
        }
        Ok(Confirmation::Ack)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        self.core.ensure_open()?;

        let target = self
            .core
            .broker
            .queue(queue)
            .ok_or_else(|| BrokerError::Subscribe(format!("NOT_FOUND - no queue '{}'", queue)))?;

        let (cancel, cancel_rx) = watch::channel(false);
        {
            let mut consumers = lock(&self.core.consumers);
            if consumers.contains_key(consumer_tag) {
                return Err(BrokerError::Subscribe(format!(
                    "NOT_ALLOWED - consumer tag '{}' already in use",
                    consumer_tag
                )));
            }
            consumers.insert(consumer_tag.to_string(), cancel);
        }

        let core = self.core.clone();
        let deliveries = stream::unfold(
            (core, target, cancel_rx),
            |(core, target, mut cancel)| async move {
                let delivery = core.next_delivery(&target, &mut cancel).await?;
                Some((Ok(delivery), (core, target, cancel)))
            },
        );

        Ok(Box::pin(deliveries))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        if let Some(cancel) = lock(&self.core.consumers).remove(consumer_tag) {
            cancel.send_replace(true);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.core.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn channel(broker: &MemoryBroker) -> (Arc<dyn Link>, Arc<dyn Channel>) {
        let link = broker.connect("memory://test").await.unwrap();
        let channel = link.open_channel().await.unwrap();
        (link, channel)
    }

    fn message(exchange: &str, routing_key: &str, body: &[u8]) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: body.to_vec(),
            headers: BTreeMap::new(),
            message_id: None,
            persistent: true,
            mandatory: true,
        }
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let (_link, channel) = channel(&broker).await;
        channel
            .declare_queue(&QueueConfig::new("score.submitted"))
            .await
            .unwrap();

        let confirmation = channel
            .publish(message("", "score.submitted", b"{}"))
            .await
            .unwrap();

        assert_eq!(confirmation, Confirmation::Ack);
        assert_eq!(broker.queue_depth("score.submitted"), 1);
    }

    #[tokio::test]
    async fn test_mandatory_without_route_is_returned() {
        let broker = MemoryBroker::new();
        let (_link, channel) = channel(&broker).await;
        channel.declare_exchange("photo.events", true).await.unwrap();

        let confirmation = channel
            .publish(message("photo.events", "competition.created", b"{}"))
            .await
            .unwrap();

        assert!(matches!(
            confirmation,
            Confirmation::Returned { reply_code: 312, .. }
        ));
    }

    #[tokio::test]
    async fn test_undeclared_exchange_is_error() {
        let broker = MemoryBroker::new();
        let (_link, channel) = channel(&broker).await;

        let result = channel
            .publish(message("missing", "competition.created", b"{}"))
            .await;
        assert!(matches!(result, Err(BrokerError::Channel(_))));
    }

    #[tokio::test]
    async fn test_closed_channel_requeues_unacked() {
        let broker = MemoryBroker::new();
        let (link, channel) = channel(&broker).await;
        channel.declare_queue(&QueueConfig::new("q")).await.unwrap();
        broker.inject("q", b"1").unwrap();
        broker.inject("q", b"2").unwrap();

        let mut deliveries = channel.consume("q", "q").await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(second.payload, b"2");
        assert_eq!(broker.queue_depth("q"), 0);

        channel.close().await.unwrap();
        assert!(deliveries.next().await.is_none());
        assert!(first.acker.ack().await.is_err());

        let replacement = link.open_channel().await.unwrap();
        let mut deliveries = replacement.consume("q", "q").await.unwrap();
        let again = deliveries.next().await.unwrap().unwrap();
        assert_eq!(again.payload, b"1");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_drop_connections_kills_channels() {
        let broker = MemoryBroker::new();
        let (link, channel) = channel(&broker).await;

        broker.drop_connections();

        assert!(!link.is_connected());
        assert!(!channel.is_open());
        assert!(matches!(link.closed().await, BrokerError::Connection(_)));
        assert!(channel
            .declare_queue(&QueueConfig::new("q"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(true);
        assert!(broker.connect("memory://test").await.is_err());

        broker.refuse_connections(false);
        assert!(broker.connect("memory://test").await.is_ok());
        assert_eq!(broker.connection_count(), 1);
    }
}
