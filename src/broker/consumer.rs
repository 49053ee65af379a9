//! Prefetch-bounded consumer with manual acknowledgment.
//!
//! The broker withholds deliveries once `prefetch` messages are unacknowledged,
//! so a slow handler throttles intake. Each delivery is decoded and handed to
//! the handler on its own task; handlers run concurrently up to the prefetch
//! limit.
//!
//! Settlement is the handler's job. The consumer only steps in when the
//! handler fails (error or panic): it nacks with the queue's
//! `requeue_on_error`. Malformed envelopes are nacked without requeue and
//! never reach the handler.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use futures::future::BoxFuture;
use futures::{Future, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::envelope::Envelope;
use super::manager::{ConnectionManager, ManagedChannel};
use super::{flag_raised, Acker, BrokerError, DeliveryStream, QueueConfig, RawDelivery, Result};
use crate::utils::retry::resubscribe_backoff;

/// Error type handlers report failure with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Processes deliveries from one queue.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    fn handle(
        &self,
        delivery: Delivery,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        Box::pin((self)(delivery))
    }
}

struct Settlement {
    acker: Box<dyn Acker>,
    settled: AtomicBool,
}

impl Settlement {
    fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    async fn settle(&self, requeue: Option<bool>) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Channel("delivery already settled".to_string()));
        }
        match requeue {
            None => self.acker.ack().await,
            Some(requeue) => self.acker.nack(requeue).await,
        }
    }
}

/// A decoded delivery awaiting the handler's verdict.
pub struct Delivery {
    envelope: Envelope,
    redelivered: bool,
    settlement: Arc<Settlement>,
}

impl Delivery {
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Deserialize the payload into a business type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        self.envelope.payload_as()
    }

    /// True if the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(&self) -> Result<()> {
        self.settlement.settle(None).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.settlement.settle(Some(requeue)).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.settlement.is_settled())
            .finish()
    }
}

/// An active subscription on one channel.
///
/// Dies with its channel: after a reconnect it stops receiving and must be
/// recreated (or use [`Consumer::subscribe_resilient`]).
pub struct Consumer {
    manager: ConnectionManager,
    queue: QueueConfig,
    channel: ManagedChannel,
    stop: watch::Sender<bool>,
    done: watch::Receiver<bool>,
    task: JoinHandle<()>,
}

impl Consumer {
    /// Declare the queue, apply prefetch, and start consuming.
    pub async fn subscribe<H>(
        manager: &ConnectionManager,
        queue: QueueConfig,
        handler: H,
    ) -> Result<Self>
    where
        H: MessageHandler,
    {
        Self::subscribe_shared(manager, queue, Arc::new(handler)).await
    }

    /// Keep a subscription alive across reconnects, re-subscribing on a fresh
    /// channel whenever the current one dies.
    pub fn subscribe_resilient<H>(
        manager: &ConnectionManager,
        queue: QueueConfig,
        handler: H,
    ) -> ResilientConsumer
    where
        H: MessageHandler,
    {
        ResilientConsumer::spawn(manager.clone(), queue, Arc::new(handler))
    }

    async fn subscribe_shared(
        manager: &ConnectionManager,
        queue: QueueConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let channel = manager.create_channel().await?;

        let deliveries = match Self::open_stream(&channel, &queue).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                let _ = manager.release(&channel).await;
                return Err(e);
            }
        };

        info!(
            queue = %queue.name,
            prefetch = queue.prefetch,
            generation = channel.generation(),
            "Consumer subscribed"
        );

        let (stop, stop_rx) = watch::channel(false);
        let (done_tx, done) = watch::channel(false);
        let task = tokio::spawn(consume_loop(
            deliveries,
            handler,
            queue.clone(),
            stop_rx,
            done_tx,
        ));

        Ok(Self {
            manager: manager.clone(),
            queue,
            channel,
            stop,
            done,
            task,
        })
    }

    async fn open_stream(channel: &ManagedChannel, queue: &QueueConfig) -> Result<DeliveryStream> {
        channel.declare_queue(queue).await?;
        if let Some(exchange) = &queue.exchange {
            channel.declare_exchange(exchange, queue.durable).await?;
            channel.bind_queue(&queue.name, exchange, &queue.name).await?;
        }
        channel.set_prefetch(queue.prefetch).await?;
        // Consumer tag is the queue name.
        channel.consume(&queue.name, &queue.name).await
    }

    pub fn queue(&self) -> &QueueConfig {
        &self.queue
    }

    /// Connection generation this consumer's channel belongs to.
    pub fn generation(&self) -> u64 {
        self.channel.generation()
    }

    /// True while deliveries are still being received.
    pub fn is_active(&self) -> bool {
        !*self.done.borrow()
    }

    /// Resolves once the consume loop has ended (channel lost or stopped).
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        flag_raised(&mut done).await;
    }

    /// Detach from the queue and release the channel.
    ///
    /// Handlers still running may fail to settle; their messages are returned
    /// to the queue by the broker.
    pub async fn stop(self) -> Result<()> {
        self.stop.send_replace(true);

        if self.channel.is_open() {
            if let Err(e) = self.channel.cancel(&self.queue.name).await {
                debug!(queue = %self.queue.name, error = %e, "Consumer cancel failed");
            }
        }

        if let Err(e) = self.task.await {
            warn!(queue = %self.queue.name, error = %e, "Consume loop ended abnormally");
        }

        info!(queue = %self.queue.name, "Consumer stopped");
        self.manager.release(&self.channel).await
    }
}

async fn consume_loop(
    mut deliveries: DeliveryStream,
    handler: Arc<dyn MessageHandler>,
    queue: QueueConfig,
    mut stop: watch::Receiver<bool>,
    done: watch::Sender<bool>,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = flag_raised(&mut stop) => break,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(raw)) => {
                tokio::spawn(process_delivery(raw, handler.clone(), queue.clone()));
            }
            Some(Err(e)) => {
                error!(queue = %queue.name, error = %e, "Consumer delivery error");
                break;
            }
            None => {
                warn!(queue = %queue.name, "Consumer stream ended");
                break;
            }
        }
    }

    done.send_replace(true);
}

async fn process_delivery(raw: RawDelivery, handler: Arc<dyn MessageHandler>, queue: QueueConfig) {
    let envelope = match Envelope::decode(&raw.payload, raw.headers) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(queue = %queue.name, error = %e, "Rejecting malformed message");
            if let Err(e) = raw.acker.nack(false).await {
                error!(queue = %queue.name, error = %e, "Failed to reject malformed message");
            }
            return;
        }
    };

    let settlement = Arc::new(Settlement {
        acker: raw.acker,
        settled: AtomicBool::new(false),
    });
    let delivery = Delivery {
        envelope,
        redelivered: raw.redelivered,
        settlement: settlement.clone(),
    };

    // Separate task so a panicking handler surfaces as a JoinError here.
    let failure = match tokio::spawn(handler.handle(delivery)).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(join_error) => Some(format!("handler panicked: {}", join_error)),
    };

    match failure {
        None if !settlement.is_settled() => {
            warn!(
                queue = %queue.name,
                "Handler returned without ack or nack; message stays unacknowledged"
            );
        }
        None => {}
        Some(reason) => {
            error!(
                queue = %queue.name,
                error = %reason,
                requeue = queue.requeue_on_error,
                "Message handler failed"
            );
            if !settlement.is_settled() {
                if let Err(e) = settlement.settle(Some(queue.requeue_on_error)).await {
                    error!(queue = %queue.name, error = %e, "Failed to nack message");
                }
            }
        }
    }
}

/// A subscription that survives reconnects.
///
/// Runs until stopped or until the connection manager is closed.
pub struct ResilientConsumer {
    queue: String,
    stop: watch::Sender<bool>,
    subscriptions: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ResilientConsumer {
    fn spawn(
        manager: ConnectionManager,
        queue: QueueConfig,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (stop, stop_rx) = watch::channel(false);
        let subscriptions = Arc::new(AtomicU64::new(0));
        let name = queue.name.clone();
        let task = tokio::spawn(resubscribe_loop(
            manager,
            queue,
            handler,
            stop_rx,
            subscriptions.clone(),
        ));

        Self {
            queue: name,
            stop,
            subscriptions,
            task,
        }
    }

    /// How many times a subscription was established.
    pub fn subscriptions(&self) -> u64 {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// True until stopped or the connection manager closed.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            warn!(queue = %self.queue, error = %e, "Resilient consumer ended abnormally");
        }
    }
}

async fn resubscribe_loop(
    manager: ConnectionManager,
    queue: QueueConfig,
    handler: Arc<dyn MessageHandler>,
    mut stop: watch::Receiver<bool>,
    subscriptions: Arc<AtomicU64>,
) {
    let builder = resubscribe_backoff();
    let mut backoff = builder.build();

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = flag_raised(&mut stop) => break,
            subscribed = Consumer::subscribe_shared(&manager, queue.clone(), handler.clone()) => {
                subscribed
            }
        };

        match subscribed {
            Ok(consumer) => {
                subscriptions.fetch_add(1, Ordering::SeqCst);
                backoff = builder.build();

                let stopped = tokio::select! {
                    biased;
                    _ = flag_raised(&mut stop) => true,
                    _ = consumer.finished() => false,
                };

                if let Err(e) = consumer.stop().await {
                    debug!(
                        queue = %queue.name,
                        error = %e,
                        "Releasing dead consumer channel failed"
                    );
                }
                if stopped {
                    break;
                }
                warn!(queue = %queue.name, "Consumer channel lost, resubscribing");
            }
            Err(BrokerError::Closed) => {
                info!(queue = %queue.name, "Connection manager closed, resilient consumer exiting");
                break;
            }
            Err(e) => {
                let delay = backoff.next().unwrap_or(Duration::from_secs(30));
                error!(
                    queue = %queue.name,
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    "Failed to subscribe, retrying after backoff"
                );
                tokio::select! {
                    biased;
                    _ = flag_raised(&mut stop) => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
