//! Broker connection manager.
//!
//! Owns exactly one live connection at a time and every channel opened on it.
//! A background supervisor opens the connection, watches it, and when it drops
//! schedules a reconnect according to the configured [`ReconnectStrategy`].
//! Each successful (re)connect bumps the connection generation; channels from
//! an older generation are dead and must be recreated by their owners.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::{flag_raised, BrokerError, Channel, Connector, Link, Result};
use crate::config::BrokerConfig;
use crate::utils::retry::ReconnectStrategy;

/// Capacity of the connection event stream.
const EVENT_CAPACITY: usize = 64;

/// Lifecycle events emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection is live. `generation` starts at 1 and increases per reconnect.
    Connected { generation: u64 },
    /// The live connection dropped unexpectedly.
    Disconnected { generation: u64, reason: String },
    /// A connect attempt failed; another is scheduled.
    ConnectFailed { attempt: u32, reason: String },
    /// The reconnect strategy ran out of attempts. Terminal.
    Abandoned { attempts: u32 },
    /// `close_all` was called. Terminal.
    Closed,
}

#[derive(Clone)]
struct LiveLink {
    generation: u64,
    link: Arc<dyn Link>,
}

struct Inner {
    url: String,
    reconnect: ReconnectStrategy,
    connector: Arc<dyn Connector>,
    /// Current connection; `None` while (re)connecting.
    link: watch::Sender<Option<LiveLink>>,
    /// Raised once by `close_all` or when reconnecting is abandoned.
    shutdown: watch::Sender<bool>,
    channels: Mutex<HashMap<u64, Arc<dyn Channel>>>,
    next_channel: AtomicU64,
    events: broadcast::Sender<ConnectionEvent>,
}

impl Inner {
    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn forget_channels(&self) -> Vec<Arc<dyn Channel>> {
        match self.channels.lock() {
            Ok(mut channels) => channels.drain().map(|(_, channel)| channel).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .drain()
                .map(|(_, channel)| channel)
                .collect(),
        }
    }
}

/// A channel handed out by the manager.
///
/// Dereferences to the underlying [`Channel`]. Remembers the connection
/// generation it was opened on.
#[derive(Clone)]
pub struct ManagedChannel {
    key: u64,
    generation: u64,
    channel: Arc<dyn Channel>,
}

impl ManagedChannel {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Deref for ManagedChannel {
    type Target = dyn Channel;

    fn deref(&self) -> &Self::Target {
        self.channel.as_ref()
    }
}

impl std::fmt::Debug for ManagedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedChannel")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

/// Supervised broker connection shared by producers and consumers.
///
/// Cloning is cheap; clones share the same connection and channel set.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Start supervising a connection without waiting for it.
    ///
    /// Channel requests issued before the first connect completes wait for it.
    pub fn start(connector: Arc<dyn Connector>, config: &BrokerConfig) -> Self {
        let (link, _) = watch::channel(None);
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            url: config.url.clone(),
            reconnect: config.reconnect.clone(),
            connector,
            link,
            shutdown,
            channels: Mutex::new(HashMap::new()),
            next_channel: AtomicU64::new(1),
            events,
        });

        tokio::spawn(supervise(inner.clone()));

        Self { inner }
    }

    /// Start supervising and wait for the first connection.
    ///
    /// Connect failures are retried per the reconnect strategy; this only
    /// fails if the strategy gives up.
    pub async fn connect(connector: Arc<dyn Connector>, config: &BrokerConfig) -> Result<Self> {
        let manager = Self::start(connector, config);
        manager.wait_connected().await?;
        Ok(manager)
    }

    /// Wait until a live connection exists.
    pub async fn wait_connected(&self) -> Result<()> {
        self.live_link().await.map(|_| ())
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .link
            .borrow()
            .as_ref()
            .is_some_and(|live| live.link.is_connected())
    }

    /// Generation of the live connection, if any.
    pub fn generation(&self) -> Option<u64> {
        self.inner.link.borrow().as_ref().map(|live| live.generation)
    }

    /// True once `close_all` ran or reconnecting was abandoned.
    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Observe connection lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Open a confirm-mode channel on the live connection, waiting for one if needed.
    pub async fn create_channel(&self) -> Result<ManagedChannel> {
        let live = self.live_link().await?;
        let channel = live.link.open_channel().await?;
        let key = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);

        {
            let mut channels = self
                .inner
                .channels
                .lock()
                .map_err(|_| BrokerError::Channel("channel registry poisoned".to_string()))?;
            channels.retain(|_, tracked| tracked.is_open());
            channels.insert(key, channel.clone());
        }

        debug!(
            channel = key,
            generation = live.generation,
            "Opened managed channel"
        );

        Ok(ManagedChannel {
            key,
            generation: live.generation,
            channel,
        })
    }

    /// Stop tracking a channel and close it.
    pub async fn release(&self, channel: &ManagedChannel) -> Result<()> {
        let tracked = self
            .inner
            .channels
            .lock()
            .map_err(|_| BrokerError::Channel("channel registry poisoned".to_string()))?
            .remove(&channel.key);

        if tracked.is_some() && channel.is_open() {
            channel.close().await?;
        }

        debug!(channel = channel.key, "Released managed channel");
        Ok(())
    }

    /// Number of tracked channels that are still open.
    pub fn open_channels(&self) -> usize {
        self.inner
            .channels
            .lock()
            .map(|mut channels| {
                channels.retain(|_, tracked| tracked.is_open());
                channels.len()
            })
            .unwrap_or(0)
    }

    /// Close every tracked channel, then the connection. Terminal: no
    /// reconnects happen afterwards and new channel requests fail with
    /// [`BrokerError::Closed`].
    pub async fn close_all(&self) -> Result<()> {
        if self.inner.shutdown.send_replace(true) {
            return Ok(());
        }

        for channel in self.inner.forget_channels() {
            if channel.is_open() {
                if let Err(e) = channel.close().await {
                    warn!(error = %e, "Failed to close channel during shutdown");
                }
            }
        }

        let result = match self.inner.link.send_replace(None) {
            Some(live) if live.link.is_connected() => live.link.close().await,
            _ => Ok(()),
        };

        info!(url = %self.inner.url, "Broker connection manager closed");
        self.inner.emit(ConnectionEvent::Closed);

        result
    }

    async fn live_link(&self) -> Result<LiveLink> {
        let mut link_rx = self.inner.link.subscribe();
        let mut shutdown_rx = self.inner.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return Err(BrokerError::Closed);
            }

            let current = link_rx.borrow_and_update().clone();
            if let Some(live) = current {
                if live.link.is_connected() {
                    return Ok(live);
                }
            }

            tokio::select! {
                changed = link_rx.changed() => {
                    if changed.is_err() {
                        return Err(BrokerError::Closed);
                    }
                }
                _ = flag_raised(&mut shutdown_rx) => {}
            }
        }
    }
}

/// Connect, watch, and reconnect until shut down or the strategy gives up.
async fn supervise(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let max_attempts = inner.reconnect.max_attempts();
    let mut delays = inner.reconnect.delays();
    let mut failed_attempts: u32 = 0;
    let mut generation: u64 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match inner.connector.connect(&inner.url).await {
            Ok(link) => {
                generation += 1;
                let live = LiveLink {
                    generation,
                    link: link.clone(),
                };

                // Checked under the link lock so close_all never misses a published link.
                let published = inner.link.send_if_modified(|current| {
                    if *inner.shutdown.borrow() {
                        return false;
                    }
                    *current = Some(live);
                    true
                });
                if !published {
                    let _ = link.close().await;
                    break;
                }

                failed_attempts = 0;
                delays = inner.reconnect.delays();
                info!(url = %inner.url, generation, "Connected to broker");
                inner.emit(ConnectionEvent::Connected { generation });

                let reason = tokio::select! {
                    biased;
                    _ = flag_raised(&mut shutdown) => break,
                    reason = link.closed() => reason,
                };

                inner.link.send_replace(None);
                // Channels die with their connection.
                inner.forget_channels();

                warn!(
                    url = %inner.url,
                    generation,
                    error = %reason,
                    "Broker connection lost, scheduling reconnect"
                );
                inner.emit(ConnectionEvent::Disconnected {
                    generation,
                    reason: reason.to_string(),
                });
            }
            Err(e) => {
                failed_attempts += 1;
                error!(
                    url = %inner.url,
                    attempt = failed_attempts,
                    error = %e,
                    "Failed to connect to broker"
                );
                inner.emit(ConnectionEvent::ConnectFailed {
                    attempt: failed_attempts,
                    reason: e.to_string(),
                });
            }
        }

        let exhausted = max_attempts.is_some_and(|max| failed_attempts >= max);
        let delay = match delays.next() {
            Some(delay) if !exhausted => delay,
            _ => {
                error!(
                    url = %inner.url,
                    attempts = failed_attempts,
                    "Reconnect attempts exhausted, giving up on broker"
                );
                inner.shutdown.send_replace(true);
                inner.emit(ConnectionEvent::Abandoned {
                    attempts: failed_attempts,
                });
                break;
            }
        };

        debug!(delay_ms = %delay.as_millis(), "Waiting before reconnect");
        tokio::select! {
            biased;
            _ = flag_raised(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!(url = %inner.url, "Broker supervisor stopped");
}
