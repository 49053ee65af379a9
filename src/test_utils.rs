//! Test utilities.
//!
//! Helpers for building connection managers and gateways against in-process
//! doubles, without a broker container or real downstream services.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::broker::{ConnectionEvent, ConnectionManager, MemoryBroker};
use crate::config::{BrokerConfig, BrokerTransport};
use crate::utils::retry::ReconnectStrategy;

/// Reconnect delay used by test managers.
pub const TEST_RECONNECT_DELAY: Duration = Duration::from_millis(20);

/// Broker config pointing at an in-memory broker with a short fixed reconnect delay.
pub fn memory_config() -> BrokerConfig {
    BrokerConfig {
        transport: BrokerTransport::Memory,
        url: "memory://test".to_string(),
        reconnect: ReconnectStrategy::fixed(TEST_RECONNECT_DELAY),
    }
}

/// Connected manager on the given in-memory broker.
pub async fn memory_manager(broker: &MemoryBroker) -> ConnectionManager {
    ConnectionManager::connect(Arc::new(broker.clone()), &memory_config())
        .await
        .expect("in-memory broker accepts connections")
}

/// Wait (bounded) for the first event matching `predicate`.
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    mut predicate: F,
) -> ConnectionEvent
where
    F: FnMut(&ConnectionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("connection event stream closed")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for connection event")
}
