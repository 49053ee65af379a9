//! Retry utilities: reconnect strategies and backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter. The broker connection
//! manager takes its reconnect delays from a [`ReconnectStrategy`]; consumers
//! re-subscribing after a reconnect use [`resubscribe_backoff`].

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;

/// Default fixed reconnect delay.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 5000;

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

/// Delay policy between broker reconnect attempts.
///
/// `Fixed` retries forever with the same delay. `Exponential` doubles the
/// delay up to a cap and may give up after `max_attempts` failed connects in
/// a row. A connection that comes up resets the count.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum ReconnectStrategy {
    Fixed {
        #[serde(default = "default_reconnect_delay_ms")]
        delay_ms: u64,
    },
    Exponential {
        #[serde(default = "default_min_delay_ms")]
        min_delay_ms: u64,
        #[serde(default = "default_max_delay_ms")]
        max_delay_ms: u64,
        /// Give up once this many connect attempts in a row have failed.
        /// Unbounded when absent.
        #[serde(default)]
        max_attempts: Option<u32>,
        #[serde(default = "default_jitter")]
        jitter: bool,
    },
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::Fixed {
            delay_ms: DEFAULT_RECONNECT_DELAY_MS,
        }
    }
}

impl ReconnectStrategy {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: delay.as_millis() as u64,
        }
    }

    /// Capped exponential backoff with jitter, unbounded attempts.
    pub fn exponential(min_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            min_delay_ms: min_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            max_attempts: None,
            jitter: true,
        }
    }

    /// Consecutive failed connects after which reconnecting is abandoned.
    pub fn max_attempts(&self) -> Option<u32> {
        match *self {
            Self::Fixed { .. } => None,
            Self::Exponential { max_attempts, .. } => max_attempts,
        }
    }

    /// Fresh, endless sequence of delays. The attempt limit is
    /// [`max_attempts`](Self::max_attempts).
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match *self {
            Self::Fixed { delay_ms } => {
                Box::new(std::iter::repeat(Duration::from_millis(delay_ms)))
            }
            Self::Exponential {
                min_delay_ms,
                max_delay_ms,
                jitter,
                ..
            } => {
                let mut builder = ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(min_delay_ms))
                    .with_max_delay(Duration::from_millis(max_delay_ms))
                    .without_max_times();
                if jitter {
                    builder = builder.with_jitter();
                }
                Box::new(builder.build())
            }
        }
    }
}

/// Backoff for re-creating a consumer after its channel died.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Unbounded attempts
/// - Jitter enabled
pub fn resubscribe_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .without_max_times()
        .with_jitter()
}
