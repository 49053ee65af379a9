//! Circuit breaker.
//!
//! Wraps an async call with a per-call timeout, failure-rate tracking over a
//! rolling window, and a three-state protection model:
//!
//! - `Closed`: calls pass through; outcomes are counted.
//! - `Open`: calls are rejected without invoking the operation.
//! - `HalfOpen`: after the reset timeout, a bounded number of trial calls go
//!   through. A trial success closes the circuit, a trial failure reopens it.
//!
//! Opening arms a reset timer, so the move to `HalfOpen` is announced when
//! the timeout elapses even if no call arrives. Reads and calls also apply it,
//! should they observe the deadline first.
//!
//! State transitions and failures are published on a broadcast stream and
//! logged. One breaker guards one downstream service.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capacity of the breaker event stream.
const EVENT_CAPACITY: usize = 128;

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_error_threshold_percentage() -> u32 {
    50
}

fn default_reset_timeout_ms() -> u64 {
    30_000
}

fn default_rolling_count_timeout_ms() -> u64 {
    10_000
}

fn default_volume_threshold() -> u32 {
    10
}

fn default_half_open_max_calls() -> u32 {
    1
}

/// Breaker options.
///
/// When deserialized, the timeout, error threshold and reset timeout must be
/// present. [`Default`] fills them for programmatic use.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BreakerConfig {
    /// Per-call timeout. Exceeding it counts as a failure.
    pub timeout_ms: u64,
    /// Failure percentage (of calls in the window) that opens the circuit.
    pub error_threshold_percentage: u32,
    /// Time spent open before trial calls are allowed.
    pub reset_timeout_ms: u64,
    /// Length of the counting window.
    #[serde(default = "default_rolling_count_timeout_ms")]
    pub rolling_count_timeout_ms: u64,
    /// Minimum calls in the window before the threshold applies.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: u32,
    /// Concurrent trial calls allowed while half-open.
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            error_threshold_percentage: default_error_threshold_percentage(),
            reset_timeout_ms: default_reset_timeout_ms(),
            rolling_count_timeout_ms: default_rolling_count_timeout_ms(),
            volume_threshold: default_volume_threshold(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn rolling_window(&self) -> Duration {
        Duration::from_millis(self.rolling_count_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// How a call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The operation returned an error.
    Error,
    /// The operation did not finish within the call timeout.
    Timeout,
}

/// Monitoring events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerEvent {
    StateChanged {
        service: String,
        from: CircuitState,
        to: CircuitState,
    },
    Failure {
        service: String,
        kind: FailureKind,
        message: String,
    },
    /// A call was rejected without invoking the operation.
    Rejected { service: String },
}

/// Errors returned by [`CircuitBreaker::fire`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("Circuit open for '{service}'")]
    Open { service: String },

    #[error("Call to '{service}' timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    #[error("{0}")]
    Failure(E),
}

impl<E> BreakerError<E> {
    /// Open or timed out: the service should be reported unavailable.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Open { .. } | Self::Timeout { .. })
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failures: u32,
    pub total: u32,
    pub window_start: Instant,
    pub opened_at: Option<Instant>,
}

#[derive(Debug)]
struct Counters {
    state: CircuitState,
    failures: u32,
    total: u32,
    window_start: Instant,
    opened_at: Option<Instant>,
    trials_in_flight: u32,
}

impl Counters {
    fn reset_window(&mut self, now: Instant) {
        self.failures = 0;
        self.total = 0;
        self.window_start = now;
    }
}

/// State shared with the reset timer.
struct Core {
    name: String,
    counters: Mutex<Counters>,
    events: broadcast::Sender<BreakerEvent>,
}

impl Core {
    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: BreakerEvent) {
        let _ = self.events.send(event);
    }

    fn transition(&self, counters: &mut Counters, to: CircuitState) {
        let from = counters.state;
        if from == to {
            return;
        }
        counters.state = to;

        match to {
            CircuitState::Open => {
                warn!(service = %self.name, %from, "Circuit OPEN")
            }
            CircuitState::HalfOpen => {
                info!(service = %self.name, %from, "Circuit HALF-OPEN")
            }
            CircuitState::Closed => {
                info!(service = %self.name, %from, "Circuit CLOSED")
            }
        }

        self.emit(BreakerEvent::StateChanged {
            service: self.name.clone(),
            from,
            to,
        });
    }

    fn half_open(&self, counters: &mut Counters) {
        if counters.state == CircuitState::Open {
            counters.trials_in_flight = 0;
            self.transition(counters, CircuitState::HalfOpen);
        }
    }
}

/// Wait out the reset timeout of the opening at `opened`, then allow trials.
/// A later re-open has its own timer; this one then does nothing.
async fn reset_after(core: Weak<Core>, opened: Instant, at: Instant) {
    tokio::time::sleep_until(at).await;
    let Some(core) = core.upgrade() else {
        return;
    };
    let mut counters = core.lock();
    if counters.opened_at == Some(opened) {
        core.half_open(&mut counters);
    }
}

/// Admission ticket for one call. Releases a half-open trial slot if the
/// call is dropped before it settles.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, failure: Option<(FailureKind, String)>) {
        self.settled = true;
        self.breaker.record(self.trial, failure);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut counters = self.breaker.core.lock();
            counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
        }
    }
}

/// Circuit breaker for one downstream service.
pub struct CircuitBreaker {
    config: BreakerConfig,
    core: Arc<Core>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            config,
            core: Arc::new(Core {
                name: name.into(),
                counters: Mutex::new(Counters {
                    state: CircuitState::Closed,
                    failures: 0,
                    total: 0,
                    window_start: Instant::now(),
                    opened_at: None,
                    trials_in_flight: 0,
                }),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state. An open circuit whose reset timeout elapsed reports `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        let mut counters = self.lock();
        self.advance(&mut counters, Instant::now());
        counters.state
    }

    pub fn stats(&self) -> BreakerStats {
        let mut counters = self.lock();
        self.advance(&mut counters, Instant::now());
        BreakerStats {
            state: counters.state,
            failures: counters.failures,
            total: counters.total,
            window_start: counters.window_start,
            opened_at: counters.opened_at,
        }
    }

    /// Observe transitions, failures and rejections.
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.core.events.subscribe()
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected with [`BreakerError::Open`] without calling `op` while open.
    /// A call exceeding the timeout is abandoned and reported as
    /// [`BreakerError::Timeout`].
    pub async fn fire<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let admission = self.admit().ok_or_else(|| BreakerError::Open {
            service: self.core.name.clone(),
        })?;

        let after = self.config.timeout();
        match tokio::time::timeout(after, op()).await {
            Ok(Ok(value)) => {
                admission.settle(None);
                Ok(value)
            }
            Ok(Err(e)) => {
                admission.settle(Some((FailureKind::Error, e.to_string())));
                Err(BreakerError::Failure(e))
            }
            Err(_) => {
                admission.settle(Some((
                    FailureKind::Timeout,
                    format!("timed out after {}ms", after.as_millis()),
                )));
                Err(BreakerError::Timeout {
                    service: self.core.name.clone(),
                    after,
                })
            }
        }
    }

    /// Like [`fire`](Self::fire), but any error is handed to `fallback`.
    pub async fn fire_with_fallback<F, Fut, T, E, Fb>(&self, op: F, fallback: Fb) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        Fb: FnOnce(BreakerError<E>) -> T,
    {
        match self.fire(op).await {
            Ok(value) => value,
            Err(e) => fallback(e),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.core.lock()
    }

    fn emit(&self, event: BreakerEvent) {
        self.core.emit(event);
    }

    fn transition(&self, counters: &mut Counters, to: CircuitState) {
        self.core.transition(counters, to);
    }

    /// Open the circuit and arm its reset timer.
    fn open(&self, counters: &mut Counters, now: Instant) {
        counters.opened_at = Some(now);
        self.transition(counters, CircuitState::Open);
        let at = now + self.config.reset_timeout();
        tokio::spawn(reset_after(Arc::downgrade(&self.core), now, at));
    }

    /// Apply time-driven changes: window roll-over and open → half-open.
    fn advance(&self, counters: &mut Counters, now: Instant) {
        if counters.state == CircuitState::Open {
            let reopen_at = counters
                .opened_at
                .map(|opened| opened + self.config.reset_timeout());
            if reopen_at.is_some_and(|at| now >= at) {
                self.core.half_open(counters);
            }
        }

        if now.duration_since(counters.window_start) >= self.config.rolling_window() {
            counters.reset_window(now);
        }
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let mut counters = self.lock();
        self.advance(&mut counters, Instant::now());

        let trial = match counters.state {
            CircuitState::Closed => Some(false),
            CircuitState::HalfOpen
                if counters.trials_in_flight < self.config.half_open_max_calls =>
            {
                counters.trials_in_flight += 1;
                Some(true)
            }
            CircuitState::HalfOpen | CircuitState::Open => None,
        };
        drop(counters);

        let Some(trial) = trial else {
            debug!(service = %self.core.name, "Circuit rejected call");
            self.emit(BreakerEvent::Rejected {
                service: self.core.name.clone(),
            });
            return None;
        };

        Some(Admission {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn record(&self, trial: bool, failure: Option<(FailureKind, String)>) {
        let now = Instant::now();
        let mut counters = self.lock();
        self.advance(&mut counters, now);

        if let Some((kind, message)) = &failure {
            warn!(
                service = %self.core.name,
                kind = ?kind,
                error = %message,
                "Circuit breaker call failed"
            );
            self.emit(BreakerEvent::Failure {
                service: self.core.name.clone(),
                kind: *kind,
                message: message.clone(),
            });
        }

        if trial {
            counters.trials_in_flight = counters.trials_in_flight.saturating_sub(1);
            if counters.state != CircuitState::HalfOpen {
                return;
            }
            match failure {
                None => {
                    counters.reset_window(now);
                    counters.opened_at = None;
                    self.transition(&mut counters, CircuitState::Closed);
                }
                Some(_) => self.open(&mut counters, now),
            }
            return;
        }

        // Calls admitted while closed only count while still closed.
        if counters.state != CircuitState::Closed {
            return;
        }

        counters.total += 1;
        if failure.is_none() {
            return;
        }
        counters.failures += 1;

        let enough_volume = counters.total >= self.config.volume_threshold;
        let over_threshold = u64::from(counters.failures) * 100
            >= u64::from(self.config.error_threshold_percentage) * u64::from(counters.total);
        if enough_volume && over_threshold {
            self.open(&mut counters, now);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.core.name)
            .field("state", &self.lock().state)
            .finish()
    }
}
