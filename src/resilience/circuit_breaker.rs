//! Circuit breaker for calls to unreliable dependencies.
//!
//! The breaker fails fast while a dependency is known to be down, which keeps
//! request latency bounded and gives the dependency room to recover.
//!
//! # States
//!
//! ```text
//!  ┌─────────┐   failures ≥ threshold   ┌─────────┐
//!  │ Closed  │ ───────────────────────► │  Open   │ ◄──────────┐
//!  └────▲────┘                          └────┬────┘            │
//!       │                                    │ open_timeout    │ any probe
//!       │ first probe succeeds               ▼ elapsed         │ fails
//!       │                             ┌────────────┐           │
//!       └──────────────────────────── │  HalfOpen  │ ──────────┘
//!                                     │ ≤ N probes │
//!                                     └────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let breaker = CircuitBreaker::new("jwks", CircuitBreakerConfig::jwks());
//!
//! let keys = breaker
//!     .call_with_retry(&RetryPolicy::default(), || fetch_jwks(&client, &url))
//!     .await?;
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::guard::SlotGuard;
use super::retry::RetryPolicy;
use crate::metrics;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls pass through.
    Closed,
    /// Failing fast - all calls are rejected immediately.
    Open,
    /// Testing recovery - a bounded number of probe calls pass through.
    HalfOpen,
}

impl CircuitState {
    /// Numeric value exported by the state gauge.
    fn gauge_value(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }

    fn label(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// How long to stay open before letting probes through.
    pub open_timeout: Duration,
    /// Maximum concurrent trial calls while half-open.
    pub half_open_probe_limit: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            half_open_probe_limit: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, open_timeout: Duration, half_open_probe_limit: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            half_open_probe_limit: half_open_probe_limit.max(1),
        }
    }

    /// Identity provider key endpoint: 5 failures / 60 s.
    pub fn jwks() -> Self {
        Self::new(5, Duration::from_secs(60), 1)
    }

    /// Database probes: 10 failures / 30 s.
    pub fn database() -> Self {
        Self::new(10, Duration::from_secs(30), 2)
    }

    /// Third-party APIs: 3 failures / 120 s.
    pub fn external_api() -> Self {
        Self::new(3, Duration::from_secs(120), 1)
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The call was rejected without invoking the operation.
    #[error("circuit breaker '{breaker}' is open (retry in {remaining:?})")]
    Open { breaker: String, remaining: Duration },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Point-in-time view of a breaker for health output.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_secs_ago: Option<u64>,
    pub open_remaining_ms: Option<u64>,
    pub times_opened: u32,
    pub requests_rejected: u64,
}

struct CircuitBreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }

    /// Time left in the open state, or `None` once `open_timeout` has elapsed.
    fn open_remaining(&self, open_timeout: Duration) -> Option<Duration> {
        self.opened_at
            .map(|at| open_timeout.saturating_sub(at.elapsed()))
            .filter(|remaining| !remaining.is_zero())
    }
}

/// Thread-safe circuit breaker.
///
/// State lives behind an async `RwLock` that is never held across the wrapped
/// operation; half-open probe slots are tracked with an atomic counter so they
/// can be released from `Drop`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: RwLock<CircuitBreakerState>,
    probes_in_flight: AtomicU32,
    times_opened: AtomicU32,
    requests_rejected: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitBreakerState::new()),
            probes_in_flight: AtomicU32::new(0),
            times_opened: AtomicU32::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the breaker.
    ///
    /// While open the operation is not invoked and `BreakerError::Open` is
    /// returned. While half-open at most `half_open_probe_limit` calls run
    /// concurrently; the rest fail fast.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let _probe = self.admit().await.map_err(|remaining| BreakerError::Open {
            breaker: self.name.clone(),
            remaining,
        })?;

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                self.record_failure().await;
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Run `operation` under `policy`, passing every attempt through the breaker.
    ///
    /// Each failed attempt counts towards the failure threshold. Retrying stops
    /// as soon as the breaker opens; the last operation error is returned.
    pub async fn call_with_retry<F, Fut, T, E>(
        &self,
        policy: &RetryPolicy,
        mut operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match self.call(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(BreakerError::Inner(e)) => {
                    if attempt >= policy.max_attempts || self.state().await == CircuitState::Open {
                        return Err(BreakerError::Inner(e));
                    }
                    let delay = policy.delay_for(attempt);
                    debug!(
                        breaker = %self.name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying failed call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(open) => return Err(open),
            }
        }
    }

    /// Decide whether a call may proceed.
    ///
    /// `Ok(Some(_))` carries a half-open probe slot, `Err` the remaining open time.
    async fn admit(&self) -> Result<Option<SlotGuard<'_>>, Duration> {
        // Common case under the read lock
        {
            let state = self.state.read().await;
            match state.state {
                CircuitState::Closed => return Ok(None),
                CircuitState::Open => {
                    if let Some(remaining) = state.open_remaining(self.config.open_timeout) {
                        self.reject();
                        return Err(remaining);
                    }
                }
                CircuitState::HalfOpen => {}
            }
        }

        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => Ok(None),
            CircuitState::Open => {
                // Re-check: another task may have reopened the circuit
                if let Some(remaining) = state.open_remaining(self.config.open_timeout) {
                    self.reject();
                    return Err(remaining);
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                self.take_probe_slot()
            }
            CircuitState::HalfOpen => self.take_probe_slot(),
        }
    }

    fn take_probe_slot(&self) -> Result<Option<SlotGuard<'_>>, Duration> {
        match SlotGuard::acquire(&self.probes_in_flight, self.config.half_open_probe_limit) {
            Some(slot) => Ok(Some(slot)),
            None => {
                debug!(breaker = %self.name, "Half-open probe limit reached");
                self.reject();
                Err(Duration::ZERO)
            }
        }
    }

    fn reject(&self) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_circuit_breaker_rejection(&self.name);
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        match to {
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
                self.times_opened.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_breaker_open(&self.name);
                warn!(
                    breaker = %self.name,
                    %from,
                    failures = state.consecutive_failures,
                    open_timeout = ?self.config.open_timeout,
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, %from, "Circuit breaker half-open, probing");
            }
            CircuitState::Closed => {
                state.opened_at = None;
                state.consecutive_failures = 0;
                info!(breaker = %self.name, %from, "Circuit breaker closed");
            }
        }
        metrics::record_circuit_breaker_transition(&self.name, to.label(), to.gauge_value());
    }

    /// Record a successful operation.
    ///
    /// Resets the failure counter; a success while half-open closes the circuit.
    pub async fn record_success(&self) {
        let mut state = self.state.write().await;
        match state.state {
            CircuitState::Closed => state.consecutive_failures = 0,
            CircuitState::HalfOpen => self.transition(&mut state, CircuitState::Closed),
            CircuitState::Open => {
                // A call admitted before the circuit opened; the open timer stands
                debug!(breaker = %self.name, "Ignoring late success while open");
            }
        }
    }

    /// Record a failed operation.
    ///
    /// Opens the circuit at the failure threshold; any failure while half-open
    /// reopens it and restarts the open timeout.
    pub async fn record_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_at = Some(Instant::now());

        match state.state {
            CircuitState::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                debug!(
                    breaker = %self.name,
                    consecutive_failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker recorded failure"
                );
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {
                // Late result of a call admitted before the circuit opened
                debug!(breaker = %self.name, "Ignoring failure while circuit is open");
            }
        }
    }

    /// Current circuit state.
    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    /// Consistent view of the breaker for health reporting.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state.read().await;
        BreakerSnapshot {
            name: self.name.clone(),
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            last_failure_secs_ago: state.last_failure_at.map(|at| at.elapsed().as_secs()),
            open_remaining_ms: match state.state {
                CircuitState::Open => Some(
                    state
                        .open_remaining(self.config.open_timeout)
                        .unwrap_or_default()
                        .as_millis() as u64,
                ),
                _ => None,
            },
            times_opened: self.times_opened(),
            requests_rejected: self.requests_rejected(),
        }
    }

    /// Number of times the circuit has been opened.
    pub fn times_opened(&self) -> u32 {
        self.times_opened.load(Ordering::Relaxed)
    }

    /// Number of calls rejected without invoking the operation.
    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    /// Force the circuit to close (manual recovery).
    pub async fn force_close(&self) {
        let mut state = self.state.write().await;
        self.transition(&mut state, CircuitState::Closed);
        info!(breaker = %self.name, "Circuit breaker forcibly closed");
    }

    /// Force the circuit to open (manual intervention).
    pub async fn force_open(&self) {
        let mut state = self.state.write().await;
        self.transition(&mut state, CircuitState::Open);
        warn!(breaker = %self.name, "Circuit breaker forcibly opened");
    }
}
