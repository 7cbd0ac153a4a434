//! Circuit breaker over the remote store, with lock-free atomics.
//!
//! Callers ask for a [`CallPermit`] before each remote call and settle it with the
//! outcome. An open breaker refuses permits, which the guard turns into a local-bucket
//! decision instead of a remote round trip.

use crate::clock::{Clock, MonotonicClock};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Remote path in use; failures are counted.
    Closed,
    /// Remote path bypassed until the recovery timeout elapses.
    Open,
    /// A bounded number of probe calls test whether the store is back.
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            CircuitState::Closed => STATE_CLOSED,
            CircuitState::Open => STATE_OPEN,
            CircuitState::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CLOSED => CircuitState::Closed,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            // Unknown values are treated as open: it only ever costs a local decision.
            _ => CircuitState::Open,
        }
    }
}

/// A state change caused by a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { failure_count: usize },
    HalfOpened,
    Closed,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("recovery_timeout must be > 0 (got {0:?})")]
    InvalidRecoveryTimeout(Duration),
    #[error("failure_window must be > 0 (got {0:?})")]
    InvalidFailureWindow(Duration),
    #[error("half_open_max_calls must be > 0 (got {provided})")]
    InvalidHalfOpenLimit { provided: usize },
}

/// The breaker refused a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker open ({failure_count} failures, open for {open_duration:?})")]
pub struct BreakerOpen {
    pub failure_count: usize,
    pub open_duration: Duration,
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    failure_window: Duration,
    recovery_timeout: Duration,
    half_open_max_calls: usize,
}

impl CircuitBreakerConfig {
    /// Create a config with validation. Failures are counted without a window and one
    /// probe is allowed while half-open; see [`with_failure_window`](Self::with_failure_window)
    /// and [`with_half_open_limit`](Self::with_half_open_limit).
    pub fn new(
        failure_threshold: usize,
        recovery_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 });
        }
        if recovery_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidRecoveryTimeout(recovery_timeout));
        }
        Ok(Self {
            failure_threshold,
            failure_window: Duration::MAX,
            recovery_timeout,
            half_open_max_calls: 1,
        })
    }

    /// Failures count toward the threshold only while they all fall within `window` of the
    /// first failure in the streak. A failure later than that starts a new streak.
    pub fn with_failure_window(mut self, window: Duration) -> Result<Self, CircuitBreakerError> {
        if window.is_zero() {
            return Err(CircuitBreakerError::InvalidFailureWindow(window));
        }
        self.failure_window = window;
        Ok(self)
    }

    /// Override the maximum number of concurrent half-open probes; must be > 0.
    pub fn with_half_open_limit(mut self, limit: usize) -> Result<Self, CircuitBreakerError> {
        if limit == 0 {
            return Err(CircuitBreakerError::InvalidHalfOpenLimit { provided: limit });
        }
        self.half_open_max_calls = limit;
        Ok(self)
    }

    /// Threshold before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn failure_window(&self) -> Duration {
        self.failure_window
    }

    /// Duration to stay Open before Half-Open probes.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Maximum concurrent calls while Half-Open.
    pub fn half_open_max_calls(&self) -> usize {
        self.half_open_max_calls
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(10),
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug)]
pub(crate) struct CircuitBreakerState {
    state: AtomicU8,
    failure_count: AtomicUsize,
    streak_started_millis: AtomicU64,
    opened_at_millis: AtomicU64,
    half_open_calls: AtomicUsize,
}

impl CircuitBreakerState {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            failure_count: AtomicUsize::new(0),
            streak_started_millis: AtomicU64::new(0),
            opened_at_millis: AtomicU64::new(0),
            half_open_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn current_state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Force Closed and clear all counters.
    pub(crate) fn reset(&self) {
        self.state.store(CircuitState::Closed.to_u8(), Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
        self.streak_started_millis.store(0, Ordering::Release);
        self.opened_at_millis.store(0, Ordering::Release);
        self.half_open_calls.store(0, Ordering::Release);
    }
}

/// Per-process circuit breaker. Clones share the same underlying state via `Arc`.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<CircuitBreakerState>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(CircuitBreakerState::new()),
            config,
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.state.current_state()
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> usize {
        self.state.failure_count()
    }

    /// Force the breaker back to Closed.
    pub fn reset(&self) {
        self.state.reset();
        tracing::info!(target: "tollgate::circuit_breaker", "Circuit breaker reset → closed");
    }

    pub(crate) fn shared_state(&self) -> Arc<CircuitBreakerState> {
        self.state.clone()
    }

    /// Ask to make one remote call.
    ///
    /// # Behavior
    /// - **Closed**: always granted.
    /// - **Open**: refused until `recovery_timeout` has elapsed; the first caller after
    ///   that moves the breaker to Half-Open and becomes the probe.
    /// - **HalfOpen**: granted to at most `half_open_max_calls` concurrent probes.
    pub fn acquire(&self) -> Result<CallPermit<'_>, BreakerOpen> {
        loop {
            match self.state() {
                CircuitState::Closed => return Ok(CallPermit::new(self, false, None)),
                CircuitState::Open => {
                    let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed < duration_millis(self.config.recovery_timeout) {
                        return Err(self.open_error(elapsed));
                    }
                    match self.state.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // We won the race - we're the first half-open caller
                            self.state.half_open_calls.store(1, Ordering::Release);
                            tracing::info!(target: "tollgate::circuit_breaker", "Circuit breaker → half-open");
                            return Ok(CallPermit::new(self, true, Some(Transition::HalfOpened)));
                        }
                        // Someone else moved it; re-check.
                        Err(_) => continue,
                    }
                }
                CircuitState::HalfOpen => {
                    let current = self.state.half_open_calls.fetch_add(1, Ordering::AcqRel);
                    if current >= self.config.half_open_max_calls {
                        self.state.half_open_calls.fetch_sub(1, Ordering::Release);
                        let opened_at = self.state.opened_at_millis.load(Ordering::Acquire);
                        return Err(self.open_error(self.now_millis().saturating_sub(opened_at)));
                    }
                    tracing::debug!(
                        target: "tollgate::circuit_breaker",
                        in_flight = current + 1,
                        max = self.config.half_open_max_calls,
                        "Circuit breaker: half-open probe"
                    );
                    return Ok(CallPermit::new(self, true, None));
                }
            }
        }
    }

    /// Any success while Closed clears the failure streak; a probe success closes the breaker.
    fn on_success(&self) -> Option<Transition> {
        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.failure_count.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(0, Ordering::Release);
                    tracing::info!(target: "tollgate::circuit_breaker", "Circuit breaker → closed");
                    return Some(Transition::Closed);
                }
                None
            }
            CircuitState::Closed => {
                self.state.failure_count.store(0, Ordering::Release);
                None
            }
            CircuitState::Open => None,
        }
    }

    fn on_failure(&self) -> Option<Transition> {
        let now = self.now_millis();
        let window = duration_millis(self.config.failure_window);
        let started = self.state.streak_started_millis.load(Ordering::Acquire);
        let failures = if self.state.failure_count.load(Ordering::Acquire) == 0
            || now.saturating_sub(started) > window
        {
            self.state.streak_started_millis.store(now, Ordering::Release);
            self.state.failure_count.store(1, Ordering::Release);
            1
        } else {
            self.state.failure_count.fetch_add(1, Ordering::AcqRel) + 1
        };

        match self.state() {
            CircuitState::HalfOpen => {
                if self
                    .state
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::warn!(target: "tollgate::circuit_breaker", failures, "Circuit breaker: probe failed → open");
                    return Some(Transition::Opened { failure_count: failures });
                }
                None
            }
            CircuitState::Closed => {
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.state.half_open_calls.store(0, Ordering::Release);
                    self.state.opened_at_millis.store(now, Ordering::Release);
                    tracing::error!(
                        target: "tollgate::circuit_breaker",
                        failures,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker → open"
                    );
                    return Some(Transition::Opened { failure_count: failures });
                }
                None
            }
            CircuitState::Open => None,
        }
    }

    fn open_error(&self, elapsed_millis: u64) -> BreakerOpen {
        BreakerOpen {
            failure_count: self.state.failure_count(),
            open_duration: Duration::from_millis(elapsed_millis),
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Permission to make one remote call. Settle it with [`success`](Self::success) or
/// [`failure`](Self::failure); dropping it unsettled frees its probe slot without
/// counting an outcome.
#[derive(Debug)]
#[must_use = "settle the permit with success() or failure()"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    transition: Option<Transition>,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool, transition: Option<Transition>) -> Self {
        Self { breaker, probe, transition }
    }

    /// Whether this call is a half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// Transition caused by granting this permit (Open → HalfOpen), if any.
    pub fn transition(&self) -> Option<Transition> {
        self.transition
    }

    pub fn success(mut self) -> Option<Transition> {
        self.release();
        self.breaker.on_success()
    }

    pub fn failure(mut self) -> Option<Transition> {
        self.release();
        self.breaker.on_failure()
    }

    fn release(&mut self) {
        if std::mem::take(&mut self.probe) {
            let _ = self.breaker.state.half_open_calls.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |n| Some(n.saturating_sub(1)),
            );
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
