//! Failure guard: remote decisions behind a circuit breaker, local decisions when the
//! remote path is unavailable.
//!
//! # Behavior
//!
//! - Breaker **closed** (or a half-open probe slot is free): ask the primary strategy.
//!   An answer is final. A failure is recorded on the breaker and the same request is
//!   decided by the fallback.
//! - Breaker **open**: skip the remote call entirely and decide with the fallback.
//!
//! The fallback is chosen by [`DegradedMode`]. The default keeps enforcing limits with a
//! process-local [`LocalBucket`], so a store outage never turns into unlimited traffic.
//! Local decisions are per process: across N processes the effective limit during an
//! outage is up to N times the configured one.

use crate::bucket::BucketConfig;
use crate::circuit_breaker::{CircuitBreaker, CircuitState, Transition};
use crate::error::RemoteError;
use crate::local::LocalBucket;
use crate::strategy::BucketStrategy;
use crate::telemetry::{
    emit_best_effort, AdmissionEvent, CircuitBreakerEvent, DecisionEvent, NullSink, RemoteEvent,
    TelemetrySink,
};
use std::fmt;
use std::sync::Arc;

/// What to do when the remote path cannot decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "settings", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "settings", serde(rename_all = "snake_case"))]
pub enum DegradedMode {
    /// Decide with the process-local bucket.
    #[default]
    LocalBucket,
    /// Admit everything until the store is back.
    FailOpen,
    /// Deny everything until the store is back.
    FailClosed,
}

/// How the local fallback accounts for grace tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "settings", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "settings", serde(rename_all = "snake_case"))]
pub enum LocalGrace {
    /// Separate, non-refilling grace counter, exactly like the remote bucket.
    #[default]
    Separate,
    /// Grace folded into capacity, so it refills like normal tokens.
    Folded,
}

/// Why a request was not decided remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The breaker is open; no remote call was made.
    CircuitOpen,
    /// The remote call was made and failed.
    RemoteFailure,
}

/// Which path produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPath {
    Remote,
    LocalFallback(FallbackReason),
    /// Decided by [`DegradedMode::FailOpen`] or [`DegradedMode::FailClosed`].
    Degraded(FallbackReason),
}

impl DecisionPath {
    pub fn is_remote(&self) -> bool {
        matches!(self, DecisionPath::Remote)
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::CircuitOpen => write!(f, "circuit_open"),
            FallbackReason::RemoteFailure => write!(f, "remote_failure"),
        }
    }
}

impl fmt::Display for DecisionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionPath::Remote => write!(f, "remote"),
            DecisionPath::LocalFallback(reason) => write!(f, "local({})", reason),
            DecisionPath::Degraded(reason) => write!(f, "degraded({})", reason),
        }
    }
}

/// An admit/deny decision and the path that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedDecision {
    pub allowed: bool,
    pub path: DecisionPath,
}

/// Remote token bucket guarded by a circuit breaker, with a local fallback.
#[derive(Clone)]
pub struct FailureGuard<S = NullSink> {
    primary: Arc<dyn BucketStrategy>,
    breaker: CircuitBreaker,
    local: LocalBucket,
    degraded: DegradedMode,
    grace: LocalGrace,
    sink: S,
}

impl FailureGuard<NullSink> {
    pub fn new<P>(primary: P, breaker: CircuitBreaker) -> Self
    where
        P: BucketStrategy + 'static,
    {
        Self::from_shared(Arc::new(primary), breaker)
    }

    pub fn from_shared(primary: Arc<dyn BucketStrategy>, breaker: CircuitBreaker) -> Self {
        Self {
            primary,
            breaker,
            local: LocalBucket::new(),
            degraded: DegradedMode::default(),
            grace: LocalGrace::default(),
            sink: NullSink,
        }
    }
}

impl<S> FailureGuard<S>
where
    S: TelemetrySink,
{
    /// Use an existing local bucket, e.g. one shared with maintenance tasks.
    pub fn with_local(mut self, local: LocalBucket) -> Self {
        self.local = local;
        self
    }

    pub fn with_degraded_mode(mut self, mode: DegradedMode) -> Self {
        self.degraded = mode;
        self
    }

    pub fn with_local_grace(mut self, grace: LocalGrace) -> Self {
        self.grace = grace;
        self
    }

    /// Attach a telemetry sink.
    pub fn with_sink<T>(self, sink: T) -> FailureGuard<T>
    where
        T: TelemetrySink,
    {
        FailureGuard {
            primary: self.primary,
            breaker: self.breaker,
            local: self.local,
            degraded: self.degraded,
            grace: self.grace,
            sink,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn local(&self) -> &LocalBucket {
        &self.local
    }

    pub fn degraded_mode(&self) -> DegradedMode {
        self.degraded
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Decide one request for `key`. Never fails: every remote failure becomes a
    /// fallback decision.
    pub async fn guarded_consume(
        &self,
        key: &str,
        config: &BucketConfig,
        now_ms: u64,
    ) -> GuardedDecision {
        let decision = match self.breaker.acquire() {
            Err(open) => {
                tracing::debug!(
                    key,
                    failures = open.failure_count,
                    open_for = ?open.open_duration,
                    "circuit open; skipping remote bucket"
                );
                self.fallback(key, config, now_ms, FallbackReason::CircuitOpen)
            }
            Ok(permit) => {
                if let Some(transition) = permit.transition() {
                    self.emit_transition(transition).await;
                }
                match self.primary.try_consume(key, config, now_ms).await {
                    Ok(allowed) => {
                        if let Some(transition) = permit.success() {
                            self.emit_transition(transition).await;
                        }
                        GuardedDecision { allowed, path: DecisionPath::Remote }
                    }
                    Err(err) => {
                        let transition = permit.failure();
                        tracing::warn!(
                            key,
                            backend = self.primary.name(),
                            kind = err.kind(),
                            error = %err,
                            "remote bucket failed; deciding locally"
                        );
                        self.emit(AdmissionEvent::Remote(remote_event(&err))).await;
                        if let Some(transition) = transition {
                            self.emit_transition(transition).await;
                        }
                        self.fallback(key, config, now_ms, FallbackReason::RemoteFailure)
                    }
                }
            }
        };

        tracing::debug!(key, allowed = decision.allowed, path = %decision.path, "admission decision");
        self.emit(AdmissionEvent::Decision(DecisionEvent {
            key: key.to_string(),
            allowed: decision.allowed,
            path: decision.path,
        }))
        .await;
        decision
    }

    fn fallback(
        &self,
        key: &str,
        config: &BucketConfig,
        now_ms: u64,
        reason: FallbackReason,
    ) -> GuardedDecision {
        match self.degraded {
            DegradedMode::LocalBucket => {
                let effective = match self.grace {
                    LocalGrace::Separate => *config,
                    LocalGrace::Folded => config.with_folded_grace(),
                };
                GuardedDecision {
                    allowed: self.local.try_consume(key, &effective, now_ms),
                    path: DecisionPath::LocalFallback(reason),
                }
            }
            DegradedMode::FailOpen => {
                GuardedDecision { allowed: true, path: DecisionPath::Degraded(reason) }
            }
            DegradedMode::FailClosed => {
                GuardedDecision { allowed: false, path: DecisionPath::Degraded(reason) }
            }
        }
    }

    async fn emit_transition(&self, transition: Transition) {
        self.emit(AdmissionEvent::CircuitBreaker(CircuitBreakerEvent::from(transition))).await;
    }

    async fn emit(&self, event: AdmissionEvent) {
        emit_best_effort(self.sink.clone(), event).await;
    }
}

fn remote_event(err: &RemoteError) -> RemoteEvent {
    match err {
        RemoteError::Timeout { timeout, .. } => RemoteEvent::TimedOut { timeout: *timeout },
        other => RemoteEvent::Failed { kind: other.kind() },
    }
}

impl<S: fmt::Debug> fmt::Debug for FailureGuard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureGuard")
            .field("primary", &self.primary.name())
            .field("breaker", &self.breaker.state())
            .field("local_buckets", &self.local.len())
            .field("degraded", &self.degraded)
            .field("grace", &self.grace)
            .field("sink", &self.sink)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::remote::{InMemoryTokenBucketStore, RemoteBucket};
    use crate::telemetry::MemorySink;
    use crate::timeout::TimeoutPolicy;
    use std::time::Duration;

    fn config() -> BucketConfig {
        BucketConfig::new(5, 1, 60_000, 0).unwrap()
    }

    fn breaker(threshold: usize, clock: &ManualClock) -> CircuitBreaker {
        let cfg = CircuitBreakerConfig::new(threshold, Duration::from_secs(30)).unwrap();
        CircuitBreaker::new(cfg).with_clock(clock.clone())
    }

    fn guard(
        store: &InMemoryTokenBucketStore,
        threshold: usize,
        clock: &ManualClock,
    ) -> FailureGuard<MemorySink> {
        FailureGuard::new(RemoteBucket::new(store.clone()), breaker(threshold, clock))
            .with_sink(MemorySink::new())
    }

    async fn run(guard: &FailureGuard<MemorySink>, key: &str, n: usize) -> Vec<GuardedDecision> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(guard.guarded_consume(key, &config(), 0).await);
        }
        out
    }

    #[tokio::test]
    async fn healthy_store_decides_remotely() {
        let store = InMemoryTokenBucketStore::new();
        let guard = guard(&store, 3, &ManualClock::new(0));
        let decisions = run(&guard, "k", 6).await;
        assert!(decisions.iter().all(|d| d.path.is_remote()));
        assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 5);
        assert_eq!(guard.breaker_state(), CircuitState::Closed);
        assert!(guard.local().is_empty(), "local bucket untouched while store is healthy");
    }

    #[tokio::test]
    async fn local_fallback_matches_remote_decisions() {
        let healthy = InMemoryTokenBucketStore::new();
        let remote = run(&guard(&healthy, 100, &ManualClock::new(0)), "k", 8).await;

        let broken = InMemoryTokenBucketStore::new();
        broken.set_unavailable(true);
        let local = run(&guard(&broken, 100, &ManualClock::new(0)), "k", 8).await;

        let remote_allowed: Vec<bool> = remote.iter().map(|d| d.allowed).collect();
        let local_allowed: Vec<bool> = local.iter().map(|d| d.allowed).collect();
        assert_eq!(remote_allowed, local_allowed);
        assert_eq!(local_allowed.iter().filter(|a| **a).count(), 5);
        assert!(local
            .iter()
            .all(|d| d.path == DecisionPath::LocalFallback(FallbackReason::RemoteFailure)));
    }

    #[tokio::test]
    async fn open_breaker_skips_the_store() {
        let store = InMemoryTokenBucketStore::new();
        store.set_unavailable(true);
        let guard = guard(&store, 3, &ManualClock::new(0));

        let decisions = run(&guard, "k", 5).await;
        assert_eq!(store.calls(), 3, "breaker opens after the third failure");
        assert_eq!(guard.breaker_state(), CircuitState::Open);
        assert_eq!(decisions[2].path, DecisionPath::LocalFallback(FallbackReason::RemoteFailure));
        assert_eq!(decisions[3].path, DecisionPath::LocalFallback(FallbackReason::CircuitOpen));
        assert_eq!(
            guard.sink().breaker_events(),
            vec![CircuitBreakerEvent::Opened { failure_count: 3 }]
        );
        let failures = guard
            .sink()
            .events()
            .into_iter()
            .filter(|e| matches!(e, AdmissionEvent::Remote(RemoteEvent::Failed { kind: "unavailable" })))
            .count();
        assert_eq!(failures, 3);
    }

    #[tokio::test]
    async fn recovers_through_a_single_probe() {
        let clock = ManualClock::new(0);
        let store = InMemoryTokenBucketStore::new();
        store.set_unavailable(true);
        let guard = guard(&store, 1, &clock);

        run(&guard, "k", 2).await;
        assert_eq!(guard.breaker_state(), CircuitState::Open);

        store.set_unavailable(false);
        clock.advance(30_000);
        let probe = guard.guarded_consume("k", &config(), 0).await;
        assert_eq!(probe.path, DecisionPath::Remote);
        assert!(probe.allowed);
        assert_eq!(guard.breaker_state(), CircuitState::Closed);
        assert_eq!(
            guard.sink().breaker_events(),
            vec![
                CircuitBreakerEvent::Opened { failure_count: 1 },
                CircuitBreakerEvent::HalfOpen,
                CircuitBreakerEvent::Closed
            ]
        );
    }

    #[tokio::test]
    async fn failed_probe_stays_local() {
        let clock = ManualClock::new(0);
        let store = InMemoryTokenBucketStore::new();
        store.set_unavailable(true);
        let guard = guard(&store, 1, &clock);

        run(&guard, "k", 1).await;
        clock.advance(30_000);
        let probe = guard.guarded_consume("k", &config(), 0).await;
        assert_eq!(probe.path, DecisionPath::LocalFallback(FallbackReason::RemoteFailure));
        assert_eq!(guard.breaker_state(), CircuitState::Open);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn timeouts_count_as_failures() {
        let store = InMemoryTokenBucketStore::new().with_latency(Duration::from_millis(200));
        let remote = RemoteBucket::new(store)
            .with_timeout(TimeoutPolicy::new(Duration::from_millis(10)).unwrap());
        let guard = FailureGuard::new(remote, breaker(1, &ManualClock::new(0)))
            .with_sink(MemorySink::new());

        let decision = guard.guarded_consume("k", &config(), 0).await;
        assert!(decision.allowed);
        assert_eq!(decision.path, DecisionPath::LocalFallback(FallbackReason::RemoteFailure));
        assert_eq!(guard.breaker_state(), CircuitState::Open);
        assert!(guard.sink().events().contains(&AdmissionEvent::Remote(RemoteEvent::TimedOut {
            timeout: Duration::from_millis(10)
        })));
    }

    #[tokio::test]
    async fn degraded_modes_ignore_the_local_bucket() {
        let store = InMemoryTokenBucketStore::new();
        store.set_unavailable(true);
        let clock = ManualClock::new(0);

        let open = guard(&store, 1, &clock).with_degraded_mode(DegradedMode::FailOpen);
        let decisions = run(&open, "k", 20).await;
        assert!(decisions.iter().all(|d| d.allowed));
        assert_eq!(decisions[1].path, DecisionPath::Degraded(FallbackReason::CircuitOpen));
        assert!(open.local().is_empty());

        let closed = guard(&store, 1, &clock).with_degraded_mode(DegradedMode::FailClosed);
        assert!(run(&closed, "k", 3).await.iter().all(|d| !d.allowed));
    }

    #[tokio::test]
    async fn folded_grace_spends_total_budget_locally() {
        let store = InMemoryTokenBucketStore::new();
        store.set_unavailable(true);
        let guard = guard(&store, 1, &ManualClock::new(0)).with_local_grace(LocalGrace::Folded);
        let cfg = BucketConfig::new(5, 1, 60_000, 2).unwrap();

        let mut allowed = 0;
        for _ in 0..10 {
            if guard.guarded_consume("k", &cfg, 0).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 7);
        let state = guard.local().snapshot("k").unwrap();
        assert_eq!(state.grace_remaining(), 0);
    }

    #[tokio::test]
    async fn every_decision_is_reported() {
        let store = InMemoryTokenBucketStore::new();
        let guard = guard(&store, 3, &ManualClock::new(0));
        run(&guard, "rate:global", 6).await;
        let decisions: Vec<DecisionEvent> = guard
            .sink()
            .events()
            .into_iter()
            .filter_map(|e| match e {
                AdmissionEvent::Decision(d) => Some(d),
                _ => None,
            })
            .collect();
        assert_eq!(decisions.len(), 6);
        assert!(!decisions[5].allowed);
        assert_eq!(decisions[5].key, "rate:global");
    }
}
