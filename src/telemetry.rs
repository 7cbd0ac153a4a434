//! Telemetry side channel for admission decisions.
//!
//! The guard emits an [`AdmissionEvent`] for every breaker transition, every failed remote
//! call and every decision. Events flow into a [`TelemetrySink`], which is a
//! `tower::Service<AdmissionEvent>` so sinks compose with ordinary tower combinators.
//!
//! Emission is best-effort: a sink that is not ready or fails loses the event, and the
//! admission decision is unaffected either way.
//!
//! ```rust
//! use tollgate::telemetry::{AdmissionEvent, CircuitBreakerEvent, MemorySink};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! let event = AdmissionEvent::CircuitBreaker(CircuitBreakerEvent::Opened { failure_count: 5 });
//! sink.call(event.clone()).await.unwrap();
//! assert_eq!(sink.events(), vec![event]);
//! # }
//! ```

use crate::circuit_breaker::Transition;
use crate::guard::DecisionPath;
use futures::future::BoxFuture;
use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes admission events.
pub trait TelemetrySink:
    tower::Service<AdmissionEvent, Response = (), Error = Self::SinkError, Future = Self::SinkFuture>
    + Clone
    + Send
    + Sync
    + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
    /// The future returned by `call`.
    type SinkFuture: std::future::Future<Output = Result<(), Self::SinkError>> + Send + 'static;
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: AdmissionEvent)
where
    S: tower::Service<AdmissionEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Events emitted while admitting requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The breaker in front of the remote store changed state.
    CircuitBreaker(CircuitBreakerEvent),
    /// A remote call failed; the guard fell back.
    Remote(RemoteEvent),
    /// A request was admitted or denied.
    Decision(DecisionEvent),
}

/// Breaker state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerEvent {
    /// Remote calls are bypassed until the recovery timeout elapses.
    Opened {
        /// Number of consecutive failures that triggered the open
        failure_count: usize,
    },
    /// A probe call is testing the store.
    HalfOpen,
    /// The store answered a probe; remote decisions resume.
    Closed,
}

impl From<Transition> for CircuitBreakerEvent {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Opened { failure_count } => Self::Opened { failure_count },
            Transition::HalfOpened => Self::HalfOpen,
            Transition::Closed => Self::Closed,
        }
    }
}

/// Failed remote round trips.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    /// The call exceeded its timeout.
    TimedOut { timeout: Duration },
    /// The store failed or replied with something unusable.
    Failed {
        /// Short failure label, see [`RemoteError::kind`](crate::error::RemoteError::kind).
        kind: &'static str,
    },
}

/// Outcome of one admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionEvent {
    pub key: String,
    pub allowed: bool,
    pub path: DecisionPath,
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::CircuitBreaker(e) => write!(f, "CircuitBreaker::{}", e),
            AdmissionEvent::Remote(e) => write!(f, "Remote::{}", e),
            AdmissionEvent::Decision(e) => write!(f, "Decision::{}", e),
        }
    }
}

impl fmt::Display for CircuitBreakerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerEvent::Opened { failure_count } => {
                write!(f, "Opened(failures={})", failure_count)
            }
            CircuitBreakerEvent::HalfOpen => write!(f, "HalfOpen"),
            CircuitBreakerEvent::Closed => write!(f, "Closed"),
        }
    }
}

impl fmt::Display for RemoteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteEvent::TimedOut { timeout } => write!(f, "TimedOut(timeout={:?})", timeout),
            RemoteEvent::Failed { kind } => write!(f, "Failed(kind={})", kind),
        }
    }
}

impl fmt::Display for DecisionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.allowed { "Allowed" } else { "Denied" };
        write!(f, "{}(key={}, path={})", verdict, self.key, self.path)
    }
}

#[cfg(feature = "telemetry-json")]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert an `AdmissionEvent` into a JSON value for sinks that ship structured records.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    use serde_json::json;

    match event {
        AdmissionEvent::CircuitBreaker(c) => match c {
            CircuitBreakerEvent::Opened { failure_count } => {
                json!({ "kind": "circuit_opened", "failures": *failure_count })
            }
            CircuitBreakerEvent::HalfOpen => json!({ "kind": "circuit_half_open" }),
            CircuitBreakerEvent::Closed => json!({ "kind": "circuit_closed" }),
        },
        AdmissionEvent::Remote(r) => match r {
            RemoteEvent::TimedOut { timeout } => json!({
                "kind": "remote_timeout",
                "timeout_ms": clamp_u64(timeout.as_millis()),
            }),
            RemoteEvent::Failed { kind } => json!({ "kind": "remote_failure", "error": kind }),
        },
        AdmissionEvent::Decision(d) => json!({
            "kind": if d.allowed { "admitted" } else { "denied" },
            "key": d.key,
            "path": d.path.to_string(),
        }),
    }
}

type BoxedSinkFuture = BoxFuture<'static, Result<(), Infallible>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<AdmissionEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxedSinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: AdmissionEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
    type SinkFuture = BoxedSinkFuture;
}

/// Logs events with `tracing`: decisions at DEBUG, everything else at INFO.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<AdmissionEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxedSinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        match &event {
            AdmissionEvent::Decision(_) => tracing::debug!(event = %event, "admission_event"),
            _ => tracing::info!(event = %event, "admission_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
    type SinkFuture = BoxedSinkFuture;
}

/// Bounded in-memory sink; the oldest events are evicted first.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AdmissionEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    /// Creates a bounded memory sink (default cap: 10,000).
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Returns a snapshot of all events received so far.
    pub fn events(&self) -> Vec<AdmissionEvent> {
        self.lock().clone()
    }

    /// Breaker transitions received so far, in order.
    pub fn breaker_events(&self) -> Vec<CircuitBreakerEvent> {
        self.lock()
            .iter()
            .filter_map(|e| match e {
                AdmissionEvent::CircuitBreaker(b) => Some(*b),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Returns the number of evicted events.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AdmissionEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<AdmissionEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = BoxedSinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
    type SinkFuture = BoxedSinkFuture;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::FallbackReason;

    #[test]
    fn display_is_compact() {
        let opened = AdmissionEvent::CircuitBreaker(CircuitBreakerEvent::Opened { failure_count: 5 });
        assert_eq!(opened.to_string(), "CircuitBreaker::Opened(failures=5)");

        let failed = AdmissionEvent::Remote(RemoteEvent::Failed { kind: "unavailable" });
        assert_eq!(failed.to_string(), "Remote::Failed(kind=unavailable)");

        let decision = AdmissionEvent::Decision(DecisionEvent {
            key: "rate:global".into(),
            allowed: false,
            path: DecisionPath::LocalFallback(FallbackReason::CircuitOpen),
        });
        assert!(decision.to_string().starts_with("Decision::Denied(key=rate:global"));
    }

    #[test]
    fn transitions_map_to_events() {
        assert_eq!(
            CircuitBreakerEvent::from(Transition::Opened { failure_count: 3 }),
            CircuitBreakerEvent::Opened { failure_count: 3 }
        );
        assert_eq!(CircuitBreakerEvent::from(Transition::HalfOpened), CircuitBreakerEvent::HalfOpen);
        assert_eq!(CircuitBreakerEvent::from(Transition::Closed), CircuitBreakerEvent::Closed);
    }

    #[tokio::test]
    async fn memory_sink_evicts_oldest() {
        let sink = MemorySink::with_capacity(2);
        for failure_count in 1..=3 {
            emit_best_effort(
                sink.clone(),
                AdmissionEvent::CircuitBreaker(CircuitBreakerEvent::Opened { failure_count }),
            )
            .await;
        }
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.evicted(), 1);
        assert_eq!(
            sink.breaker_events(),
            vec![
                CircuitBreakerEvent::Opened { failure_count: 2 },
                CircuitBreakerEvent::Opened { failure_count: 3 }
            ]
        );
        sink.clear();
        assert!(sink.is_empty());
    }

    #[cfg(feature = "telemetry-json")]
    #[test]
    fn json_shape() {
        let v = event_to_json(&AdmissionEvent::Remote(RemoteEvent::TimedOut {
            timeout: Duration::from_millis(500),
        }));
        assert_eq!(v["kind"], "remote_timeout");
        assert_eq!(v["timeout_ms"], 500);

        let v = event_to_json(&AdmissionEvent::Decision(DecisionEvent {
            key: "rate:api:/ping".into(),
            allowed: true,
            path: DecisionPath::Remote,
        }));
        assert_eq!(v["kind"], "admitted");
        assert_eq!(v["path"], "remote");
    }

    #[tokio::test]
    async fn null_and_log_sinks_accept_everything() {
        let event = AdmissionEvent::Remote(RemoteEvent::TimedOut { timeout: Duration::from_millis(500) });
        emit_best_effort(NullSink, event.clone()).await;
        emit_best_effort(LogSink, event).await;
    }
}
