//! Per-request admission: resolve the key and its limits, then ask the guard.

use crate::bucket::BucketConfig;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::circuit_breaker_registry::{CircuitBreakerHandle, CircuitBreakerRegistry};
use crate::clock::{Clock, SystemClock};
use crate::guard::{DecisionPath, DegradedMode, FailureGuard, LocalGrace};
use crate::local::LocalBucket;
use crate::resolver::{ConfigOrigin, LimitResolver, LimitingKey, RequestAttributes};
use crate::strategy::BucketStrategy;
use crate::telemetry::{NullSink, TelemetrySink};
use std::fmt;
use std::sync::Arc;

/// Everything that went into one decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub key: LimitingKey,
    pub config: BucketConfig,
    pub origin: ConfigOrigin,
    pub allowed: bool,
    pub path: DecisionPath,
}

/// Decides whether a request is admitted.
///
/// Cheap to clone; clones share buckets, breaker and route table.
///
/// # Example
///
/// ```rust
/// use tollgate::{AdmissionController, InMemoryTokenBucketStore, RemoteBucket, RequestAttributes};
///
/// # #[tokio::main]
/// # async fn main() {
/// let controller = AdmissionController::builder(RemoteBucket::new(InMemoryTokenBucketStore::new()))
///     .build();
/// let attrs = RequestAttributes::new("/ping").with_user_id("u1");
/// assert!(controller.admit(&attrs, 0).await);
/// # }
/// ```
#[derive(Clone)]
pub struct AdmissionController<S = NullSink> {
    resolver: LimitResolver,
    guard: FailureGuard<S>,
    clock: Arc<dyn Clock>,
}

impl<S: fmt::Debug> fmt::Debug for AdmissionController<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("resolver", &self.resolver)
            .field("guard", &self.guard)
            .field("clock", &self.clock)
            .finish()
    }
}

impl AdmissionController<NullSink> {
    /// Start building a controller whose remote path is `primary`.
    pub fn builder<P>(primary: P) -> AdmissionControllerBuilder<NullSink>
    where
        P: BucketStrategy + 'static,
    {
        AdmissionControllerBuilder::new(Arc::new(primary))
    }
}

impl<S> AdmissionController<S>
where
    S: TelemetrySink,
{
    /// Assemble a controller from parts built elsewhere.
    pub fn new(resolver: LimitResolver, guard: FailureGuard<S>) -> Self {
        Self { resolver, guard, clock: Arc::new(SystemClock) }
    }

    /// Clock used by [`admit_now`](Self::admit_now).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn resolver(&self) -> &LimitResolver {
        &self.resolver
    }

    pub fn guard(&self) -> &FailureGuard<S> {
        &self.guard
    }

    /// Admit or deny one request at `now_ms`.
    pub async fn admit(&self, attrs: &RequestAttributes, now_ms: u64) -> bool {
        self.evaluate(attrs, now_ms).await.allowed
    }

    /// [`admit`](Self::admit) at the controller clock's current time.
    pub async fn admit_now(&self, attrs: &RequestAttributes) -> bool {
        self.admit(attrs, self.clock.now_millis()).await
    }

    /// Like [`admit`](Self::admit), also reporting the key, limits and decision path.
    pub async fn evaluate(&self, attrs: &RequestAttributes, now_ms: u64) -> Admission {
        let resolution = self.resolver.resolve(attrs).await;
        let decision = self
            .guard
            .guarded_consume(resolution.key.as_str(), &resolution.config, now_ms)
            .await;
        if !decision.allowed {
            tracing::debug!(key = %resolution.key, path = %decision.path, "request denied");
        }
        Admission {
            key: resolution.key,
            config: resolution.config,
            origin: resolution.origin,
            allowed: decision.allowed,
            path: decision.path,
        }
    }

    /// [`evaluate`](Self::evaluate) at the controller clock's current time.
    pub async fn evaluate_now(&self, attrs: &RequestAttributes) -> Admission {
        self.evaluate(attrs, self.clock.now_millis()).await
    }
}

/// Builder for [`AdmissionController`].
pub struct AdmissionControllerBuilder<S = NullSink> {
    primary: Arc<dyn BucketStrategy>,
    breaker: CircuitBreakerConfig,
    breaker_clock: Option<Arc<dyn Clock>>,
    clock: Arc<dyn Clock>,
    resolver: LimitResolver,
    local: LocalBucket,
    degraded: DegradedMode,
    grace: LocalGrace,
    registry: Option<(Arc<dyn CircuitBreakerRegistry>, String)>,
    sink: S,
}

impl AdmissionControllerBuilder<NullSink> {
    fn new(primary: Arc<dyn BucketStrategy>) -> Self {
        Self {
            primary,
            breaker: CircuitBreakerConfig::default(),
            breaker_clock: None,
            clock: Arc::new(SystemClock),
            resolver: LimitResolver::default(),
            local: LocalBucket::new(),
            degraded: DegradedMode::default(),
            grace: LocalGrace::default(),
            registry: None,
            sink: NullSink,
        }
    }
}

impl<S> AdmissionControllerBuilder<S>
where
    S: TelemetrySink,
{
    pub fn breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = config;
        self
    }

    /// Clock for breaker cooldowns (monotonic by default).
    pub fn breaker_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.breaker_clock = Some(Arc::new(clock));
        self
    }

    /// Clock for bucket timestamps (wall clock by default).
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn resolver(mut self, resolver: LimitResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn local_bucket(mut self, local: LocalBucket) -> Self {
        self.local = local;
        self
    }

    pub fn degraded_mode(mut self, mode: DegradedMode) -> Self {
        self.degraded = mode;
        self
    }

    pub fn local_grace(mut self, grace: LocalGrace) -> Self {
        self.grace = grace;
        self
    }

    /// Register the controller's breaker under `id` when building.
    pub fn register_breaker(
        mut self,
        registry: Arc<dyn CircuitBreakerRegistry>,
        id: impl Into<String>,
    ) -> Self {
        self.registry = Some((registry, id.into()));
        self
    }

    pub fn sink<T: TelemetrySink>(self, sink: T) -> AdmissionControllerBuilder<T> {
        AdmissionControllerBuilder {
            primary: self.primary,
            breaker: self.breaker,
            breaker_clock: self.breaker_clock,
            clock: self.clock,
            resolver: self.resolver,
            local: self.local,
            degraded: self.degraded,
            grace: self.grace,
            registry: self.registry,
            sink,
        }
    }

    pub fn build(self) -> AdmissionController<S> {
        let mut breaker = CircuitBreaker::new(self.breaker);
        if let Some(clock) = self.breaker_clock {
            breaker = breaker.with_clock(clock);
        }
        if let Some((registry, id)) = &self.registry {
            registry.register(id.clone(), CircuitBreakerHandle::from(&breaker));
        }
        let guard = FailureGuard::from_shared(self.primary, breaker)
            .with_local(self.local)
            .with_degraded_mode(self.degraded)
            .with_local_grace(self.grace)
            .with_sink(self.sink);
        AdmissionController { resolver: self.resolver, guard, clock: self.clock }
    }
}
