#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Tollgate
//!
//! Token-bucket admission control that stays consistent across processes and keeps
//! enforcing limits when the shared store goes away.
//!
//! ## Features
//!
//! - **Token buckets with grace tokens**: fractional lazy refill, a non-refilling grace
//!   allowance spent after normal tokens, clock-skew safe
//! - **Atomic remote buckets**: one script call per decision, so every process sharing
//!   the store sees the same count
//! - **Circuit-broken failover** to process-local buckets with the same semantics
//! - **Key and limit resolution**: user > client > path > global keys, dynamic per-key
//!   limits over a static route table over a global default
//! - **Tower middleware** that turns a denial into a `RateLimited` error with a retry hint
//!
//! ## Quick Start
//!
//! ```rust
//! use tollgate::{AdmissionController, InMemoryTokenBucketStore, RemoteBucket, RequestAttributes};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = InMemoryTokenBucketStore::new();
//!     let controller = AdmissionController::builder(RemoteBucket::new(store)).build();
//!
//!     let attrs = RequestAttributes::new("/orders").with_user_id("u1");
//!     for _ in 0..7 {
//!         assert!(controller.admit(&attrs, 1_000).await);
//!     }
//!     // 5 tokens + 2 grace under the default limits.
//!     assert!(!controller.admit(&attrs, 1_000).await);
//! }
//! ```

pub mod adaptive;
pub mod bucket;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod controller;
pub mod error;
pub mod guard;
pub mod local;
pub mod middleware;
pub mod remote;
pub mod resolver;
#[cfg(feature = "settings")]
pub mod settings;
pub mod strategy;
pub mod telemetry;
pub mod timeout;

// Re-exports
pub use adaptive::DynamicConfig;
pub use bucket::{BucketConfig, BucketConfigError, BucketState, TokenKind};
pub use circuit_breaker::{
    BreakerOpen, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError,
    CircuitState, Transition,
};
pub use circuit_breaker_registry::{
    CircuitBreakerHandle, CircuitBreakerRegistry, CircuitBreakerRegistryError,
    InMemoryCircuitBreakerRegistry,
};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use controller::{Admission, AdmissionController, AdmissionControllerBuilder};
pub use error::{AdmissionError, ConfigError, RemoteError, StoreError};
pub use guard::{
    DecisionPath, DegradedMode, FailureGuard, FallbackReason, GuardedDecision, LocalGrace,
};
pub use local::LocalBucket;
pub use middleware::{AdmissionLayer, AdmissionService};
pub use remote::{InMemoryTokenBucketStore, RemoteBucket, ScriptArgs, TokenBucketStore};
pub use resolver::{
    ConfigOrigin, ConfigRecord, ConfigSource, InMemoryConfigSource, KeyScheme, LimitResolver,
    LimitingKey, NoConfigSource, RequestAttributes, Resolution, RouteTable,
};
#[cfg(feature = "settings")]
pub use settings::{AdmissionSettings, SettingsError};
pub use strategy::BucketStrategy;
pub use telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink};
pub use timeout::TimeoutPolicy;
