//! Serializable settings for wiring a controller from a config file.
//!
//! Every field has a default, so `{}` is a valid document:
//!
//! ```json
//! {
//!   "remote_timeout_ms": 500,
//!   "config_lookup_timeout_ms": 500,
//!   "breaker": { "failure_threshold": 5, "failure_window_ms": 10000,
//!                "recovery_timeout_ms": 30000, "half_open_max_calls": 1 },
//!   "degraded_mode": "local_bucket",
//!   "local_grace": "separate",
//!   "keys": { "prefix": "rate", "include_remote_addr": false },
//!   "default_limits": { "capacity": 5, "refill_rate": 1, "refill_interval_ms": 60000, "grace_limit": 2 },
//!   "routes": { "/ping": { "capacity": 10, "refill_rate": 1, "refill_interval_ms": 60000, "grace_limit": 2 } },
//!   "retry_after_secs": 60
//! }
//! ```

use crate::bucket::{BucketConfig, BucketConfigError};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::controller::{AdmissionController, AdmissionControllerBuilder};
use crate::guard::{DegradedMode, LocalGrace};
use crate::remote::{RemoteBucket, TokenBucketStore};
use crate::resolver::{ConfigSource, KeyScheme, LimitResolver, RouteTable};
use crate::telemetry::NullSink;
use crate::timeout::{TimeoutError, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while loading or applying settings.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("invalid settings document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid limits for {scope}: {source}")]
    Limits {
        scope: String,
        #[source]
        source: BucketConfigError,
    },
    #[error("invalid breaker settings: {0}")]
    Breaker(#[from] CircuitBreakerError),
    #[error("invalid {field}: {source}")]
    Timeout {
        field: &'static str,
        #[source]
        source: TimeoutError,
    },
}

/// Raw bucket limits as written in a settings document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitSettings {
    pub capacity: u32,
    pub refill_rate: u32,
    pub refill_interval_ms: u64,
    #[serde(default)]
    pub grace_limit: u32,
}

impl LimitSettings {
    pub fn to_config(&self) -> Result<BucketConfig, BucketConfigError> {
        BucketConfig::new(self.capacity, self.refill_rate, self.refill_interval_ms, self.grace_limit)
    }
}

impl From<BucketConfig> for LimitSettings {
    fn from(config: BucketConfig) -> Self {
        Self {
            capacity: config.capacity(),
            refill_rate: config.refill_rate(),
            refill_interval_ms: config.refill_interval_ms(),
            grace_limit: config.grace_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    pub failure_window_ms: u64,
    pub recovery_timeout_ms: u64,
    pub half_open_max_calls: usize,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: 10_000,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeySettings {
    pub prefix: String,
    pub include_remote_addr: bool,
}

impl Default for KeySettings {
    fn default() -> Self {
        Self { prefix: "rate".to_string(), include_remote_addr: false }
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionSettings {
    pub remote_timeout_ms: u64,
    pub config_lookup_timeout_ms: u64,
    pub breaker: BreakerSettings,
    pub degraded_mode: DegradedMode,
    pub local_grace: LocalGrace,
    pub keys: KeySettings,
    pub default_limits: LimitSettings,
    pub routes: BTreeMap<String, LimitSettings>,
    /// `Retry-After` hint for rejected requests.
    pub retry_after_secs: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        let ping = BucketConfig::new(10, 1, 60_000, 2).map(LimitSettings::from);
        Self {
            remote_timeout_ms: 500,
            config_lookup_timeout_ms: 500,
            breaker: BreakerSettings::default(),
            degraded_mode: DegradedMode::default(),
            local_grace: LocalGrace::default(),
            keys: KeySettings::default(),
            default_limits: LimitSettings::from(BucketConfig::default()),
            routes: ping.into_iter().map(|limits| ("/ping".to_string(), limits)).collect(),
            retry_after_secs: 60,
        }
    }
}

impl AdmissionSettings {
    pub fn from_json_str(json: &str) -> Result<Self, SettingsError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check every section without building anything.
    pub fn validate(&self) -> Result<(), SettingsError> {
        self.remote_timeout()?;
        self.config_lookup_timeout()?;
        self.breaker_config()?;
        self.route_table()?;
        Ok(())
    }

    pub fn remote_timeout(&self) -> Result<TimeoutPolicy, SettingsError> {
        TimeoutPolicy::new(Duration::from_millis(self.remote_timeout_ms))
            .map_err(|source| SettingsError::Timeout { field: "remote_timeout_ms", source })
    }

    pub fn config_lookup_timeout(&self) -> Result<TimeoutPolicy, SettingsError> {
        TimeoutPolicy::new(Duration::from_millis(self.config_lookup_timeout_ms))
            .map_err(|source| SettingsError::Timeout { field: "config_lookup_timeout_ms", source })
    }

    pub fn breaker_config(&self) -> Result<CircuitBreakerConfig, SettingsError> {
        let b = &self.breaker;
        let config = CircuitBreakerConfig::new(
            b.failure_threshold,
            Duration::from_millis(b.recovery_timeout_ms),
        )?
        .with_failure_window(Duration::from_millis(b.failure_window_ms))?
        .with_half_open_limit(b.half_open_max_calls)?;
        Ok(config)
    }

    pub fn route_table(&self) -> Result<RouteTable, SettingsError> {
        let default = self.default_limits.to_config().map_err(|source| SettingsError::Limits {
            scope: "default_limits".to_string(),
            source,
        })?;
        self.routes.iter().try_fold(RouteTable::new(default), |table, (path, limits)| {
            let config = limits.to_config().map_err(|source| SettingsError::Limits {
                scope: format!("route {path}"),
                source,
            })?;
            Ok(table.with_route(path.clone(), config))
        })
    }

    pub fn key_scheme(&self) -> KeyScheme {
        KeyScheme::new(self.keys.prefix.clone()).include_remote_addr(self.keys.include_remote_addr)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }

    pub fn resolver<C>(&self, source: C) -> Result<LimitResolver, SettingsError>
    where
        C: ConfigSource + 'static,
    {
        Ok(LimitResolver::new(source)
            .with_key_scheme(self.key_scheme())
            .with_routes(self.route_table()?)
            .with_lookup_timeout(self.config_lookup_timeout()?))
    }

    pub fn remote_bucket<S>(&self, store: S) -> Result<RemoteBucket<S>, SettingsError>
    where
        S: TokenBucketStore + 'static,
    {
        Ok(RemoteBucket::new(store).with_timeout(self.remote_timeout()?))
    }

    /// Builder preloaded with everything these settings describe; add a sink or clocks
    /// before calling `build`.
    pub fn controller_builder<S, C>(
        &self,
        store: S,
        source: C,
    ) -> Result<AdmissionControllerBuilder<NullSink>, SettingsError>
    where
        S: TokenBucketStore + 'static,
        C: ConfigSource + 'static,
    {
        Ok(AdmissionController::builder(self.remote_bucket(store)?)
            .breaker(self.breaker_config()?)
            .resolver(self.resolver(source)?)
            .degraded_mode(self.degraded_mode)
            .local_grace(self.local_grace))
    }
}
