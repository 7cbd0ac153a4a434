//! Limiting-key derivation and bucket configuration lookup.
//!
//! # Keys
//!
//! The first identity present wins, and every form ends with the request path:
//!
//! | present                         | key                          |
//! |---------------------------------|------------------------------|
//! | user id                         | `rate:user:{user}:{path}`    |
//! | client id                       | `rate:client:{client}:{path}`|
//! | remote address (opt-in)         | `rate:ip:{addr}:{path}`      |
//! | path                            | `rate:api:{path}`            |
//! | nothing                         | `rate:global`                |
//!
//! Loopback and unspecified addresses never key a bucket, IPv4-mapped IPv6 forms
//! included. A scope, when set, is appended as `:{scope}` so two handlers on one path can
//! keep separate budgets.
//!
//! Every part after the prefix has `%` written as `%25` and `:` as `%3A`, so `:` only ever
//! separates parts and two different requests cannot share a key.
//!
//! # Configuration
//!
//! Each field is taken from the dynamic record stored under the key when it parses, else
//! from the static route table entry for the path, else from the table's global default.
//! Resolution never fails.

use crate::adaptive::DynamicConfig;
use crate::bucket::BucketConfig;
use crate::error::ConfigError;
use crate::timeout::{Elapsed, TimeoutPolicy};
use async_trait::async_trait;
use dashmap::DashMap;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Field names of a dynamic configuration record.
pub const FIELD_MAX_TOKENS: &str = "maxTokens";
pub const FIELD_REFILL_RATE: &str = "refillRate";
pub const FIELD_REFILL_INTERVAL_MS: &str = "refillIntervalMs";
pub const FIELD_GRACE_LIMIT: &str = "graceLimit";

/// Raw dynamic configuration record: field name to decimal string.
pub type ConfigRecord = HashMap<String, String>;

/// Identity attributes of one inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestAttributes {
    user_id: Option<String>,
    client_id: Option<String>,
    remote_addr: Option<IpAddr>,
    path: String,
    scope: Option<String>,
}

impl RequestAttributes {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), ..Self::default() }
    }

    /// Authenticated user identifier.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Client identifier, typically from a request header.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Per-handler suffix appended to the key.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        non_blank(self.user_id.as_deref())
    }

    pub fn client_id(&self) -> Option<&str> {
        non_blank(self.client_id.as_deref())
    }

    /// Remote address, unless it is loopback or unspecified. IPv4-mapped IPv6 addresses
    /// are reported as IPv4.
    pub fn remote_addr(&self) -> Option<IpAddr> {
        let addr = match self.remote_addr? {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(IpAddr::V6(v6), IpAddr::V4),
            v4 => v4,
        };
        (!addr.is_loopback() && !addr.is_unspecified()).then_some(addr)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn scope(&self) -> Option<&str> {
        non_blank(self.scope.as_deref())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// The identity one bucket is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LimitingKey(String);

impl LimitingKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl From<&str> for LimitingKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl From<String> for LimitingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl AsRef<str> for LimitingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LimitingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How keys are spelled.
///
/// Parts are joined with `:`. Identifiers, address, path and scope are escaped (`%` to
/// `%25`, `:` to `%3A`) before joining; the prefix is used as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScheme {
    prefix: String,
    include_remote_addr: bool,
}

impl Default for KeyScheme {
    fn default() -> Self {
        Self { prefix: "rate".to_string(), include_remote_addr: false }
    }
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), ..Self::default() }
    }

    /// Key anonymous callers by their (non-loopback) address before falling back to the
    /// path-only key.
    pub fn include_remote_addr(mut self, include: bool) -> Self {
        self.include_remote_addr = include;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn key_for(&self, attrs: &RequestAttributes) -> LimitingKey {
        let prefix = &self.prefix;
        let path = escape_part(attrs.path());
        let mut key = if let Some(user) = attrs.user_id() {
            format!("{prefix}:user:{}:{path}", escape_part(user))
        } else if let Some(client) = attrs.client_id() {
            format!("{prefix}:client:{}:{path}", escape_part(client))
        } else if let Some(addr) = attrs.remote_addr().filter(|_| self.include_remote_addr) {
            format!("{prefix}:ip:{}:{path}", escape_part(&addr.to_string()))
        } else if !path.is_empty() {
            format!("{prefix}:api:{path}")
        } else {
            format!("{prefix}:global")
        };
        if let Some(scope) = attrs.scope() {
            key.push(':');
            key.push_str(&escape_part(scope));
        }
        LimitingKey(key)
    }
}

fn escape_part(part: &str) -> Cow<'_, str> {
    if !part.contains(|c| c == '%' || c == ':') {
        return Cow::Borrowed(part);
    }
    let mut out = String::with_capacity(part.len() + 4);
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Static per-path limits plus the terminal default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteTable {
    routes: HashMap<String, BucketConfig>,
    default: BucketConfig,
}

impl RouteTable {
    pub fn new(default: BucketConfig) -> Self {
        Self { routes: HashMap::new(), default }
    }

    pub fn with_route(mut self, path: impl Into<String>, config: BucketConfig) -> Self {
        self.insert(path, config);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, config: BucketConfig) -> Option<BucketConfig> {
        self.routes.insert(path.into(), config)
    }

    pub fn remove(&mut self, path: &str) -> Option<BucketConfig> {
        self.routes.remove(path)
    }

    pub fn route(&self, path: &str) -> Option<&BucketConfig> {
        self.routes.get(path)
    }

    pub fn default_config(&self) -> &BucketConfig {
        &self.default
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Static configuration for `path` and where it came from.
    pub fn lookup(&self, path: &str) -> (BucketConfig, ConfigOrigin) {
        match self.routes.get(path) {
            Some(config) => (*config, ConfigOrigin::Route),
            None => (self.default, ConfigOrigin::Default),
        }
    }
}

/// Which layer supplied a resolved configuration. `Dynamic` means at least one field
/// came from the dynamic record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    Dynamic,
    Route,
    Default,
}

impl fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigOrigin::Dynamic => write!(f, "dynamic"),
            ConfigOrigin::Route => write!(f, "route"),
            ConfigOrigin::Default => write!(f, "default"),
        }
    }
}

/// External store of per-key configuration records.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// The record stored under `key`, or `None` if there is none.
    async fn fetch(&self, key: &LimitingKey) -> Result<Option<ConfigRecord>, ConfigError>;
}

#[async_trait]
impl<C> ConfigSource for Arc<C>
where
    C: ConfigSource + ?Sized,
{
    async fn fetch(&self, key: &LimitingKey) -> Result<Option<ConfigRecord>, ConfigError> {
        (**self).fetch(key).await
    }
}

/// A source with no records; every key resolves from the route table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoConfigSource;

#[async_trait]
impl ConfigSource for NoConfigSource {
    async fn fetch(&self, _key: &LimitingKey) -> Result<Option<ConfigRecord>, ConfigError> {
        Ok(None)
    }
}

/// Concurrent in-process record store. Clones share records.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConfigSource {
    records: Arc<DashMap<String, ConfigRecord>>,
    unreachable: Arc<AtomicBool>,
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a complete, well-formed record for `key`.
    pub fn insert(&self, key: impl Into<String>, config: &BucketConfig) {
        let record = ConfigRecord::from([
            (FIELD_MAX_TOKENS.to_string(), config.capacity().to_string()),
            (FIELD_REFILL_RATE.to_string(), config.refill_rate().to_string()),
            (FIELD_REFILL_INTERVAL_MS.to_string(), config.refill_interval_ms().to_string()),
            (FIELD_GRACE_LIMIT.to_string(), config.grace_limit().to_string()),
        ]);
        self.records.insert(key.into(), record);
    }

    /// Set one raw field, creating the record if needed.
    pub fn set_field(&self, key: impl Into<String>, field: &str, value: impl Into<String>) {
        self.records.entry(key.into()).or_default().insert(field.to_string(), value.into());
    }

    pub fn remove(&self, key: &str) -> bool {
        self.records.remove(key).is_some()
    }

    /// Make every fetch fail until switched back.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn fetch(&self, key: &LimitingKey) -> Result<Option<ConfigRecord>, ConfigError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(ConfigError::Unreachable("simulated outage".into()));
        }
        Ok(self.records.get(key.as_str()).map(|r| r.value().clone()))
    }
}

/// Key and configuration for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub key: LimitingKey,
    pub config: BucketConfig,
    pub origin: ConfigOrigin,
}

/// Turns request attributes into a limiting key and its bucket configuration.
#[derive(Clone)]
pub struct LimitResolver {
    scheme: KeyScheme,
    routes: DynamicConfig<RouteTable>,
    source: Arc<dyn ConfigSource>,
    lookup_timeout: TimeoutPolicy,
}

impl fmt::Debug for LimitResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitResolver")
            .field("scheme", &self.scheme)
            .field("routes", &self.routes)
            .field("lookup_timeout", &self.lookup_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for LimitResolver {
    fn default() -> Self {
        Self::new(NoConfigSource)
    }
}

impl LimitResolver {
    pub fn new<C>(source: C) -> Self
    where
        C: ConfigSource + 'static,
    {
        Self {
            scheme: KeyScheme::default(),
            routes: DynamicConfig::new(RouteTable::default()),
            source: Arc::new(source),
            lookup_timeout: TimeoutPolicy::default(),
        }
    }

    pub fn with_key_scheme(mut self, scheme: KeyScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_routes(self, routes: RouteTable) -> Self {
        self.routes.set(routes);
        self
    }

    /// Bound on each dynamic config fetch.
    pub fn with_lookup_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Live handle to the static route table; updates apply to the next resolution.
    pub fn routes(&self) -> &DynamicConfig<RouteTable> {
        &self.routes
    }

    pub fn key_scheme(&self) -> &KeyScheme {
        &self.scheme
    }

    pub fn resolve_key(&self, attrs: &RequestAttributes) -> LimitingKey {
        self.scheme.key_for(attrs)
    }

    /// Configuration for `key`, with `path` selecting the static fallback.
    pub async fn resolve_config(&self, key: &LimitingKey, path: &str) -> (BucketConfig, ConfigOrigin) {
        let (fallback, fallback_origin) = self.routes.get().lookup(path);
        let record = match self.lookup_timeout.run(self.source.fetch(key)).await {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => return (fallback, fallback_origin),
            Ok(Err(err)) => {
                tracing::warn!(key = %key, error = %err, "config source failed; using static config");
                return (fallback, fallback_origin);
            }
            Err(Elapsed { timeout, .. }) => {
                let err = ConfigError::Timeout(timeout);
                tracing::warn!(key = %key, error = %err, "config source failed; using static config");
                return (fallback, fallback_origin);
            }
        };
        merge_record(key, &record, fallback, fallback_origin)
    }

    pub async fn resolve(&self, attrs: &RequestAttributes) -> Resolution {
        let key = self.resolve_key(attrs);
        let (config, origin) = self.resolve_config(&key, attrs.path()).await;
        tracing::trace!(key = %key, %origin, ?config, "resolved limits");
        Resolution { key, config, origin }
    }
}

fn merge_record(
    key: &LimitingKey,
    record: &ConfigRecord,
    fallback: BucketConfig,
    fallback_origin: ConfigOrigin,
) -> (BucketConfig, ConfigOrigin) {
    let mut used = false;
    let capacity = parse_field::<u32>(key, record, FIELD_MAX_TOKENS, true, &mut used);
    let refill_rate = parse_field::<u32>(key, record, FIELD_REFILL_RATE, true, &mut used);
    let refill_interval_ms =
        parse_field::<u64>(key, record, FIELD_REFILL_INTERVAL_MS, true, &mut used);
    let grace_limit = parse_field::<u32>(key, record, FIELD_GRACE_LIMIT, false, &mut used);

    if !used {
        return (fallback, fallback_origin);
    }
    let merged = BucketConfig::new(
        capacity.unwrap_or(fallback.capacity()),
        refill_rate.unwrap_or(fallback.refill_rate()),
        refill_interval_ms.unwrap_or(fallback.refill_interval_ms()),
        grace_limit.unwrap_or(fallback.grace_limit()),
    );
    match merged {
        Ok(config) => (config, ConfigOrigin::Dynamic),
        Err(_) => (fallback, fallback_origin),
    }
}

/// Parses one record field into its target width. A value that does not fit `T`, or a zero
/// where `positive` is required, is logged and skipped.
fn parse_field<T>(
    key: &LimitingKey,
    record: &ConfigRecord,
    name: &str,
    positive: bool,
    used: &mut bool,
) -> Option<T>
where
    T: FromStr + Default + PartialEq,
{
    let raw = record.get(name)?;
    match raw.trim().parse::<T>() {
        Ok(v) if !(positive && v == T::default()) => {
            *used = true;
            Some(v)
        }
        _ => {
            tracing::warn!(key = %key, field = name, value = %raw, "ignoring malformed config field");
            None
        }
    }
}
