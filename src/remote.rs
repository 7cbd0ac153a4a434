//! Atomic check-and-consume against a shared counter store.
//!
//! The whole read → refill → compare → write sequence runs inside the store as one
//! script call, so callers in different processes never act on a stale token count.
//!
//! # Wire contract
//!
//! - One key per bucket, stored as a hash: `tokens` (decimal string), `grace`, `ts`.
//! - Arguments, in order: `capacity`, `refillRate`, `refillIntervalMs`, `nowMs`,
//!   `graceLimit`, all decimal strings.
//! - Reply: `1` allowed, `0` denied.
//! - First access creates the bucket full, with full grace, stamped `nowMs`.

use crate::bucket::{BucketConfig, BucketState};
use crate::error::{RemoteError, StoreError};
use crate::strategy::BucketStrategy;
use crate::timeout::{Elapsed, TimeoutPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Script reply for an admitted request.
pub const ALLOWED: i64 = 1;
/// Script reply for a denied request.
pub const DENIED: i64 = 0;

/// Lua source of the token-bucket routine. Safe to register any number of times.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local interval = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local grace_limit = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'grace', 'ts')
local tokens = tonumber(state[1])
local grace = tonumber(state[2])
local ts = tonumber(state[3])
if tokens == nil or grace == nil or ts == nil then
  tokens = capacity
  grace = grace_limit
  ts = now
end

if tokens > capacity then tokens = capacity end
if tokens < 0 then tokens = 0 end
if grace > grace_limit then grace = grace_limit end

local elapsed = now - ts
if elapsed > 0 then
  tokens = math.min(capacity, tokens + (elapsed / interval) * refill_rate)
  ts = now
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
elseif grace > 0 then
  grace = grace - 1
  allowed = 1
end

redis.call('HSET', key, 'tokens', string.format('%.17g', tokens), 'grace', grace, 'ts', ts)
return allowed
"#;

/// The five script arguments, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptArgs {
    pub capacity: u32,
    pub refill_rate: u32,
    pub refill_interval_ms: u64,
    pub now_ms: u64,
    pub grace_limit: u32,
}

impl ScriptArgs {
    pub fn new(config: &BucketConfig, now_ms: u64) -> Self {
        Self {
            capacity: config.capacity(),
            refill_rate: config.refill_rate(),
            refill_interval_ms: config.refill_interval_ms(),
            now_ms,
            grace_limit: config.grace_limit(),
        }
    }

    /// Serialize as `ARGV[1..=5]`.
    pub fn to_argv(&self) -> [String; 5] {
        [
            self.capacity.to_string(),
            self.refill_rate.to_string(),
            self.refill_interval_ms.to_string(),
            self.now_ms.to_string(),
            self.grace_limit.to_string(),
        ]
    }

    /// Rebuild the bucket config carried by these arguments.
    pub fn config(&self) -> Option<BucketConfig> {
        BucketConfig::new(self.capacity, self.refill_rate, self.refill_interval_ms, self.grace_limit)
            .ok()
    }
}

/// Transport to a store that can run [`TOKEN_BUCKET_SCRIPT`] atomically for one key.
///
/// Implementations return the raw script reply; [`RemoteBucket`] interprets it.
#[async_trait]
pub trait TokenBucketStore: Send + Sync {
    async fn eval_token_bucket(&self, key: &str, args: &ScriptArgs) -> Result<i64, StoreError>;
}

#[async_trait]
impl<S> TokenBucketStore for Arc<S>
where
    S: TokenBucketStore + ?Sized,
{
    async fn eval_token_bucket(&self, key: &str, args: &ScriptArgs) -> Result<i64, StoreError> {
        (**self).eval_token_bucket(key, args).await
    }
}

/// In-process stand-in for the shared store.
///
/// Runs the same routine as the script under one mutex. Clones share state, so several
/// controllers built over clones of one store behave like several processes sharing a
/// single Redis. Outages and latency can be simulated.
#[derive(Debug, Default, Clone)]
pub struct InMemoryTokenBucketStore {
    data: Arc<Mutex<HashMap<String, BucketState>>>,
    unavailable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    latency: Option<Duration>,
}

impl InMemoryTokenBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before touching state.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make every call fail with [`StoreError::Unavailable`] until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn is_unavailable(&self) -> bool {
        self.unavailable.load(Ordering::SeqCst)
    }

    /// Number of script calls received, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Stored state for `key`, as the script last wrote it.
    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }
}

#[async_trait]
impl TokenBucketStore for InMemoryTokenBucketStore {
    async fn eval_token_bucket(&self, key: &str, args: &ScriptArgs) -> Result<i64, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.is_unavailable() {
            return Err(StoreError::Unavailable("simulated outage".into()));
        }
        let config = args
            .config()
            .ok_or_else(|| StoreError::Script(format!("invalid bucket arguments {:?}", args)))?;

        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let state = guard
            .entry(key.to_string())
            .or_insert_with(|| BucketState::fresh(&config, args.now_ms));
        Ok(match state.try_consume(&config, args.now_ms) {
            Some(_) => ALLOWED,
            None => DENIED,
        })
    }
}

/// Remote token bucket: one bounded round trip per decision.
#[derive(Debug, Clone)]
pub struct RemoteBucket<S> {
    store: Arc<S>,
    timeout: TimeoutPolicy,
}

impl<S> RemoteBucket<S>
where
    S: TokenBucketStore + 'static,
{
    /// Wrap `store` with the default 500 ms per-call timeout.
    pub fn new(store: S) -> Self {
        Self { store: Arc::new(store), timeout: TimeoutPolicy::default() }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.duration()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the script for `key`. Transport failures, timeouts and malformed replies all
    /// come back as `Err`; they are never an allow or a deny.
    pub async fn try_consume(
        &self,
        key: &str,
        config: &BucketConfig,
        now_ms: u64,
    ) -> Result<bool, RemoteError> {
        let args = ScriptArgs::new(config, now_ms);
        match self.timeout.run(self.store.eval_token_bucket(key, &args)).await {
            Err(Elapsed { elapsed, timeout }) => Err(RemoteError::Timeout { elapsed, timeout }),
            Ok(Err(e)) => Err(RemoteError::Store(e)),
            Ok(Ok(ALLOWED)) => Ok(true),
            Ok(Ok(DENIED)) => Ok(false),
            Ok(Ok(other)) => Err(RemoteError::UnexpectedReply(other)),
        }
    }
}

#[async_trait]
impl<S> BucketStrategy for RemoteBucket<S>
where
    S: TokenBucketStore + 'static,
{
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn try_consume(
        &self,
        key: &str,
        config: &BucketConfig,
        now_ms: u64,
    ) -> Result<bool, RemoteError> {
        RemoteBucket::try_consume(self, key, config, now_ms).await
    }
}
