//! Redis backend for `tollgate` (companion crate).
//! Bring your own `redis::aio::ConnectionManager`, or connect from a URL.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, RedisError, Script};
use std::collections::HashMap;
use tollgate::error::{ConfigError, StoreError};
use tollgate::remote::{ScriptArgs, TokenBucketStore, TOKEN_BUCKET_SCRIPT};
use tollgate::resolver::{ConfigRecord, ConfigSource, LimitingKey};

/// Token-bucket store backed by a Redis server.
///
/// Each call is one `EVALSHA`; when the server does not know the script yet (fresh
/// server, `SCRIPT FLUSH`, failover) it is loaded and the call retried once.
#[derive(Clone)]
pub struct RedisTokenBucketStore {
    conn: ConnectionManager,
    script: Script,
}

impl std::fmt::Debug for RedisTokenBucketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTokenBucketStore")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .field("script_sha", &self.script.get_hash())
            .finish()
    }
}

impl RedisTokenBucketStore {
    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn, script: Script::new(TOKEN_BUCKET_SCRIPT) }
    }

    /// Open a client for `url`, connect, and check the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let mut conn = ConnectionManager::new(client).await.map_err(store_error)?;
        redis::cmd("PING").query_async::<String>(&mut conn).await.map_err(store_error)?;
        tracing::debug!(target: "tollgate::redis", "connected to token bucket store");
        Ok(Self::new(conn))
    }

    /// Load the script so the first admission does not pay for it. Safe to repeat.
    pub async fn register(&self) -> Result<String, StoreError> {
        let mut conn = self.conn.clone();
        let sha = redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(TOKEN_BUCKET_SCRIPT)
            .query_async::<String>(&mut conn)
            .await
            .map_err(store_error)?;
        tracing::debug!(target: "tollgate::redis", sha = %sha, "token bucket script registered");
        Ok(sha)
    }

    /// SHA1 the script is invoked by.
    pub fn script_sha(&self) -> &str {
        self.script.get_hash()
    }

    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl TokenBucketStore for RedisTokenBucketStore {
    async fn eval_token_bucket(&self, key: &str, args: &ScriptArgs) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.script.key(key);
        for arg in args.to_argv() {
            invocation.arg(arg);
        }
        let reply: i64 = invocation.invoke_async(&mut conn).await.map_err(store_error)?;
        Ok(reply)
    }
}

/// Dynamic configuration read from one Redis hash per limiting key.
#[derive(Clone)]
pub struct RedisConfigSource {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfigSource")
            .field("conn", &"<redis::aio::ConnectionManager>")
            .finish()
    }
}

impl RedisConfigSource {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl ConfigSource for RedisConfigSource {
    async fn fetch(&self, key: &LimitingKey) -> Result<Option<ConfigRecord>, ConfigError> {
        let mut conn = self.conn.clone();
        let record: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key.as_str())
            .query_async(&mut conn)
            .await
            .map_err(|e| ConfigError::Unreachable(e.to_string()))?;
        // A missing hash reads as an empty one.
        Ok(if record.is_empty() { None } else { Some(record) })
    }
}

fn store_error(err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_timeout()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
    {
        return StoreError::Unavailable(err.to_string());
    }
    match err.kind() {
        ErrorKind::ResponseError | ErrorKind::NoScriptError | ErrorKind::TypeError => {
            StoreError::Script(err.to_string())
        }
        _ => StoreError::backend(err),
    }
}
