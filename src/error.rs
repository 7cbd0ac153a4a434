//! Error types shared across the admission pipeline.
//!
//! None of these ever reach the caller of [`AdmissionController::admit`](crate::AdmissionController::admit):
//! store and config failures are absorbed by the guard and the resolver. They exist so the
//! layers in between can tell failures apart and report them.
use crate::resolver::LimitingKey;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`TokenBucketStore`](crate::remote::TokenBucketStore) transport.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, dropped, or the store is otherwise unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered but refused or failed to run the script.
    #[error("store script error: {0}")]
    Script(String),
    /// Any other backend-specific failure.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap an arbitrary backend error.
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        StoreError::Backend(Box::new(err))
    }
}

/// Failure of one remote check-and-consume round trip.
///
/// Never an allow or a deny: the guard decides what to do with it.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The round trip exceeded the configured timeout.
    #[error("remote call timed out after {elapsed:?} (limit: {timeout:?})")]
    Timeout { elapsed: Duration, timeout: Duration },
    /// The transport or the store failed.
    #[error("remote store failed: {0}")]
    Store(#[from] StoreError),
    /// The script returned something other than the `0`/`1` discriminator.
    #[error("unexpected script reply {0} (expected 0 or 1)")]
    UnexpectedReply(i64),
}

impl RemoteError {
    /// Check if this error is due to timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Short label used in logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::Store(StoreError::Unavailable(_)) => "unavailable",
            Self::Store(StoreError::Script(_)) => "script",
            Self::Store(StoreError::Backend(_)) => "backend",
            Self::UnexpectedReply(_) => "unexpected_reply",
        }
    }
}

/// Failure to read the dynamic configuration source. Always recovered by falling back.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config source unreachable: {0}")]
    Unreachable(String),
    #[error("config lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Error returned by [`AdmissionService`](crate::middleware::AdmissionService).
#[derive(Debug, Clone)]
pub enum AdmissionError<E> {
    /// The request was denied; the transport should answer 429 with `Retry-After`.
    RateLimited { key: LimitingKey, retry_after: Duration },
    /// The wrapped service failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for AdmissionError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimited { key, retry_after } => {
                write!(f, "rate limit exceeded for {} (retry after {:?})", key, retry_after)
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for AdmissionError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}

impl<E> AdmissionError<E> {
    /// Check if the request was rejected by the limiter.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// Suggested `Retry-After` for a rejection.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            Self::Inner(_) => None,
        }
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RateLimited { .. } => None,
        }
    }
}
