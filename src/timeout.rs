//! Explicit per-call deadlines for store and config round trips.

use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Upper bound for a single round-trip deadline.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors produced when validating a timeout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeoutError {
    #[error("timeout must be > 0")]
    Zero,
    #[error("timeout {provided:?} exceeds maximum {max:?}")]
    TooLong { provided: Duration, max: Duration },
}

/// The deadline passed before the operation finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub elapsed: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    duration: Duration,
}

impl TimeoutPolicy {
    /// Create a timeout policy; the duration must be non-zero and at most [`MAX_TIMEOUT`].
    pub fn new(duration: Duration) -> Result<Self, TimeoutError> {
        if duration.is_zero() {
            return Err(TimeoutError::Zero);
        }
        if duration > MAX_TIMEOUT {
            return Err(TimeoutError::TooLong { provided: duration, max: MAX_TIMEOUT });
        }
        Ok(Self { duration })
    }

    /// Inspect the configured timeout duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Drive `operation` to completion or give up once the deadline passes.
    ///
    /// The future is dropped on expiry, so whatever it was doing is abandoned.
    pub async fn run<F>(&self, operation: F) -> Result<F::Output, Elapsed>
    where
        F: Future,
    {
        let start = Instant::now();

        match tokio::time::timeout(self.duration, operation).await {
            Ok(output) => Ok(output),
            Err(_) => Err(Elapsed { elapsed: start.elapsed(), timeout: self.duration }),
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self { duration: Duration::from_millis(500) }
    }
}
