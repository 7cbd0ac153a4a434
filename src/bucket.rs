//! Token-bucket quantities and the refill/consume rule shared by every backend.
//!
//! The rule is lazy: nothing refills in the background. Each access credits
//! `elapsed / refill_interval_ms * refill_rate` tokens (fractional, capped at
//! `capacity`) and then tries to take one normal token, falling back to one grace token.

use thiserror::Error;

const DEFAULT_CAPACITY: u32 = 5;
const DEFAULT_REFILL_RATE: u32 = 1;
const DEFAULT_REFILL_INTERVAL_MS: u64 = 60_000;
const DEFAULT_GRACE_LIMIT: u32 = 2;

/// Errors produced when validating a bucket configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketConfigError {
    #[error("capacity must be > 0")]
    ZeroCapacity,
    #[error("refill_rate must be > 0")]
    ZeroRefillRate,
    #[error("refill_interval_ms must be > 0")]
    ZeroRefillInterval,
}

/// Validated, immutable limits for one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketConfig {
    capacity: u32,
    refill_rate: u32,
    refill_interval_ms: u64,
    grace_limit: u32,
}

impl BucketConfig {
    /// Create a config; every field but `grace_limit` must be positive.
    pub fn new(
        capacity: u32,
        refill_rate: u32,
        refill_interval_ms: u64,
        grace_limit: u32,
    ) -> Result<Self, BucketConfigError> {
        if capacity == 0 {
            return Err(BucketConfigError::ZeroCapacity);
        }
        if refill_rate == 0 {
            return Err(BucketConfigError::ZeroRefillRate);
        }
        if refill_interval_ms == 0 {
            return Err(BucketConfigError::ZeroRefillInterval);
        }
        Ok(Self { capacity, refill_rate, refill_interval_ms, grace_limit })
    }

    /// Maximum number of normal tokens.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens credited per `refill_interval_ms`.
    pub fn refill_rate(&self) -> u32 {
        self.refill_rate
    }

    pub fn refill_interval_ms(&self) -> u64 {
        self.refill_interval_ms
    }

    /// Extra, non-refilling tokens granted once normal tokens run out.
    pub fn grace_limit(&self) -> u32 {
        self.grace_limit
    }

    /// Same total budget with grace folded into capacity, for fallbacks that keep no
    /// separate grace counter.
    pub fn with_folded_grace(&self) -> Self {
        Self {
            capacity: self.capacity.saturating_add(self.grace_limit),
            grace_limit: 0,
            ..*self
        }
    }
}

impl Default for BucketConfig {
    /// Terminal default used when neither dynamic nor route configuration applies:
    /// 5 tokens, 1 per minute, 2 grace.
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            refill_rate: DEFAULT_REFILL_RATE,
            refill_interval_ms: DEFAULT_REFILL_INTERVAL_MS,
            grace_limit: DEFAULT_GRACE_LIMIT,
        }
    }
}

/// Which counter paid for an admitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Normal,
    Grace,
}

/// Mutable bucket quantities for one limiting key.
///
/// Invariants: `0 <= tokens <= capacity`, `grace_remaining <= grace_limit`, and
/// `last_refill_ms` never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    tokens: f64,
    grace_remaining: u32,
    last_refill_ms: u64,
}

impl BucketState {
    /// Full bucket with full grace, as created on first access.
    pub fn fresh(config: &BucketConfig, now_ms: u64) -> Self {
        Self {
            tokens: f64::from(config.capacity),
            grace_remaining: config.grace_limit,
            last_refill_ms: now_ms,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn grace_remaining(&self) -> u32 {
        self.grace_remaining
    }

    pub fn last_refill_ms(&self) -> u64 {
        self.last_refill_ms
    }

    /// Credit tokens for the time elapsed since the last refill.
    ///
    /// A `now_ms` at or before `last_refill_ms` credits nothing and leaves the
    /// timestamp where it is.
    pub fn refill(&mut self, config: &BucketConfig, now_ms: u64) {
        self.clamp(config);
        if now_ms <= self.last_refill_ms {
            return;
        }
        let elapsed = (now_ms - self.last_refill_ms) as f64;
        let credit = elapsed / config.refill_interval_ms as f64 * f64::from(config.refill_rate);
        self.tokens = (self.tokens + credit).min(f64::from(config.capacity));
        self.last_refill_ms = now_ms;
    }

    /// Refill, then take one normal token or, failing that, one grace token.
    pub fn try_consume(&mut self, config: &BucketConfig, now_ms: u64) -> Option<TokenKind> {
        self.refill(config, now_ms);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Some(TokenKind::Normal)
        } else if self.grace_remaining > 0 {
            self.grace_remaining -= 1;
            Some(TokenKind::Grace)
        } else {
            None
        }
    }

    /// Keep the counters inside a config that may have shrunk since the state was created.
    fn clamp(&mut self, config: &BucketConfig) {
        self.tokens = self.tokens.clamp(0.0, f64::from(config.capacity));
        self.grace_remaining = self.grace_remaining.min(config.grace_limit);
    }
}
