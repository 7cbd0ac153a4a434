//! Process-local token buckets, used as the degraded path when the shared store is out.

use crate::bucket::{BucketConfig, BucketState, TokenKind};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A concurrent, per-key token bucket limiter with grace tokens.
///
/// Buckets are created lazily on first use and live until [`reset`](Self::reset) or
/// [`evict_idle`](Self::evict_idle) removes them. Refill and consume for one key run
/// under that key's own mutex, so different keys never wait on each other beyond the
/// brief map-shard lookup.
#[derive(Debug, Default, Clone)]
pub struct LocalBucket {
    buckets: Arc<DashMap<String, Arc<Mutex<BucketState>>>>,
}

impl LocalBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refill `key`'s bucket to `now_ms`, then consume one normal or grace token.
    pub fn try_consume(&self, key: &str, config: &BucketConfig, now_ms: u64) -> bool {
        self.consume_kind(key, config, now_ms).is_some()
    }

    /// Like [`try_consume`](Self::try_consume) but reports which counter paid.
    pub fn consume_kind(&self, key: &str, config: &BucketConfig, now_ms: u64) -> Option<TokenKind> {
        let cell = self.cell(key, config, now_ms);
        let mut state = lock(&cell);
        let outcome = state.try_consume(config, now_ms);
        tracing::trace!(
            key,
            tokens = state.tokens(),
            grace = state.grace_remaining(),
            allowed = outcome.is_some(),
            "local bucket consume"
        );
        outcome
    }

    /// Current state of `key`'s bucket, without refilling it.
    pub fn snapshot(&self, key: &str) -> Option<BucketState> {
        let cell = self.buckets.get(key).map(|entry| entry.value().clone())?;
        let state = *lock(&cell);
        Some(state)
    }

    /// Drop `key`'s bucket; the next access starts full, grace included.
    pub fn reset(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    /// Remove buckets whose last refill is more than `idle_ms` before `now_ms`.
    ///
    /// Not called by the admission path; schedule it from the host if key cardinality
    /// is unbounded. Returns how many buckets were dropped.
    pub fn evict_idle(&self, now_ms: u64, idle_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, cell| now_ms.saturating_sub(lock(cell).last_refill_ms()) <= idle_ms);
        let evicted = before.saturating_sub(self.buckets.len());
        tracing::debug!(evicted, remaining = self.buckets.len(), "local bucket eviction complete");
        evicted
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn cell(&self, key: &str, config: &BucketConfig, now_ms: u64) -> Arc<Mutex<BucketState>> {
        if let Some(entry) = self.buckets.get(key) {
            return entry.value().clone();
        }
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(BucketState::fresh(config, now_ms))))
            .value()
            .clone()
    }
}

// `BucketState` holds no invariant that an unwind can break halfway; reuse poisoned locks.
fn lock(cell: &Mutex<BucketState>) -> MutexGuard<'_, BucketState> {
    cell.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cfg(capacity: u32, rate: u32, interval: u64, grace: u32) -> BucketConfig {
        BucketConfig::new(capacity, rate, interval, grace).expect("valid config")
    }

    #[test]
    fn allows_up_to_capacity_then_grace_then_denies() {
        let bucket = LocalBucket::new();
        let config = cfg(5, 1, 60_000, 2);
        for i in 0..5 {
            assert_eq!(bucket.consume_kind("k", &config, 0), Some(TokenKind::Normal), "call {i}");
        }
        assert_eq!(bucket.consume_kind("k", &config, 0), Some(TokenKind::Grace));
        assert_eq!(bucket.consume_kind("k", &config, 0), Some(TokenKind::Grace));
        assert!(!bucket.try_consume("k", &config, 0));
    }

    #[test]
    fn independent_keys() {
        let bucket = LocalBucket::new();
        let config = cfg(2, 1, 60_000, 0);
        assert!(bucket.try_consume("a", &config, 0));
        assert!(bucket.try_consume("a", &config, 0));
        assert!(!bucket.try_consume("a", &config, 0));
        assert!(bucket.try_consume("b", &config, 0));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn refills_lazily() {
        let bucket = LocalBucket::new();
        let config = cfg(1, 1, 100, 0);
        assert!(bucket.try_consume("k", &config, 1_000));
        assert!(!bucket.try_consume("k", &config, 1_050));
        assert!(bucket.try_consume("k", &config, 1_100));
    }

    #[test]
    fn clock_going_backwards_does_not_inflate_tokens() {
        let bucket = LocalBucket::new();
        let config = cfg(2, 1, 1_000, 0);
        assert!(bucket.try_consume("k", &config, 50_000));
        assert!(bucket.try_consume("k", &config, 50_000));
        assert!(!bucket.try_consume("k", &config, 10_000));
        let state = bucket.snapshot("k").expect("bucket exists");
        assert_eq!(state.last_refill_ms(), 50_000);
        assert_eq!(state.tokens(), 0.0);
    }

    #[test]
    fn reset_restores_grace() {
        let bucket = LocalBucket::new();
        let config = cfg(1, 1, 60_000, 1);
        assert!(bucket.try_consume("k", &config, 0));
        assert!(bucket.try_consume("k", &config, 0));
        assert!(!bucket.try_consume("k", &config, 0));
        assert!(bucket.reset("k"));
        assert!(!bucket.reset("k"));
        assert_eq!(bucket.snapshot("k"), None);
        assert!(bucket.try_consume("k", &config, 0));
        assert_eq!(bucket.snapshot("k").map(|s| s.grace_remaining()), Some(1));
    }

    #[test]
    fn evict_idle_drops_only_stale_buckets() {
        let bucket = LocalBucket::new();
        let config = cfg(5, 1, 1_000, 0);
        bucket.try_consume("stale", &config, 0);
        bucket.try_consume("fresh", &config, 290_000);
        assert_eq!(bucket.evict_idle(300_000, 60_000), 1);
        assert!(bucket.snapshot("stale").is_none());
        assert!(bucket.snapshot("fresh").is_some());
    }

    #[test]
    fn concurrent_consumers_never_overspend() {
        let bucket = LocalBucket::new();
        let config = cfg(100, 1, 60_000, 10);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = bucket.clone();
                thread::spawn(move || {
                    (0..50).filter(|_| bucket.try_consume("shared", &config, 0)).count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().expect("thread panicked")).sum();
        assert_eq!(allowed, 110);
    }
}
