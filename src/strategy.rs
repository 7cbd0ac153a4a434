//! The one seam every bucket backend plugs into.

use crate::bucket::BucketConfig;
use crate::error::RemoteError;
use crate::local::LocalBucket;
use async_trait::async_trait;

/// A token-bucket backend: refill `key` to `now_ms` and try to consume one token.
///
/// `Ok(true)` admits, `Ok(false)` denies. `Err` means the backend could not answer at
/// all and must not be read as either.
#[async_trait]
pub trait BucketStrategy: Send + Sync {
    /// Label used in logs and diagnostics.
    fn name(&self) -> &'static str;

    async fn try_consume(
        &self,
        key: &str,
        config: &BucketConfig,
        now_ms: u64,
    ) -> Result<bool, RemoteError>;
}

#[async_trait]
impl BucketStrategy for LocalBucket {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn try_consume(
        &self,
        key: &str,
        config: &BucketConfig,
        now_ms: u64,
    ) -> Result<bool, RemoteError> {
        Ok(LocalBucket::try_consume(self, key, config, now_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn local_bucket_is_an_infallible_strategy() {
        let strategy: Arc<dyn BucketStrategy> = Arc::new(LocalBucket::new());
        let config = BucketConfig::new(1, 1, 60_000, 0).unwrap();
        assert_eq!(strategy.name(), "local");
        assert!(strategy.try_consume("k", &config, 0).await.unwrap());
        assert!(!strategy.try_consume("k", &config, 0).await.unwrap());
    }
}
