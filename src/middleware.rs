//! Tower middleware that runs admission before the wrapped service.
//!
//! The layer knows nothing about the transport: a caller-supplied extractor turns each
//! request into [`RequestAttributes`], and a denial comes back as
//! [`AdmissionError::RateLimited`] for the transport to map to `429` with `Retry-After`.

use crate::controller::AdmissionController;
use crate::error::AdmissionError;
use crate::resolver::RequestAttributes;
use crate::telemetry::TelemetrySink;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// `Retry-After` suggested on denial unless overridden.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// A layer that admits requests through an [`AdmissionController`].
pub struct AdmissionLayer<S, F> {
    controller: Arc<AdmissionController<S>>,
    extractor: Arc<F>,
    retry_after: Duration,
}

impl<S, F> Clone for AdmissionLayer<S, F> {
    fn clone(&self) -> Self {
        Self {
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
            retry_after: self.retry_after,
        }
    }
}

impl<S: fmt::Debug, F> fmt::Debug for AdmissionLayer<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("controller", &self.controller)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

impl<S, F> AdmissionLayer<S, F> {
    /// `extractor` maps each request to the attributes its key is derived from.
    pub fn new(controller: AdmissionController<S>, extractor: F) -> Self {
        Self {
            controller: Arc::new(controller),
            extractor: Arc::new(extractor),
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }
}

impl<Inner, S, F> Layer<Inner> for AdmissionLayer<S, F> {
    type Service = AdmissionService<Inner, S, F>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AdmissionService {
            inner,
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
            retry_after: self.retry_after,
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
pub struct AdmissionService<Inner, S, F> {
    inner: Inner,
    controller: Arc<AdmissionController<S>>,
    extractor: Arc<F>,
    retry_after: Duration,
}

impl<Inner: Clone, S, F> Clone for AdmissionService<Inner, S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            controller: self.controller.clone(),
            extractor: self.extractor.clone(),
            retry_after: self.retry_after,
        }
    }
}

impl<Inner: fmt::Debug, S: fmt::Debug, F> fmt::Debug for AdmissionService<Inner, S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("controller", &self.controller)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

impl<Inner, S, F, Req> Service<Req> for AdmissionService<Inner, S, F>
where
    Inner: Service<Req> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    Inner::Response: Send + 'static,
    Inner::Error: Send + 'static,
    S: TelemetrySink,
    F: Fn(&Req) -> RequestAttributes + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = Inner::Response;
    type Error = AdmissionError<Inner::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let attrs = (self.extractor)(&req);
        let controller = self.controller.clone();
        let retry_after = self.retry_after;
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let admission = controller.evaluate_now(&attrs).await;
            if admission.allowed {
                inner.call(req).await.map_err(AdmissionError::Inner)
            } else {
                tracing::debug!(key = %admission.key, ?retry_after, "rejecting request");
                Err(AdmissionError::RateLimited { key: admission.key, retry_after })
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketConfig;
    use crate::resolver::{LimitResolver, RouteTable};
    use crate::remote::{InMemoryTokenBucketStore, RemoteBucket};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    #[derive(Debug)]
    struct Request {
        path: &'static str,
        user: Option<&'static str>,
    }

    fn attrs(req: &Request) -> RequestAttributes {
        let attrs = RequestAttributes::new(req.path);
        match req.user {
            Some(user) => attrs.with_user_id(user),
            None => attrs,
        }
    }

    fn controller(capacity: u32) -> AdmissionController {
        AdmissionController::builder(RemoteBucket::new(InMemoryTokenBucketStore::new()))
            .resolver(LimitResolver::default().with_routes(RouteTable::new(
                BucketConfig::new(capacity, 1, 60_000, 0).unwrap(),
            )))
            .build()
    }

    #[tokio::test]
    async fn denied_requests_never_reach_the_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let handler = service_fn(move |req: Request| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(req.path)
            }
        });
        let svc = ServiceBuilder::new()
            .layer(AdmissionLayer::new(controller(2), attrs).with_retry_after(Duration::from_secs(5)))
            .service(handler);

        for _ in 0..2 {
            let out = svc.clone().oneshot(Request { path: "/ping", user: Some("u1") }).await;
            assert_eq!(out.unwrap(), "/ping");
        }
        let err = svc.clone().oneshot(Request { path: "/ping", user: Some("u1") }).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert!(err.to_string().contains("rate:user:u1:/ping"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let other_user = svc.oneshot(Request { path: "/ping", user: Some("u2") }).await;
        assert!(other_user.is_ok(), "budgets are per key");
    }

    #[tokio::test]
    async fn inner_errors_pass_through() {
        let handler = service_fn(|_req: Request| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "boom"))
        });
        let layer = AdmissionLayer::new(controller(5), attrs);
        assert_eq!(layer.retry_after, DEFAULT_RETRY_AFTER);
        let svc = layer.layer(handler);
        let err = svc.oneshot(Request { path: "/x", user: None }).await.unwrap_err();
        assert!(!err.is_rate_limited());
        assert_eq!(err.into_inner().map(|e| e.to_string()), Some("boom".to_string()));
    }
}
