use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tollgate::{
    AdmissionController, AdmissionError, AdmissionLayer, InMemoryTokenBucketStore, KeyScheme,
    LimitResolver, ManualClock, RemoteBucket, RequestAttributes,
};
use tower::{service_fn, ServiceBuilder, ServiceExt};

#[derive(Debug, Clone)]
struct HttpRequest {
    path: String,
    api_key: Option<String>,
    peer: IpAddr,
}

impl HttpRequest {
    fn new(path: &str) -> Self {
        Self { path: path.to_string(), api_key: None, peer: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)) }
    }

    fn with_api_key(mut self, key: &str) -> Self {
        self.api_key = Some(key.to_string());
        self
    }
}

fn extract(req: &HttpRequest) -> RequestAttributes {
    let attrs = RequestAttributes::new(req.path.clone()).with_remote_addr(req.peer);
    match &req.api_key {
        Some(key) => attrs.with_client_id(key.clone()),
        None => attrs,
    }
}

/// Maps an admission outcome to a status code and an optional `Retry-After` in seconds.
fn status<E>(result: Result<u16, AdmissionError<E>>) -> (u16, Option<u64>) {
    match result {
        Ok(code) => (code, None),
        Err(err) => match err.retry_after() {
            Some(after) => (429, Some(after.as_secs())),
            None => (500, None),
        },
    }
}

#[tokio::test]
async fn rejects_with_429_and_retry_after() {
    let clock = ManualClock::new(0);
    let controller = AdmissionController::builder(RemoteBucket::new(InMemoryTokenBucketStore::new()))
        .clock(clock.clone())
        .build();
    let handler = service_fn(|_req: HttpRequest| async { Ok::<_, Infallible>(200u16) });
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(controller, extract).with_retry_after(Duration::from_secs(30)))
        .service(handler);

    let req = HttpRequest::new("/orders").with_api_key("acme");
    let mut codes = Vec::new();
    for _ in 0..8 {
        codes.push(status(svc.clone().oneshot(req.clone()).await));
    }
    assert!(codes[..7].iter().all(|c| *c == (200, None)));
    assert_eq!(codes[7], (429, Some(30)));

    clock.advance(60_000);
    assert_eq!(status(svc.clone().oneshot(req).await), (200, None));
}

#[tokio::test]
async fn peer_address_keys_only_when_enabled() {
    let resolver = LimitResolver::default().with_key_scheme(KeyScheme::default().include_remote_addr(true));
    let controller = AdmissionController::builder(RemoteBucket::new(InMemoryTokenBucketStore::new()))
        .resolver(resolver)
        .build();
    let handler = service_fn(|_req: HttpRequest| async { Ok::<_, Infallible>(200u16) });
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(controller, extract))
        .service(handler);

    let err = loop {
        match svc.clone().oneshot(HttpRequest::new("/orders")).await {
            Ok(_) => continue,
            Err(err) => break err,
        }
    };
    assert!(err.to_string().contains("rate:ip:203.0.113.7:/orders"), "{err}");

    // A different peer has its own budget.
    let mut other = HttpRequest::new("/orders");
    other.peer = IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1));
    assert!(svc.oneshot(other).await.is_ok());
}

#[tokio::test]
async fn outage_is_invisible_to_callers() {
    let store = InMemoryTokenBucketStore::new();
    store.set_unavailable(true);
    let controller = AdmissionController::builder(RemoteBucket::new(store)).build();
    let handler = service_fn(|_req: HttpRequest| async { Ok::<_, Infallible>(200u16) });
    let svc = ServiceBuilder::new()
        .layer(AdmissionLayer::new(controller, extract))
        .service(handler);

    let req = HttpRequest::new("/orders").with_api_key("acme");
    let mut ok = 0;
    let mut limited = 0;
    for _ in 0..10 {
        match status(svc.clone().oneshot(req.clone()).await) {
            (200, _) => ok += 1,
            (429, _) => limited += 1,
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!((ok, limited), (7, 3));
}
