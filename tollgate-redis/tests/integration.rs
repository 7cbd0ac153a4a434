use tollgate::resolver::{FIELD_GRACE_LIMIT, FIELD_MAX_TOKENS};
use tollgate::{
    BucketConfig, ConfigOrigin, ConfigSource, LimitResolver, LimitingKey, RemoteBucket,
    RequestAttributes,
};
use tollgate_redis::{RedisConfigSource, RedisTokenBucketStore};

// Requires Redis running. If TOLLGATE_TEST_REDIS_URL is unset, the tests skip.
fn redis_url() -> Option<String> {
    match std::env::var("TOLLGATE_TEST_REDIS_URL") {
        Ok(v) => Some(v),
        Err(_) => {
            eprintln!("skipping: set TOLLGATE_TEST_REDIS_URL (e.g. redis://127.0.0.1:6379)");
            None
        }
    }
}

async fn cleanup(store: &RedisTokenBucketStore, key: &str) {
    let mut conn = store.connection();
    let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await.expect("cleanup failed");
}

#[tokio::test]
async fn script_enforces_capacity_then_grace() {
    let Some(url) = redis_url() else { return };
    let store = RedisTokenBucketStore::connect(&url)
        .await
        .unwrap_or_else(|e| panic!("Failed to connect to redis at '{}': {}", url, e));
    let sha = store.register().await.expect("script load");
    assert_eq!(sha, store.script_sha());
    // registering twice is harmless
    store.register().await.expect("second script load");

    let key = format!("rate:test:{}", uuid::Uuid::new_v4());
    let bucket = RemoteBucket::new(store.clone());
    let config = BucketConfig::new(3, 1, 1_000, 1).unwrap();

    let mut allowed = 0;
    for _ in 0..6 {
        if bucket.try_consume(&key, &config, 10_000).await.expect("script call") {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 4, "3 tokens + 1 grace");

    // one interval later exactly one token is back; grace is not
    assert!(bucket.try_consume(&key, &config, 11_000).await.unwrap());
    assert!(!bucket.try_consume(&key, &config, 11_000).await.unwrap());

    // a caller whose clock runs behind mints nothing and leaves ts alone
    assert!(!bucket.try_consume(&key, &config, 5_000).await.unwrap());
    let mut conn = store.connection();
    let ts: String = redis::cmd("HGET").arg(&key).arg("ts").query_async(&mut conn).await.expect("hget");
    assert_eq!(ts.parse::<f64>().expect("numeric ts"), 11_000.0);

    // refill resumes from 11_000, not 5_000
    let mut later = 0;
    for _ in 0..3 {
        if bucket.try_consume(&key, &config, 12_000).await.unwrap() {
            later += 1;
        }
    }
    assert_eq!(later, 1);

    cleanup(&store, &key).await;
}

#[tokio::test]
async fn config_source_reads_per_key_hash() {
    let Some(url) = redis_url() else { return };
    let store = RedisTokenBucketStore::connect(&url).await.expect("connect");
    let source = RedisConfigSource::new(store.connection());

    let key = format!("rate:user:{}", uuid::Uuid::new_v4());
    let limiting_key = LimitingKey::from(key.as_str());
    assert!(source.fetch(&limiting_key).await.expect("fetch").is_none());

    let mut conn = store.connection();
    let _: () = redis::cmd("HSET")
        .arg(&key)
        .arg(FIELD_MAX_TOKENS)
        .arg("42")
        .arg(FIELD_GRACE_LIMIT)
        .arg("0")
        .query_async(&mut conn)
        .await
        .expect("hset");

    let record = source.fetch(&limiting_key).await.expect("fetch").expect("record");
    assert_eq!(record.get(FIELD_MAX_TOKENS).map(String::as_str), Some("42"));

    let resolver = LimitResolver::new(source);
    let (config, origin) = resolver.resolve_config(&limiting_key, "/orders").await;
    assert_eq!(origin, ConfigOrigin::Dynamic);
    assert_eq!(config.capacity(), 42);
    assert_eq!(config.grace_limit(), 0);
    // unset fields come from the static default
    assert_eq!(config.refill_interval_ms(), BucketConfig::default().refill_interval_ms());

    let attrs = RequestAttributes::new("/orders");
    assert_eq!(resolver.resolve_key(&attrs).as_str(), "rate:api:/orders");

    cleanup(&store, &key).await;
}
