//! Policy behavior through the full engine: caching, SWR, dedupe, and
//! rate limiting.

use async_trait::async_trait;
use http::Method;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use surefetch::{
    AbortController, BucketConfig, CacheItem, CacheOptions, CacheRule, CacheSettings,
    CacheStore, CallOptions, EngineOptions, EventName, FetchEngine, FetchError, PolicyToggle,
    RequestContext, ResolvedCall, ResponseData, ResponseEnvelope, ResponseType, RouteMatch,
    Rule, StoreResult, ThrottleOptions, ThrottleRule, ThrottleSettings,
};
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn stored_envelope(verb: Method, url: &str, data: serde_json::Value) -> ResponseEnvelope {
    let parsed = url::Url::parse(url).unwrap();
    ResponseEnvelope {
        data: ResponseData::Json(data),
        headers: HashMap::new(),
        status: http::StatusCode::OK,
        request: RequestContext {
            method: verb.clone(),
            path: parsed.path().to_string(),
            url: parsed,
            headers: HashMap::new(),
            query: HashMap::new(),
            body: None,
            state: HashMap::new(),
            attempt: 1,
            signal: AbortController::new().signal(),
        },
        config: ResolvedCall {
            method: verb,
            url: url.to_string(),
            timeout: None,
            response_type: ResponseType::Json,
        },
    }
}

fn record_events(engine: &FetchEngine) -> Arc<Mutex<Vec<EventName>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    engine.on(regex::Regex::new("^fetch-").unwrap(), move |event| {
        sink.lock().unwrap().push(event.name);
    });
    seen
}

#[tokio::test]
async fn fresh_cache_hit_skips_the_network_entirely() {
    let server = MockServer::start().await;
    let engine = FetchEngine::new(EngineOptions::new(server.uri()).cache(
        PolicyToggle::Configured(
            CacheOptions::new(CacheSettings {
                ttl: Duration::from_secs(60),
                stale_in: Some(Duration::from_secs(30)),
                ..Default::default()
            })
            .rule(
                Rule::new(RouteMatch::StartsWith("/u".into()), CacheRule::default())
                    .methods([Method::GET]),
            ),
        ),
    ))
    .unwrap();

    let key = engine.cache_key(Method::GET, "/u/1", None).unwrap();
    let url = format!("{}/u/1", server.uri());
    engine
        .flights()
        .set_cache(
            &key,
            stored_envelope(Method::GET, &url, json!({"id": 1, "name": "A"})),
            Duration::from_secs(60),
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();

    let seen = record_events(&engine);
    let envelope = engine.get("/u/1").await.unwrap();

    assert_eq!(envelope.data.as_json().unwrap(), &json!({"id": 1, "name": "A"}));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![EventName::Before, EventName::CacheHit, EventName::After]
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn cache_miss_fetches_then_stores_then_hits() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": [1, 2]})))
        .mount(&server)
        .await;

    let engine =
        FetchEngine::new(EngineOptions::new(server.uri()).cache(true)).unwrap();
    let seen = record_events(&engine);

    let first = engine.get("/items").await.unwrap();
    let second = engine.get("/items").await.unwrap();

    assert_eq!(first.data, second.data);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
    let names = seen.lock().unwrap().clone();
    assert!(names.contains(&EventName::CacheMiss));
    assert!(names.contains(&EventName::CacheSet));
    assert!(names.contains(&EventName::CacheHit));
}

#[tokio::test]
async fn stale_entries_serve_immediately_and_revalidate_in_the_background() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sw"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 2})))
        .mount(&server)
        .await;

    let engine = FetchEngine::new(EngineOptions::new(server.uri()).cache(
        PolicyToggle::Configured(CacheOptions::new(CacheSettings {
            ttl: Duration::from_millis(400),
            stale_in: Some(Duration::from_millis(150)),
            ..Default::default()
        })),
    ))
    .unwrap();

    let stales = Arc::new(AtomicUsize::new(0));
    let revalidations = Arc::new(AtomicUsize::new(0));
    {
        let stales = stales.clone();
        engine.on(EventName::CacheStale, move |_| {
            stales.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let revalidations = revalidations.clone();
        engine.on(EventName::CacheRevalidate, move |_| {
            revalidations.fetch_add(1, Ordering::SeqCst);
        });
    }

    let first = engine.get("/sw").await.unwrap();
    assert_eq!(first.data.as_json().unwrap(), &json!({"v": 1}));

    // Enter the stale window: served from cache, refresh kicked off.
    tokio::time::sleep(Duration::from_millis(180)).await;
    let second = engine.get("/sw").await.unwrap();
    assert_eq!(second.data.as_json().unwrap(), &json!({"v": 1}));
    assert_eq!(stales.load(Ordering::SeqCst), 1);

    // Revalidation has landed; the refreshed value now serves fresh.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let third = engine.get("/sw").await.unwrap();
    assert_eq!(third.data.as_json().unwrap(), &json!({"v": 2}));
    assert_eq!(revalidations.load(Ordering::SeqCst), 1);
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn concurrent_equivalent_calls_share_one_network_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"n": 1}))
                .set_delay(Duration::from_millis(200)),
        )
        .mount(&server)
        .await;

    let engine = FetchEngine::new(EngineOptions::new(server.uri()).dedupe(true)).unwrap();
    let starts = Arc::new(AtomicUsize::new(0));
    let joins = Arc::new(AtomicUsize::new(0));
    {
        let starts = starts.clone();
        engine.on(EventName::DedupeStart, move |_| {
            starts.fetch_add(1, Ordering::SeqCst);
        });
    }
    {
        let joins = joins.clone();
        engine.on(EventName::DedupeJoin, move |_| {
            joins.fetch_add(1, Ordering::SeqCst);
        });
    }

    let calls = (0..100).map(|_| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.get("/x").await })
    });

    for outcome in futures::future::join_all(calls).await {
        let envelope = outcome.unwrap().unwrap();
        assert_eq!(envelope.data.as_json().unwrap(), &json!({"n": 1}));
    }

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(joins.load(Ordering::SeqCst), 99);
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn all_dedupe_participants_see_the_originators_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(ResponseTemplate::new(500).set_delay(Duration::from_millis(100)))
        .mount(&server)
        .await;

    let engine = FetchEngine::new(EngineOptions::new(server.uri()).dedupe(true)).unwrap();
    let calls: Vec<_> = (0..3)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.get("/boom").await })
        })
        .collect();

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, FetchError::Joined { .. }));
        assert_eq!(err.status().map(|s| s.as_u16()), Some(500));
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn aborting_one_joiner_leaves_the_flight_unharmed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_millis(150)),
        )
        .mount(&server)
        .await;

    let engine = FetchEngine::new(EngineOptions::new(server.uri()).dedupe(true)).unwrap();

    let originator = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.get("/slow").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let controller = AbortController::new();
    let joiner = {
        let engine = engine.clone();
        let signal = controller.signal();
        tokio::spawn(async move {
            engine
                .get_with("/slow", CallOptions::default().signal(signal))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    controller.abort("user");

    match joiner.await.unwrap().unwrap_err() {
        FetchError::Aborted { reason } => assert_eq!(reason, "user"),
        e => panic!("expected Aborted, got {e:?}"),
    }
    let envelope = originator.await.unwrap().unwrap();
    assert_eq!(envelope.data.as_json().unwrap(), &json!({"ok": true}));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn rate_limited_waiters_complete_in_priority_order_with_refill_gaps() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let engine = FetchEngine::new(EngineOptions::new(server.uri()).rate_limit(
        PolicyToggle::Configured(
            ThrottleOptions::new(ThrottleSettings {
                bucket: BucketConfig {
                    capacity: 1.0,
                    refill_per_sec: 20.0,
                    max_queue: 16,
                },
                priority: 0,
            })
            .rule(Rule::new(RouteMatch::StartsWith("/z".into()), ThrottleRule::default())),
        ),
    ))
    .unwrap();

    // Drain the single token so the interesting calls all queue.
    engine.get("/z/1").await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut calls = Vec::new();
    for (tag, priority) in [("a", 5), ("b", 1), ("c", 1)] {
        let engine = engine.clone();
        let order = order.clone();
        calls.push(tokio::spawn(async move {
            engine
                .get_with("/z/1", CallOptions::default().priority(priority))
                .await
                .unwrap();
            order.lock().unwrap().push((tag, Instant::now()));
        }));
        // Deterministic enqueue order for the FIFO tie-break.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for call in calls {
        call.await.unwrap();
    }

    let order = order.lock().unwrap();
    let tags: Vec<&str> = order.iter().map(|(tag, _)| *tag).collect();
    assert_eq!(tags, vec!["b", "c", "a"]);
    for pair in order.windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap >= Duration::from_millis(35), "refill gap was {gap:?}");
    }
}

#[tokio::test]
async fn zero_capacity_bucket_rejects_with_an_event() {
    let server = MockServer::start().await;
    let engine = FetchEngine::new(EngineOptions::new(server.uri()).rate_limit(
        PolicyToggle::Configured(ThrottleOptions::new(ThrottleSettings {
            bucket: BucketConfig { capacity: 0.0, refill_per_sec: 1.0, max_queue: 4 },
            priority: 0,
        })),
    ))
    .unwrap();

    let rejects = Arc::new(AtomicUsize::new(0));
    {
        let rejects = rejects.clone();
        engine.on(EventName::RateLimitReject, move |_| {
            rejects.fetch_add(1, Ordering::SeqCst);
        });
    }

    let err = engine.get("/anything").await.unwrap_err();
    assert!(err.is_rate_limit_rejected());
    assert_eq!(rejects.load(Ordering::SeqCst), 1);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn invalidation_surface_removes_matching_entries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path_regex("^/(a|b)/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let engine = FetchEngine::new(EngineOptions::new(server.uri()).cache(true)).unwrap();
    engine.get("/a/1").await.unwrap();
    engine.get("/a/2").await.unwrap();
    engine.get("/b/1").await.unwrap();
    assert_eq!(engine.cache_stats().await.unwrap().cache_size, 3);

    let removed = engine.invalidate_path(&RouteMatch::StartsWith("/a".into())).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(engine.cache_stats().await.unwrap().cache_size, 1);

    let key = engine.cache_key(Method::GET, "/b/1", None).unwrap();
    assert!(engine.delete_cache(&key).await.unwrap());
    assert_eq!(engine.cache_stats().await.unwrap().cache_size, 0);

    engine.get("/a/1").await.unwrap();
    engine.clear_cache().await.unwrap();
    assert_eq!(engine.cache_stats().await.unwrap().cache_size, 0);
}

/// Adapter that fails every operation.
#[derive(Debug, Default)]
struct BrokenStore;

#[async_trait]
impl CacheStore<ResponseEnvelope> for BrokenStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<CacheItem<ResponseEnvelope>>> {
        Err("backend offline".into())
    }
    async fn set(&self, _key: &str, _item: CacheItem<ResponseEnvelope>) -> StoreResult<()> {
        Err("backend offline".into())
    }
    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        Err("backend offline".into())
    }
    async fn has(&self, _key: &str) -> StoreResult<bool> {
        Err("backend offline".into())
    }
    async fn clear(&self) -> StoreResult<()> {
        Err("backend offline".into())
    }
    async fn size(&self) -> StoreResult<usize> {
        Err("backend offline".into())
    }
    async fn keys(&self) -> StoreResult<Vec<String>> {
        Err("backend offline".into())
    }
}

#[tokio::test]
async fn adapter_failures_degrade_to_misses_but_surface_on_direct_calls() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/resilient"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let engine = FetchEngine::with_store(
        EngineOptions::new(server.uri()).cache(true),
        Arc::new(BrokenStore),
    )
    .unwrap();

    // The pipeline shrugs the adapter off and goes to the network.
    let envelope = engine.get("/resilient").await.unwrap();
    assert_eq!(envelope.data.as_json().unwrap(), &json!({"ok": true}));

    // Direct invalidation calls report the adapter failure.
    match engine.clear_cache().await.unwrap_err() {
        FetchError::CacheAdapter { message } => assert!(message.contains("backend offline")),
        e => panic!("expected CacheAdapter, got {e:?}"),
    }
}
