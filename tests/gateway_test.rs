//! End-to-end tests through the assembled gateway.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use mimir::{
    CacheKey, Config, HttpRequest, HttpResponse, InterceptConfig, ManualClock, Mimir, MimirBuilder,
    MimirError, RequestKind, Result, Transport, UpstreamRequest,
};

// ============================================================================
// Mock upstream
// ============================================================================

/// Echoes the request's `variables` back inside a GraphQL envelope and
/// records which URLs were hit.
#[derive(Default)]
struct FakeUpstream {
    hits: Mutex<Vec<String>>,
    down: AtomicBool,
    failing_url: Mutex<Option<String>>,
}

impl FakeUpstream {
    fn hits(&self) -> Vec<String> {
        self.hits.lock().unwrap().clone()
    }

    fn fail_url(&self, url: &str) {
        *self.failing_url.lock().unwrap() = Some(url.to_string());
    }
}

#[async_trait]
impl Transport for FakeUpstream {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.hits.lock().unwrap().push(request.url.clone());
        if self.down.load(Ordering::SeqCst) {
            return Err(MimirError::Http("unreachable".into()));
        }
        if self.failing_url.lock().unwrap().as_deref() == Some(request.url.as_str()) {
            return Ok(HttpResponse::new(500, "internal error"));
        }
        if request.kind == RequestKind::Shell {
            return Ok(HttpResponse::new(200, "<html>"));
        }
        let body: serde_json::Value = serde_json::from_slice(&request.body)?;
        let envelope = json!({"data": {"echo": body["variables"], "url": request.url}});
        Ok(HttpResponse::new(200, envelope.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    data: Echo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Echo {
    echo: serde_json::Value,
    url: String,
}

const PRIMARY: &str = "https://primary.example/graphql";
const MIRROR: &str = "https://mirror.example/graphql";

fn builder(upstream: &Arc<FakeUpstream>, clock: &Arc<ManualClock>) -> MimirBuilder {
    Mimir::builder()
        .endpoint("primary", PRIMARY)
        .endpoint("mirror", MIRROR)
        .transport(upstream.clone())
        .clock(clock.clone())
}

fn media_request(id: u32) -> (CacheKey, UpstreamRequest) {
    (
        CacheKey::new("media").param("id", id),
        UpstreamRequest::graphql(
            RequestKind::StaticQuery,
            "query ($id: Int) { Media(id: $id) { id } }",
            json!({"id": id}),
        ),
    )
}

const HOUR: Duration = Duration::from_secs(3_600);

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn query_is_cached_per_key_and_mode() {
    let upstream = Arc::new(FakeUpstream::default());
    let clock = Arc::new(ManualClock::new(0));
    let gateway = builder(&upstream, &clock).build().await.unwrap();

    let (key, request) = media_request(1);
    let first: Envelope = gateway.query(&key, HOUR, request.clone()).await.unwrap();
    assert_eq!(first.data.echo, json!({"id": 1}));
    let _: Envelope = gateway.query(&key, HOUR, request.clone()).await.unwrap();
    assert_eq!(upstream.hits().len(), 1);

    gateway.mode().set_lite(true);
    let _: Envelope = gateway.query(&key, HOUR, request).await.unwrap();
    assert_eq!(upstream.hits().len(), 2);
    assert_eq!(gateway.key(&key), r#"media:{"id":1}:lite"#);
}

#[tokio::test]
async fn failover_and_promotion_through_the_gateway() {
    let upstream = Arc::new(FakeUpstream::default());
    upstream.fail_url(PRIMARY);
    let clock = Arc::new(ManualClock::new(0));
    let gateway = builder(&upstream, &clock).build().await.unwrap();

    let (key, request) = media_request(1);
    let result: Envelope = gateway.query(&key, HOUR, request).await.unwrap();
    assert_eq!(result.data.url, MIRROR);
    assert_eq!(gateway.upstream().preferred(), 1);

    let (key, request) = media_request(2);
    let _: Envelope = gateway.query(&key, HOUR, request).await.unwrap();
    assert_eq!(upstream.hits(), vec![PRIMARY, MIRROR, MIRROR]);
}

#[tokio::test]
async fn total_outage_serves_stale_then_fails_for_unknown_keys() {
    let upstream = Arc::new(FakeUpstream::default());
    let clock = Arc::new(ManualClock::new(0));
    let gateway = builder(&upstream, &clock)
        .retry(mimir::RetryConfig::disabled())
        .build()
        .await
        .unwrap();

    let (key, request) = media_request(1);
    let fresh: Envelope = gateway.query(&key, HOUR, request.clone()).await.unwrap();

    clock.advance(2 * HOUR);
    upstream.down.store(true, Ordering::SeqCst);

    let stale: Envelope = gateway.query(&key, HOUR, request).await.unwrap();
    assert_eq!(stale, fresh);

    let (key, request) = media_request(2);
    let err = gateway
        .query::<Envelope>(&key, HOUR, request)
        .await
        .unwrap_err();
    assert!(matches!(err, MimirError::Exhausted { attempts: 2, .. }));
}

#[tokio::test]
async fn undecodable_body_is_a_failed_fetch() {
    #[derive(Debug, Serialize, Deserialize)]
    struct Wrong {
        missing_field: u32,
    }

    let upstream = Arc::new(FakeUpstream::default());
    let clock = Arc::new(ManualClock::new(0));
    let gateway = builder(&upstream, &clock).build().await.unwrap();

    let (key, request) = media_request(1);
    let err = gateway.query::<Wrong>(&key, HOUR, request).await.unwrap_err();
    assert!(matches!(err, MimirError::Json(_)));
    assert!(gateway.store().get_stale::<serde_json::Value>(&gateway.key(&key)).await.is_none());
}

#[tokio::test]
async fn build_requires_an_endpoint() {
    let result = Mimir::builder().build().await;
    assert!(matches!(result, Err(MimirError::NoEndpoint)));
}

#[tokio::test]
async fn build_sweeps_expired_entries_from_the_store_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");
    let upstream = Arc::new(FakeUpstream::default());
    let clock = Arc::new(ManualClock::new(0));

    {
        let gateway = builder(&upstream, &clock)
            .store_path(&path)
            .build()
            .await
            .unwrap();
        let (key, request) = media_request(1);
        let _: Envelope = gateway.query(&key, HOUR, request).await.unwrap();
    }

    clock.advance(2 * HOUR);
    let gateway = builder(&upstream, &clock)
        .store_path(&path)
        .build()
        .await
        .unwrap();
    let (key, _) = media_request(1);
    assert!(gateway.store().get_stale::<Envelope>(&gateway.key(&key)).await.is_none());
}

#[tokio::test]
async fn build_from_config_with_interception() {
    let config = Config::parse(
        r#"
        lite_mode = true

        [upstream]
        endpoints = [
            { name = "primary", url = "https://primary.example/graphql" },
        ]

        [upstream.retry]
        max_attempts = 1

        [intercept]
        version = "v3"
        shell_assets = ["https://app.example/index.html"]
        "#,
    )
    .unwrap();

    let upstream = Arc::new(FakeUpstream::default());
    let gateway = MimirBuilder::from_config(&config)
        .transport(upstream.clone())
        .build()
        .await
        .unwrap();

    assert!(gateway.mode().is_lite());
    let nic = gateway.intercept().expect("interception enabled");
    assert_eq!(nic.config().version, "v3");
    // The shell asset was installed during build.
    assert_eq!(upstream.hits(), vec!["https://app.example/index.html"]);

    let (key, request) = media_request(1);
    let _: Envelope = gateway.query(&key, HOUR, request.clone()).await.unwrap();

    // A different cache key for the same literal request is answered by the
    // interception layer without reaching the upstream.
    let other_key = CacheKey::new("media-alias").param("id", 1);
    let _: Envelope = gateway.query(&other_key, HOUR, request).await.unwrap();
    assert_eq!(upstream.hits().len(), 2);
}

#[tokio::test]
async fn custom_fetch_shares_the_cache() {
    let upstream = Arc::new(FakeUpstream::default());
    let clock = Arc::new(ManualClock::new(0));
    let gateway = builder(&upstream, &clock).build().await.unwrap();

    let key = gateway.key(&CacheKey::new("genres"));
    let genres: Vec<String> = gateway
        .get_or_fetch(&key, HOUR, || async {
            Ok(vec!["Action".to_string(), "Drama".to_string()])
        })
        .await
        .unwrap();
    assert_eq!(genres.len(), 2);

    let cached: Vec<String> = gateway
        .get_or_fetch(&key, HOUR, || async { Ok(Vec::new()) })
        .await
        .unwrap();
    assert_eq!(cached, genres);
    assert!(upstream.hits().is_empty());
}
