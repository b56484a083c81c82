//! Integration tests for the transport interception cache.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mimir::intercept::{CACHED_AT, ResponseStorage};
use mimir::{
    HttpRequest, HttpResponse, InterceptConfig, InterceptingTransport, ManualClock, MimirError,
    RequestKind, ReqwestTransport, Result, Transport,
};

// ============================================================================
// Mock transport
// ============================================================================

/// Counts calls; answers with a numbered body, or fails while `down`.
#[derive(Default)]
struct CountingTransport {
    calls: AtomicU32,
    down: std::sync::atomic::AtomicBool,
}

impl CountingTransport {
    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn send(&self, _request: &HttpRequest) -> Result<HttpResponse> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.down.load(Ordering::SeqCst) {
            return Err(MimirError::Http("network unreachable".into()));
        }
        Ok(HttpResponse::new(200, format!(r#"{{"data":{n}}}"#)))
    }
}

fn static_query(id: u32) -> HttpRequest {
    HttpRequest::post_json(
        "https://graphql.example",
        &json!({"query": "query ($id: Int) { Media(id: $id) { id } }", "variables": {"id": id}}),
        RequestKind::StaticQuery,
    )
    .unwrap()
}

// ============================================================================
// Query windows
// ============================================================================

#[tokio::test]
async fn static_queries_use_the_long_window() {
    let inner = Arc::new(CountingTransport::default());
    let clock = Arc::new(ManualClock::new(0));
    let nic = InterceptingTransport::new(inner.clone(), InterceptConfig::default())
        .with_clock(clock.clone());

    nic.send(&static_query(1)).await.unwrap();
    clock.advance(Duration::from_secs(23 * 3600));
    let hit = nic.send(&static_query(1)).await.unwrap();
    assert_eq!(hit.body, br#"{"data":1}"#);
    assert_eq!(inner.calls(), 1);

    clock.advance(Duration::from_secs(2 * 3600));
    let refreshed = nic.send(&static_query(1)).await.unwrap();
    assert_eq!(refreshed.body, br#"{"data":2}"#);
}

#[tokio::test]
async fn request_body_is_part_of_the_identity() {
    let inner = Arc::new(CountingTransport::default());
    let nic = InterceptingTransport::new(inner.clone(), InterceptConfig::default());

    nic.send(&static_query(1)).await.unwrap();
    nic.send(&static_query(2)).await.unwrap();
    nic.send(&static_query(1)).await.unwrap();
    assert_eq!(inner.calls(), 2);
}

#[tokio::test]
async fn distinct_queries_do_not_grow_a_store_past_its_bound() {
    let inner = Arc::new(CountingTransport::default());
    let nic = InterceptingTransport::new(inner, InterceptConfig::new().max_entries(4));

    for id in 0..40 {
        nic.send(&static_query(id)).await.unwrap();
    }
    let store = nic.config().store_name("api-static");
    assert!(nic.storage().entry_count(&store).await <= 4);
}

#[tokio::test]
async fn stored_responses_carry_write_timestamp() {
    let inner = Arc::new(CountingTransport::default());
    let clock = Arc::new(ManualClock::new(42_000));
    let nic = InterceptingTransport::new(inner, InterceptConfig::default()).with_clock(clock);

    nic.send(&static_query(1)).await.unwrap();
    let store = nic.config().store_name("api-static");
    let stored = nic
        .storage()
        .get(&store, &static_query(1).fingerprint())
        .await
        .unwrap();
    assert_eq!(stored.header(CACHED_AT), Some("42000"));
}

#[tokio::test]
async fn offline_serves_last_response_of_any_age() {
    let inner = Arc::new(CountingTransport::default());
    let clock = Arc::new(ManualClock::new(0));
    let nic = InterceptingTransport::new(inner.clone(), InterceptConfig::default())
        .with_clock(clock.clone());

    nic.send(&static_query(1)).await.unwrap();
    clock.advance(Duration::from_secs(30 * 86_400));
    inner.set_down(true);

    let response = nic.send(&static_query(1)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, br#"{"data":1}"#);

    let never_seen = nic.send(&static_query(7)).await.unwrap();
    assert_eq!(never_seen.status, 503);
}

// ============================================================================
// Shell and assets
// ============================================================================

#[tokio::test]
async fn install_precaches_shell_and_serves_offline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/index.html"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/app.js"))
        .respond_with(ResponseTemplate::new(200).set_body_string("main()"))
        .expect(1)
        .mount(&server)
        .await;

    let index = format!("{}/index.html", server.uri());
    let config = InterceptConfig::new()
        .shell_asset(&index)
        .shell_asset(format!("{}/app.js", server.uri()));
    let nic = InterceptingTransport::new(Arc::new(ReqwestTransport::new()), config);

    assert_eq!(nic.install().await, 2);
    // Already cached: nothing fetched the second time.
    assert_eq!(nic.install().await, 0);

    // Shut the server down: the shell must come from the cache alone.
    drop(server);

    let page = nic
        .send(&HttpRequest::get(&index, RequestKind::Shell))
        .await
        .unwrap();
    assert_eq!(page.body, b"<html></html>");
}

#[tokio::test]
async fn assets_are_served_from_cache_and_refreshed_in_background() {
    let inner = Arc::new(CountingTransport::default());
    let nic = InterceptingTransport::new(inner.clone(), InterceptConfig::default());
    let cover = HttpRequest::get("https://img.example/cover/1.jpg", RequestKind::Asset);

    let first = nic.send(&cover).await.unwrap();
    assert_eq!(first.body, br#"{"data":1}"#);

    // Cached copy returned immediately; a refresh runs behind it.
    let second = nic.send(&cover).await.unwrap();
    assert_eq!(second.body, br#"{"data":1}"#);

    for _ in 0..50 {
        if inner.calls() == 2 {
            break;
        }
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(inner.calls(), 2);

    let third = nic.send(&cover).await.unwrap();
    assert_eq!(third.body, br#"{"data":2}"#);
}

// ============================================================================
// Versioned stores
// ============================================================================

#[tokio::test]
async fn activation_purges_other_versions_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let inner = Arc::new(CountingTransport::default());

    {
        let config = InterceptConfig::new().version("v1").storage_dir(dir.path());
        let nic = InterceptingTransport::open(inner.clone(), config).await;
        nic.send(&static_query(1)).await.unwrap();
    }

    // Same version after restart: the persisted response is reused.
    {
        let config = InterceptConfig::new().version("v1").storage_dir(dir.path());
        let nic = InterceptingTransport::open(inner.clone(), config).await;
        assert!(nic.activate().await.is_empty());
        nic.send(&static_query(1)).await.unwrap();
        assert_eq!(inner.calls(), 1);
    }

    // Version bump: the v1 store is deleted and the request goes out again.
    let config = InterceptConfig::new().version("v2").storage_dir(dir.path());
    let nic = InterceptingTransport::open(inner.clone(), config).await;
    assert_eq!(nic.activate().await, vec!["mimir-api-static-v1".to_string()]);
    nic.send(&static_query(1)).await.unwrap();
    assert_eq!(inner.calls(), 2);

    let reopened = ResponseStorage::open(dir.path()).await;
    assert_eq!(
        reopened.store_names().await,
        vec!["mimir-api-static-v2".to_string()]
    );
}
