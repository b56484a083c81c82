//! The intercepting [`Transport`] decorator.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::policy::{CacheClass, CachePolicy, InterceptConfig};
use super::storage::ResponseStorage;
use crate::clock::{Clock, SystemClock, duration_ms};
use crate::telemetry;
use crate::transport::{HttpRequest, HttpResponse, RequestKind, Transport};
use crate::Result;

/// Header carrying the epoch-millisecond write time of a cached response.
pub const CACHED_AT: &str = "x-mimir-cached-at";

/// Wraps a [`Transport`], answering from per-class response stores.
///
/// ```text
/// request ──► classify ──► CacheFirst         hit → cached
///                      │                       miss → network, store
///                      ├─► CacheFirstRefresh  hit → cached + background refill
///                      │                       miss → network, store
///                      ├─► Windowed           young hit → cached
///                      │                       else → network, store on 2xx
///                      └─► NoCache            network
///
/// network Err on a cached class → cached copy of any age, else 503
/// ```
pub struct InterceptingTransport {
    inner: Arc<dyn Transport>,
    storage: Arc<ResponseStorage>,
    config: InterceptConfig,
    clock: Arc<dyn Clock>,
}

impl InterceptingTransport {
    /// Wrap `inner` with in-memory response stores.
    pub fn new(inner: Arc<dyn Transport>, config: InterceptConfig) -> Self {
        let storage = ResponseStorage::in_memory_with_max_entries(config.max_entries);
        Self::with_storage(inner, config, Arc::new(storage))
    }

    /// Wrap `inner` with the given response storage.
    pub fn with_storage(
        inner: Arc<dyn Transport>,
        config: InterceptConfig,
        storage: Arc<ResponseStorage>,
    ) -> Self {
        Self {
            inner,
            storage,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Wrap `inner`, opening storage from `config.storage_dir` when set.
    pub async fn open(inner: Arc<dyn Transport>, config: InterceptConfig) -> Self {
        let storage = match &config.storage_dir {
            Some(dir) => {
                ResponseStorage::open_with_max_entries(dir.clone(), config.max_entries).await
            }
            None => ResponseStorage::in_memory_with_max_entries(config.max_entries),
        };
        Self::with_storage(inner, config, Arc::new(storage))
    }

    /// Use a custom clock for freshness windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &InterceptConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<ResponseStorage> {
        &self.storage
    }

    /// Pre-populate the shell store with every configured shell asset.
    ///
    /// Assets already cached are skipped. Fetch failures are logged and do
    /// not stop the install. Returns the number of assets newly cached.
    #[instrument(skip(self))]
    pub async fn install(&self) -> usize {
        let store = self.config.store_name("shell");
        let mut installed = 0;
        for url in &self.config.shell_assets {
            let request = HttpRequest::get(url, RequestKind::Shell);
            let fingerprint = request.fingerprint();
            if self.storage.contains(&store, &fingerprint).await {
                continue;
            }
            match self.inner.send(&request).await {
                Ok(response) if response.is_success() => {
                    self.store_response(&store, &fingerprint, response).await;
                    installed += 1;
                }
                Ok(response) => {
                    warn!(url = %url, status = response.status, "shell asset not cached")
                }
                Err(e) => warn!(url = %url, error = %e, "shell asset fetch failed"),
            }
        }
        info!(installed, "shell assets installed");
        installed
    }

    /// Delete every store owned by this layer whose version tag is not the
    /// current one. Returns the names of the deleted stores.
    #[instrument(skip(self))]
    pub async fn activate(&self) -> Vec<String> {
        let mut deleted = Vec::new();
        for name in self.storage.store_names().await {
            if !self.config.is_outdated_store(&name) {
                continue;
            }
            match self.storage.delete_store(&name).await {
                Ok(_) => {
                    info!(store = %name, "deleted outdated response store");
                    deleted.push(name);
                }
                Err(e) => warn!(store = %name, error = %e, "failed to delete outdated store"),
            }
        }
        deleted
    }

    async fn cached(&self, policy: &CachePolicy, fingerprint: &str) -> Option<HttpResponse> {
        self.storage.get(&policy.store, fingerprint).await
    }

    fn is_within_window(&self, response: &HttpResponse, policy: &CachePolicy) -> bool {
        let Some(max_age) = policy.max_age else {
            return true;
        };
        let Some(cached_at) = response
            .header(CACHED_AT)
            .and_then(|v| v.parse::<u64>().ok())
        else {
            return false;
        };
        self.clock.now_ms().saturating_sub(cached_at) <= duration_ms(max_age)
    }

    /// Store a good response, stamped with the current time.
    async fn store_response(&self, store: &str, fingerprint: &str, response: HttpResponse) {
        let stamped = response.with_header(CACHED_AT, self.clock.now_ms().to_string());
        if let Err(e) = self.storage.put(store, fingerprint, stamped).await {
            warn!(store, error = %e, "failed to store response");
            metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "operation" => "save").increment(1);
        }
    }

    /// Network path for a cached class: store good responses, fall back to
    /// any cached copy on network failure.
    async fn fetch_and_store(
        &self,
        request: &HttpRequest,
        policy: &CachePolicy,
        fingerprint: &str,
        fallback: Option<HttpResponse>,
    ) -> Result<HttpResponse> {
        match self.inner.send(request).await {
            Ok(response) => {
                if is_storable(&response) {
                    self.store_response(&policy.store, fingerprint, response.clone())
                        .await;
                }
                Ok(response)
            }
            Err(e) => {
                let fallback = match fallback {
                    Some(cached) => Some(cached),
                    None => self.cached(policy, fingerprint).await,
                };
                match fallback {
                    Some(cached) => {
                        warn!(
                            url = %request.url,
                            error = %e,
                            "network failed, serving cached response"
                        );
                        metrics::counter!(telemetry::STALE_FALLBACKS_TOTAL, "layer" => "intercept")
                            .increment(1);
                        Ok(cached)
                    }
                    None => {
                        warn!(url = %request.url, error = %e, "network failed and nothing cached");
                        Ok(HttpResponse::service_unavailable())
                    }
                }
            }
        }
    }

    fn spawn_refresh(&self, request: &HttpRequest, policy: &CachePolicy, fingerprint: String) {
        let inner = Arc::clone(&self.inner);
        let storage = Arc::clone(&self.storage);
        let clock = Arc::clone(&self.clock);
        let request = request.clone();
        let store = policy.store.clone();
        tokio::spawn(async move {
            match inner.send(&request).await {
                Ok(response) if is_storable(&response) => {
                    let stamped = response.with_header(CACHED_AT, clock.now_ms().to_string());
                    if let Err(e) = storage.put(&store, &fingerprint, stamped).await {
                        warn!(store = %store, error = %e, "background refresh not stored");
                    }
                }
                Ok(response) => {
                    debug!(
                        url = %request.url,
                        status = response.status,
                        "background refresh skipped"
                    )
                }
                Err(e) => debug!(url = %request.url, error = %e, "background refresh failed"),
            }
        });
    }
}

/// Only 2xx responses without an embedded application error are cached.
fn is_storable(response: &HttpResponse) -> bool {
    response.is_success() && response.application_error().is_none()
}

fn record_hit() {
    metrics::counter!(telemetry::CACHE_HITS_TOTAL, "layer" => "intercept").increment(1);
}

fn record_miss() {
    metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "layer" => "intercept").increment(1);
}

#[async_trait]
impl Transport for InterceptingTransport {
    #[instrument(
        skip_all,
        fields(method = %request.method, url = %request.url, kind = ?request.kind)
    )]
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let policy = self.config.classify(request);
        if policy.class == CacheClass::NoCache {
            return self.inner.send(request).await;
        }

        let fingerprint = request.fingerprint();
        let cached = self.cached(&policy, &fingerprint).await;

        match policy.class {
            CacheClass::CacheFirst => {
                if let Some(hit) = cached {
                    record_hit();
                    return Ok(hit);
                }
                record_miss();
                self.fetch_and_store(request, &policy, &fingerprint, None)
                    .await
            }
            CacheClass::CacheFirstRefresh => {
                if let Some(hit) = cached {
                    record_hit();
                    self.spawn_refresh(request, &policy, fingerprint);
                    return Ok(hit);
                }
                record_miss();
                self.fetch_and_store(request, &policy, &fingerprint, None)
                    .await
            }
            CacheClass::Windowed => {
                if let Some(hit) = &cached {
                    if self.is_within_window(hit, &policy) {
                        record_hit();
                        debug!("serving response within freshness window");
                        return Ok(hit.clone());
                    }
                }
                record_miss();
                self.fetch_and_store(request, &policy, &fingerprint, cached)
                    .await
            }
            CacheClass::NoCache => self.inner.send(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MimirError;
    use crate::clock::ManualClock;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers from a queue; `Err` when the queue is empty.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<Vec<Result<HttpResponse>>>,
        sent: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn push(&self, r: Result<HttpResponse>) {
            self.responses.lock().unwrap().insert(0, r);
        }
        fn sent(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn send(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.sent.lock().unwrap().push(request.clone());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(MimirError::Http("offline".into())))
        }
    }

    fn setup() -> (Arc<Scripted>, Arc<ManualClock>, InterceptingTransport) {
        let inner = Arc::new(Scripted::default());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let transport = InterceptingTransport::new(
            inner.clone(),
            InterceptConfig::new().dynamic_window(Duration::from_secs(60)),
        )
        .with_clock(clock.clone());
        (inner, clock, transport)
    }

    fn dynamic_query() -> HttpRequest {
        HttpRequest::post_json(
            "https://graphql.example",
            &serde_json::json!({"query": "{ airing }"}),
            RequestKind::DynamicQuery,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn windowed_hit_skips_network() {
        let (inner, clock, transport) = setup();
        inner.push(Ok(HttpResponse::new(200, r#"{"data":1}"#)));

        let first = transport.send(&dynamic_query()).await.unwrap();
        assert_eq!(first.body, br#"{"data":1}"#);
        clock.advance(Duration::from_secs(30));
        let second = transport.send(&dynamic_query()).await.unwrap();
        assert_eq!(second.body, first.body);
        assert_eq!(inner.sent(), 1);
    }

    #[tokio::test]
    async fn expired_window_refetches() {
        let (inner, clock, transport) = setup();
        inner.push(Ok(HttpResponse::new(200, r#"{"data":1}"#)));
        inner.push(Ok(HttpResponse::new(200, r#"{"data":2}"#)));

        transport.send(&dynamic_query()).await.unwrap();
        clock.advance(Duration::from_secs(61));
        let second = transport.send(&dynamic_query()).await.unwrap();
        assert_eq!(second.body, br#"{"data":2}"#);
        assert_eq!(inner.sent(), 2);
    }

    #[tokio::test]
    async fn application_errors_are_not_stored() {
        let (inner, _, transport) = setup();
        inner.push(Ok(HttpResponse::new(200, r#"{"errors":[{"message":"bad"}]}"#)));
        inner.push(Ok(HttpResponse::new(200, r#"{"data":1}"#)));

        transport.send(&dynamic_query()).await.unwrap();
        let second = transport.send(&dynamic_query()).await.unwrap();
        assert_eq!(second.body, br#"{"data":1}"#);
        assert_eq!(inner.sent(), 2);
    }

    #[tokio::test]
    async fn network_failure_serves_expired_copy() {
        let (inner, clock, transport) = setup();
        inner.push(Ok(HttpResponse::new(200, r#"{"data":1}"#)));

        transport.send(&dynamic_query()).await.unwrap();
        clock.advance(Duration::from_secs(3600));
        let fallback = transport.send(&dynamic_query()).await.unwrap();
        assert_eq!(fallback.body, br#"{"data":1}"#);
        assert_eq!(inner.sent(), 2);
    }

    #[tokio::test]
    async fn network_failure_without_cache_is_503() {
        let (_, _, transport) = setup();
        let response = transport.send(&dynamic_query()).await.unwrap();
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn uncached_requests_propagate_errors() {
        let (inner, _, transport) = setup();
        let request = HttpRequest::get("https://graphql.example/health", RequestKind::Uncached);
        assert!(transport.send(&request).await.is_err());
        inner.push(Ok(HttpResponse::new(200, "ok")));
        transport.send(&request).await.unwrap();
        assert!(transport.send(&request).await.is_err());
    }
}
