//! Multi-endpoint upstream client with rate-limit backoff and failover.
//!
//! # Rotation
//!
//! ```text
//! endpoints: [A, B, C]     preferred = 1
//!
//! call() tries B ──► C ──► A
//!              │
//!              ├── 2xx, no app error    → preferred := index, return body
//!              ├── 2xx, app error       → next endpoint
//!              ├── 429                  → sleep, retry same endpoint
//!              │                          (up to max_attempts, then next)
//!              └── other status / Err   → next endpoint
//!
//! all exhausted → Exhausted { last }
//! ```
//!
//! This is the only layer that sleeps or retries. The orchestrator above
//! it and the stores beside it never do.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::retry::RetryConfig;
use crate::clock::duration_ms;
use crate::telemetry;
use crate::transport::{HttpRequest, HttpResponse, RequestKind, Transport};
use crate::{MimirError, Result};

/// Longest response body excerpt kept in an error message.
const ERROR_BODY_EXCERPT: usize = 200;

/// One of several functionally equivalent upstream URLs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

/// A request payload, opaque to the client, plus its caching category.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamRequest {
    pub kind: RequestKind,
    pub body: Value,
}

impl UpstreamRequest {
    pub fn new(kind: RequestKind, body: Value) -> Self {
        Self { kind, body }
    }

    /// A GraphQL request body: `{"query": ..., "variables": ...}`.
    pub fn graphql(kind: RequestKind, query: impl Into<String>, variables: Value) -> Self {
        Self::new(
            kind,
            serde_json::json!({ "query": query.into(), "variables": variables }),
        )
    }
}

/// Client that rotates across endpoints, preferring the last one that worked.
pub struct UpstreamClient {
    endpoints: Vec<Endpoint>,
    preferred: AtomicUsize,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
}

impl UpstreamClient {
    /// Create a client. Endpoints are tried in the given order until one
    /// succeeds.
    pub fn new(
        endpoints: Vec<Endpoint>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(MimirError::NoEndpoint);
        }
        let mut retry = retry;
        // A deserialized `max_attempts = 0` would never try an endpoint.
        retry.max_attempts = retry.max_attempts.max(1);
        Ok(Self {
            endpoints,
            preferred: AtomicUsize::new(0),
            transport,
            retry,
        })
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Index of the endpoint the next call starts with.
    pub fn preferred(&self) -> usize {
        self.preferred.load(Ordering::Relaxed)
    }

    /// Issue `request`, failing over across endpoints.
    ///
    /// Returns the decoded JSON body from the first endpoint that answers
    /// 2xx without an application error.
    #[instrument(skip_all, fields(kind = ?request.kind))]
    pub async fn call(&self, request: &UpstreamRequest) -> Result<Value> {
        let count = self.endpoints.len();
        let start = self.preferred() % count;
        let mut attempts = 0u32;
        let mut last_err = None;

        for offset in 0..count {
            let index = (start + offset) % count;
            let endpoint = &self.endpoints[index];
            let http_request =
                HttpRequest::post_json(&endpoint.url, &request.body, request.kind)?;

            for attempt in 0..self.retry.max_attempts {
                attempts += 1;
                let response = match self.transport.send(&http_request).await {
                    Ok(response) => response,
                    Err(e) => {
                        record_attempt(endpoint, "error");
                        warn!(
                            endpoint = %endpoint.name,
                            error = %e,
                            "upstream unreachable, trying next endpoint"
                        );
                        last_err = Some(e);
                        break;
                    }
                };

                if response.is_rate_limited() {
                    record_attempt(endpoint, "rate_limited");
                    let retry_after = response.retry_after();
                    if attempt + 1 < self.retry.max_attempts {
                        let delay = self.retry.effective_delay(attempt, retry_after);
                        warn!(
                            endpoint = %endpoint.name,
                            attempt = attempt + 1,
                            max_attempts = self.retry.max_attempts,
                            delay_ms = duration_ms(delay),
                            "rate limited, backing off"
                        );
                        metrics::counter!(
                            telemetry::RETRIES_TOTAL,
                            "endpoint" => endpoint.name.clone()
                        )
                        .increment(1);
                        tokio::time::sleep(delay).await;
                    }
                    last_err = Some(MimirError::RateLimited { retry_after });
                    continue;
                }

                if !response.is_success() {
                    record_attempt(endpoint, "error");
                    warn!(
                        endpoint = %endpoint.name,
                        status = response.status,
                        "upstream error, trying next endpoint"
                    );
                    last_err = Some(status_error(&response));
                    break;
                }

                if let Some(message) = response.application_error() {
                    record_attempt(endpoint, "error");
                    warn!(
                        endpoint = %endpoint.name,
                        error = %message,
                        "application error, trying next endpoint"
                    );
                    last_err = Some(MimirError::Application(message));
                    break;
                }

                match response.json() {
                    Ok(body) => {
                        record_attempt(endpoint, "ok");
                        self.promote(index);
                        return Ok(body);
                    }
                    Err(e) => {
                        record_attempt(endpoint, "error");
                        warn!(
                            endpoint = %endpoint.name,
                            error = %e,
                            "undecodable response, trying next endpoint"
                        );
                        last_err = Some(e);
                        break;
                    }
                }
            }
        }

        Err(MimirError::Exhausted {
            attempts,
            last: Box::new(last_err.unwrap_or(MimirError::NoEndpoint)),
        })
    }

    /// A `'static` fetch closure for
    /// [`CacheOrchestrator::get_or_fetch`](crate::CacheOrchestrator::get_or_fetch).
    pub fn fetcher(
        self: &Arc<Self>,
        request: UpstreamRequest,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<Value>> + Send + 'static {
        let client = Arc::clone(self);
        move || async move { client.call(&request).await }.boxed()
    }

    fn promote(&self, index: usize) {
        let previous = self.preferred.swap(index, Ordering::Relaxed);
        if previous != index {
            let name = &self.endpoints[index].name;
            debug!(endpoint = %name, "promoting endpoint to preferred");
            metrics::counter!(telemetry::ENDPOINT_PROMOTIONS_TOTAL, "endpoint" => name.clone())
                .increment(1);
        }
    }
}

fn record_attempt(endpoint: &Endpoint, status: &'static str) {
    metrics::counter!(telemetry::UPSTREAM_ATTEMPTS_TOTAL,
        "endpoint" => endpoint.name.clone(),
        "status" => status,
    )
    .increment(1);
}

fn status_error(response: &HttpResponse) -> MimirError {
    let body = String::from_utf8_lossy(&response.body);
    let message: String = body.chars().take(ERROR_BODY_EXCERPT).collect();
    MimirError::Api {
        status: response.status,
        message,
    }
}
