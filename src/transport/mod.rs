//! Transport boundary shared by the interception cache and the upstream client.
//!
//! A [`Transport`] turns an [`HttpRequest`] into an [`HttpResponse`]. `Err`
//! is reserved for network-level failures (unreachable host, timeout, reset);
//! any response the server actually sent, whatever its status, is `Ok`.
//!
//! Layers stack by wrapping: the
//! [`InterceptingTransport`](crate::intercept::InterceptingTransport) is
//! itself a `Transport` around another one, and the
//! [`UpstreamClient`](crate::upstream::UpstreamClient) only ever sees the
//! outermost.

pub mod http;

pub use http::ReqwestTransport;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Result;

/// Header carrying the server's rate-limit wait hint.
pub const RETRY_AFTER: &str = "retry-after";

/// Caller-declared request category.
///
/// The component that builds a request knows what it is asking for, so it
/// tags the request instead of leaving the cache layer to guess from the
/// payload. The interception cache maps each kind to a caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Application shell asset, pre-cached at install time.
    Shell,
    /// Immutable binary asset (poster, banner, thumbnail).
    Asset,
    /// Upstream query with slowly-changing results: entity by id, bulk by
    /// id list, enumerations, search and discover listings.
    StaticQuery,
    /// Upstream query with fast-changing results: carousels, airing
    /// schedules, autocomplete suggestions.
    DynamicQuery,
    /// Never cached at the transport layer.
    #[default]
    Uncached,
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub kind: RequestKind,
}

impl HttpRequest {
    /// A `GET` request with no body.
    pub fn get(url: impl Into<String>, kind: RequestKind) -> Self {
        Self {
            method: "GET".to_string(),
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
            kind,
        }
    }

    /// A `POST` request with a JSON body.
    pub fn post_json(
        url: impl Into<String>,
        body: &serde_json::Value,
        kind: RequestKind,
    ) -> Result<Self> {
        Ok(Self {
            method: "POST".to_string(),
            url: url.into(),
            headers: vec![
                ("content-type".to_string(), "application/json".to_string()),
                ("accept".to_string(), "application/json".to_string()),
            ],
            body: serde_json::to_vec(body)?,
            kind,
        })
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Identity of the literal request: method, target, and serialized body.
    ///
    /// Two requests with the same fingerprint are interchangeable for
    /// transport-level caching. Headers are not part of the identity.
    /// Bodies that are not UTF-8 are base64-encoded and marked on the first
    /// line, which otherwise holds only the space-free method and URL.
    pub fn fingerprint(&self) -> String {
        match std::str::from_utf8(&self.body) {
            Ok(text) => format!("{} {}\n{text}", self.method, self.url),
            Err(_) => format!(
                "{} {} base64\n{}",
                self.method,
                self.url,
                BASE64.encode(&self.body)
            ),
        }
    }
}

/// A response as received from (or synthesised in place of) the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A response with a status and body and no headers.
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// The 503 returned when the network failed and nothing was cached.
    pub fn service_unavailable() -> Self {
        Self::new(503, "offline and no cached response available").with_header(
            "content-type",
            "text/plain",
        )
    }

    /// Add a header, replacing any existing one with the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the upstream asked the caller to slow down.
    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    /// Parse a `Retry-After` header given in whole seconds.
    ///
    /// HTTP-date values are not supported and yield `None`.
    pub fn retry_after(&self) -> Option<Duration> {
        self.header(RETRY_AFTER)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Error message embedded in an otherwise successful JSON body.
    ///
    /// Recognises the GraphQL convention of a non-empty top-level `errors`
    /// array and returns the first entry's `message`. Bodies that are not
    /// JSON objects never carry an application error.
    pub fn application_error(&self) -> Option<String> {
        let value: serde_json::Value = serde_json::from_slice(&self.body).ok()?;
        let errors = value.get("errors")?.as_array()?;
        let first = errors.first()?;
        Some(
            first
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown upstream error")
                .to_string(),
        )
    }

    /// Body decoded as JSON.
    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Sends requests over the network (or something standing in for it).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request. `Err` only for network-level failure.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse>;
}
