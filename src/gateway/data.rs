//! DataGateway - the assembled data access stack

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::instrument;

use crate::cache::{CacheKey, CacheOrchestrator, DataMode};
use crate::intercept::InterceptingTransport;
use crate::store::PersistentStore;
use crate::upstream::{UpstreamClient, UpstreamRequest};
use crate::Result;

/// Cached, coalesced, failover-capable access to upstream data.
///
/// Built by [`MimirBuilder`](super::MimirBuilder). Cheap to share behind an
/// `Arc`; every method takes `&self`.
pub struct DataGateway {
    cache: CacheOrchestrator,
    upstream: Arc<UpstreamClient>,
    mode: DataMode,
    intercept: Option<Arc<InterceptingTransport>>,
}

impl DataGateway {
    pub(crate) fn new(
        cache: CacheOrchestrator,
        upstream: Arc<UpstreamClient>,
        mode: DataMode,
        intercept: Option<Arc<InterceptingTransport>>,
    ) -> Self {
        Self {
            cache,
            upstream,
            mode,
            intercept,
        }
    }

    /// Run `request` against the upstream through the cache.
    ///
    /// The cache key is `key` suffixed with the data mode as it is right
    /// now. The response body is decoded as `T` before it is stored, so a
    /// body that does not decode counts as a failed fetch and may be
    /// answered from stale data.
    #[instrument(skip_all, fields(name = %key.name()))]
    pub async fn query<T>(
        &self,
        key: &CacheKey,
        ttl: Duration,
        request: UpstreamRequest,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let key = self.key(key);
        let fetch = self.upstream.fetcher(request);
        self.cache
            .get_or_fetch(&key, ttl, move || async move {
                let body = fetch().await?;
                Ok(serde_json::from_value::<T>(body)?)
            })
            .await
    }

    /// Cache-or-fetch with a caller-supplied fetch function.
    ///
    /// `key` is used verbatim; build it with [`DataGateway::key`] to get
    /// the mode suffix.
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.cache.get_or_fetch(key, ttl, fetch).await
    }

    /// Full cache key for `key` under the current data mode.
    pub fn key(&self, key: &CacheKey) -> String {
        key.build(&self.mode)
    }

    /// The shared data mode flag.
    pub fn mode(&self) -> &DataMode {
        &self.mode
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    pub fn cache(&self) -> &CacheOrchestrator {
        &self.cache
    }

    pub fn store(&self) -> &Arc<PersistentStore> {
        self.cache.store()
    }

    /// The interception layer, when enabled.
    pub fn intercept(&self) -> Option<&Arc<InterceptingTransport>> {
        self.intercept.as_ref()
    }
}
