//! Builder for configuring gateway instances

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::DataGateway;
use crate::cache::{CacheOrchestrator, DataMode};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::intercept::{InterceptConfig, InterceptingTransport};
use crate::store::backend::DEFAULT_MAX_ENTRIES;
use crate::store::{FileBackend, MemoryBackend, PersistentStore, StoreBackend};
use crate::transport::http::DEFAULT_TIMEOUT;
use crate::transport::{ReqwestTransport, Transport};
use crate::upstream::{Endpoint, RetryConfig, UpstreamClient};
use crate::{MimirError, Result};

/// Main entry point for creating gateway instances.
pub struct Mimir;

impl Mimir {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> MimirBuilder {
        MimirBuilder::new()
    }
}

/// Builder for configuring gateway instances.
pub struct MimirBuilder {
    endpoints: Vec<Endpoint>,
    retry: RetryConfig,
    store_path: Option<PathBuf>,
    max_entries: u64,
    intercept: Option<InterceptConfig>,
    timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    lite_mode: bool,
}

impl MimirBuilder {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            retry: RetryConfig::default(),
            store_path: None,
            max_entries: DEFAULT_MAX_ENTRIES,
            intercept: None,
            timeout: None,
            transport: None,
            clock: Arc::new(SystemClock),
            lite_mode: false,
        }
    }

    /// Start from a loaded [`Config`]. Later builder calls override it.
    pub fn from_config(config: &Config) -> Self {
        Self {
            endpoints: config.upstream.endpoints.clone(),
            retry: config.upstream.retry.clone(),
            store_path: config.store.path.clone(),
            max_entries: config.store.max_entries,
            intercept: config.intercept.clone(),
            timeout: Some(Duration::from_secs(config.upstream.timeout_secs)),
            lite_mode: config.lite_mode,
            ..Self::new()
        }
    }

    /// Add an upstream endpoint. Endpoints are tried in the order added.
    pub fn endpoint(mut self, name: impl Into<String>, url: impl Into<String>) -> Self {
        self.endpoints.push(Endpoint::new(name, url));
        self
    }

    /// Set the rate-limit retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Persist the store to a JSON file instead of keeping it in memory.
    pub fn store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    /// Capacity of the in-memory store (ignored with [`store_path`](Self::store_path)).
    pub fn max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }

    /// Enable the transport interception layer.
    pub fn intercept(mut self, config: InterceptConfig) -> Self {
        self.intercept = Some(config);
        self
    }

    /// Set the per-request network timeout (default: 30s).
    ///
    /// Only applies to the built-in transport.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the network transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the clock used for expiry and freshness windows.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Start in lite data mode.
    pub fn lite_mode(mut self, lite: bool) -> Self {
        self.lite_mode = lite;
        self
    }

    /// Build the gateway.
    ///
    /// Opens the store and sweeps its expired entries. With interception
    /// enabled, also deletes outdated response stores and installs the
    /// shell assets.
    pub async fn build(self) -> Result<DataGateway> {
        if self.endpoints.is_empty() {
            return Err(MimirError::NoEndpoint);
        }

        let network: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::with_timeout(
                self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            )),
        };

        let (transport, intercept): (Arc<dyn Transport>, Option<Arc<InterceptingTransport>>) =
            match self.intercept {
                Some(config) => {
                    let nic = Arc::new(
                        InterceptingTransport::open(network, config)
                            .await
                            .with_clock(self.clock.clone()),
                    );
                    let purged = nic.activate().await;
                    nic.install().await;
                    if !purged.is_empty() {
                        info!(stores = ?purged, "purged outdated response stores");
                    }
                    (nic.clone() as Arc<dyn Transport>, Some(nic))
                }
                None => (network, None),
            };

        let backend: Arc<dyn StoreBackend> = match self.store_path {
            Some(path) => Arc::new(FileBackend::open(path).await),
            None => Arc::new(MemoryBackend::with_max_entries(self.max_entries)),
        };
        let store = Arc::new(PersistentStore::with_clock(backend, self.clock));
        store.cleanup().await;

        let upstream = Arc::new(UpstreamClient::new(self.endpoints, transport, self.retry)?);

        Ok(DataGateway::new(
            CacheOrchestrator::new(store),
            upstream,
            DataMode::new(self.lite_mode),
            intercept,
        ))
    }
}

impl Default for MimirBuilder {
    fn default() -> Self {
        Self::new()
    }
}
