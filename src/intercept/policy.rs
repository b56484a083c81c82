//! Per-request caching policy.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::transport::{HttpRequest, RequestKind};

/// Default capacity of each named response store.
pub const DEFAULT_MAX_ENTRIES: u64 = 500;

/// How the interception layer treats a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheClass {
    /// Serve from cache when present, never expire (until a version bump).
    CacheFirst,
    /// Serve from cache when present and refresh it in the background.
    CacheFirstRefresh,
    /// Serve from cache while younger than the policy's `max_age`.
    Windowed,
    /// Always go to the network, never store.
    NoCache,
}

/// Classification record for one request. Computed per request, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
    pub class: CacheClass,
    /// Versioned store name the response lives in.
    pub store: String,
    pub max_age: Option<Duration>,
}

impl CachePolicy {
    fn no_cache() -> Self {
        Self {
            class: CacheClass::NoCache,
            store: String::new(),
            max_age: None,
        }
    }
}

/// Configuration for the interception layer.
///
/// ```rust
/// # use mimir::InterceptConfig;
/// # use std::time::Duration;
/// let config = InterceptConfig::new()
///     .version("v7")
///     .dynamic_window(Duration::from_secs(600))
///     .shell_asset("https://app.example/index.html");
/// assert_eq!(config.store_name("shell"), "mimir-shell-v7");
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct InterceptConfig {
    /// Prefix shared by every store this layer owns. Default: `"mimir"`.
    pub prefix: String,
    /// Version tag; stores with the prefix but another tag are deleted on
    /// activation. Default: `"v1"`.
    pub version: String,
    /// Freshness window for static queries. Default: 24 hours.
    #[serde(rename = "static_window_secs", with = "crate::config::duration_secs")]
    pub static_window: Duration,
    /// Freshness window for dynamic queries. Default: 30 minutes.
    #[serde(rename = "dynamic_window_secs", with = "crate::config::duration_secs")]
    pub dynamic_window: Duration,
    /// Shell asset URLs fetched at install time.
    pub shell_assets: Vec<String>,
    /// Directory to persist response stores in. In-memory when unset.
    pub storage_dir: Option<PathBuf>,
    /// Capacity of each named store. Default: 500 responses.
    pub max_entries: u64,
}

impl Default for InterceptConfig {
    fn default() -> Self {
        Self {
            prefix: "mimir".to_string(),
            version: "v1".to_string(),
            static_window: Duration::from_secs(24 * 3600),
            dynamic_window: Duration::from_secs(30 * 60),
            shell_assets: Vec::new(),
            storage_dir: None,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl InterceptConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store version tag.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the store name prefix.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the freshness window for static queries.
    pub fn static_window(mut self, window: Duration) -> Self {
        self.static_window = window;
        self
    }

    /// Set the freshness window for dynamic queries.
    pub fn dynamic_window(mut self, window: Duration) -> Self {
        self.dynamic_window = window;
        self
    }

    /// Add a shell asset to pre-cache.
    pub fn shell_asset(mut self, url: impl Into<String>) -> Self {
        self.shell_assets.push(url.into());
        self
    }

    /// Persist stores under `dir`.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = Some(dir.into());
        self
    }

    /// Bound each named store to `max` responses.
    pub fn max_entries(mut self, max: u64) -> Self {
        self.max_entries = max;
        self
    }

    /// Full versioned name for the logical store `store`.
    pub fn store_name(&self, store: &str) -> String {
        format!("{}-{}-{}", self.prefix, store, self.version)
    }

    /// Whether `name` belongs to this layer but to a different version.
    pub fn is_outdated_store(&self, name: &str) -> bool {
        let prefix = format!("{}-", self.prefix);
        let suffix = format!("-{}", self.version);
        name.starts_with(&prefix) && !name.ends_with(&suffix)
    }

    /// Classify a request by its kind tag and method.
    ///
    /// Shell and asset requests are only cached for `GET`; queries are
    /// cached whatever their method, keyed by their full body.
    pub fn classify(&self, request: &HttpRequest) -> CachePolicy {
        let is_get = request.method.eq_ignore_ascii_case("GET");
        match request.kind {
            RequestKind::Shell if is_get => CachePolicy {
                class: CacheClass::CacheFirst,
                store: self.store_name("shell"),
                max_age: None,
            },
            RequestKind::Asset if is_get => CachePolicy {
                class: CacheClass::CacheFirstRefresh,
                store: self.store_name("assets"),
                max_age: None,
            },
            RequestKind::StaticQuery => CachePolicy {
                class: CacheClass::Windowed,
                store: self.store_name("api-static"),
                max_age: Some(self.static_window),
            },
            RequestKind::DynamicQuery => CachePolicy {
                class: CacheClass::Windowed,
                store: self.store_name("api-dynamic"),
                max_age: Some(self.dynamic_window),
            },
            _ => CachePolicy::no_cache(),
        }
    }
}
