//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (CLI flag or builder argument)
//! 2. `~/.mimir/config.toml` (user)
//! 3. `/etc/mimir/config.toml` (system)
//!
//! ```toml
//! lite_mode = false
//!
//! [store]
//! path = "/var/cache/mimir/store.json"
//!
//! [upstream]
//! timeout_secs = 20
//! endpoints = [
//!     { name = "primary", url = "https://graphql.anilist.co" },
//!     { name = "mirror", url = "https://mirror.example/graphql" },
//! ]
//!
//! [upstream.retry]
//! max_attempts = 3
//! initial_delay_ms = 500
//!
//! [intercept]
//! version = "v2"
//! dynamic_window_secs = 1800
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::intercept::InterceptConfig;
use crate::store::backend::DEFAULT_MAX_ENTRIES;
use crate::upstream::{Endpoint, RetryConfig};
use crate::{MimirError, Result};

/// Full gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Start in lite data mode (default: false).
    #[serde(default)]
    pub lite_mode: bool,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Transport interception. Enabled when the section is present.
    #[serde(default)]
    pub intercept: Option<InterceptConfig>,
}

/// Persistent store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// JSON file to persist entries in. In-memory when unset.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Capacity of the in-memory backend (default: 10000).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_entries: default_max_entries(),
        }
    }
}

fn default_max_entries() -> u64 {
    DEFAULT_MAX_ENTRIES
}

/// Upstream endpoints and retry behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    /// Per-request timeout in seconds (default: 30).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_secs: default_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.mimir/config.toml`
    /// 3. `/etc/mimir/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            MimirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        Self::parse(&content).map_err(|e| match e {
            MimirError::Configuration(msg) => {
                MimirError::Configuration(format!("{msg} (in {path:?})"))
            }
            other => other,
        })
    }

    /// Parse a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| MimirError::Configuration(format!("Failed to parse config: {e}")))
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(MimirError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mimir").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/mimir/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(MimirError::Configuration(
            "No config file found. Create ~/.mimir/config.toml or /etc/mimir/config.toml"
                .to_string(),
        ))
    }
}

/// Deserialize a [`Duration`](std::time::Duration) from integer milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Deserialize a [`Duration`](std::time::Duration) from integer seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
