//! Persistent key-value store with explicit expiry.
//!
//! [`PersistentStore`] is a best-effort, typed facade over a
//! [`StoreBackend`]. Every entry carries an absolute `expires_at`; a lookup
//! past that instant is no longer *fresh* but the entry stays physically
//! present, and readable as *stale*, until the once-per-process
//! [`cleanup()`](PersistentStore::cleanup) sweep removes it.
//!
//! # Failure semantics
//!
//! No operation here returns an error. A failed read is a miss; a failed
//! write is logged and dropped. The caller already holds the value it
//! tried to persist, so the session keeps working, it just re-fetches more
//! often.

pub mod backend;

pub use backend::{FileBackend, MemoryBackend, StoreBackend};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock, duration_ms};
use crate::telemetry;

/// A stored payload and its expiry, in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub data: serde_json::Value,
    pub expires_at: u64,
}

impl CacheEntry {
    /// Whether the entry is still fresh at `now_ms` (inclusive bound).
    pub fn is_fresh(&self, now_ms: u64) -> bool {
        now_ms <= self.expires_at
    }
}

/// Outcome of a store lookup.
///
/// Keeps "old data" and "no data" apart so a caller cannot mistake one for
/// the other.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Fresh(T),
    Stale(T),
    Absent,
}

impl<T> Lookup<T> {
    /// The data, only if fresh.
    pub fn fresh(self) -> Option<T> {
        match self {
            Lookup::Fresh(data) => Some(data),
            _ => None,
        }
    }

    /// The data regardless of age.
    pub fn any(self) -> Option<T> {
        match self {
            Lookup::Fresh(data) | Lookup::Stale(data) => Some(data),
            Lookup::Absent => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Lookup::Absent)
    }
}

/// Typed, infallible store facade.
pub struct PersistentStore {
    backend: Arc<dyn StoreBackend>,
    clock: Arc<dyn Clock>,
    swept: AtomicBool,
}

impl PersistentStore {
    /// Wrap a backend using the system clock.
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self::with_clock(backend, Arc::new(SystemClock))
    }

    /// Wrap a backend with a custom clock.
    pub fn with_clock(backend: Arc<dyn StoreBackend>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            clock,
            swept: AtomicBool::new(false),
        }
    }

    /// In-memory store with default capacity.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// The clock used for expiry decisions.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Write `data` under `key`, expiring `ttl` from now.
    ///
    /// Overwrites any previous entry. Serialisation and backend failures are
    /// logged and swallowed.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, data: &T, ttl: Duration) {
        let data = match serde_json::to_value(data) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, error = %e, "failed to serialise cache payload");
                record_store_error("save");
                return;
            }
        };
        let expires_at = self.clock.now_ms().saturating_add(duration_ms(ttl));
        let entry = CacheEntry {
            key: key.to_string(),
            data,
            expires_at,
        };
        if let Err(e) = self.backend.save(entry).await {
            warn!(key, error = %e, "cache write failed");
            record_store_error("save");
        }
    }

    /// Look up `key`, classifying the result by age.
    ///
    /// Backend failures and payloads that no longer decode as `T` are
    /// reported as [`Lookup::Absent`].
    pub async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Lookup<T> {
        let entry = match self.backend.load(key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => return Lookup::Absent,
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                record_store_error("load");
                return Lookup::Absent;
            }
        };
        let fresh = entry.is_fresh(self.clock.now_ms());
        match serde_json::from_value::<T>(entry.data) {
            Ok(data) if fresh => Lookup::Fresh(data),
            Ok(data) => Lookup::Stale(data),
            Err(e) => {
                warn!(key, error = %e, "cached payload does not decode, treating as miss");
                record_store_error("load");
                Lookup::Absent
            }
        }
    }

    /// Data for `key` if present and unexpired.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key).await.fresh()
    }

    /// Data for `key` if present at all, ignoring expiry.
    pub async fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.lookup(key).await.any()
    }

    /// Delete expired entries. Runs at most once per store instance;
    /// subsequent calls return 0 without touching the backend.
    pub async fn cleanup(&self) -> usize {
        if self.swept.swap(true, Ordering::SeqCst) {
            return 0;
        }
        match self.backend.remove_expired(self.clock.now_ms()).await {
            Ok(removed) => {
                debug!(removed, "swept expired cache entries");
                removed
            }
            Err(e) => {
                warn!(error = %e, "cache sweep failed");
                record_store_error("sweep");
                0
            }
        }
    }
}

fn record_store_error(operation: &'static str) {
    metrics::counter!(telemetry::STORE_ERRORS_TOTAL, "operation" => operation).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::clock::ManualClock;
    use crate::{MimirError, Result};

    struct BrokenBackend;

    #[async_trait]
    impl StoreBackend for BrokenBackend {
        async fn load(&self, _key: &str) -> Result<Option<CacheEntry>> {
            Err(MimirError::Store("disk on fire".into()))
        }
        async fn save(&self, _entry: CacheEntry) -> Result<()> {
            Err(MimirError::Store("disk on fire".into()))
        }
        async fn remove_expired(&self, _now_ms: u64) -> Result<usize> {
            Err(MimirError::Store("disk on fire".into()))
        }
    }

    fn store_at(start_ms: u64) -> (PersistentStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let store = PersistentStore::with_clock(Arc::new(MemoryBackend::new()), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn fresh_until_expiry_inclusive() {
        let (store, clock) = store_at(0);
        store.set("k", "v1", Duration::from_millis(1000)).await;

        clock.set(1000);
        assert_eq!(store.get::<String>("k").await.as_deref(), Some("v1"));

        clock.set(1001);
        assert!(store.get::<String>("k").await.is_none());
        assert_eq!(store.get_stale::<String>("k").await.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn lookup_distinguishes_stale_from_absent() {
        let (store, clock) = store_at(0);
        store.set("k", &42u32, Duration::from_millis(10)).await;

        assert_eq!(store.lookup::<u32>("k").await, Lookup::Fresh(42));
        clock.advance(Duration::from_millis(11));
        assert_eq!(store.lookup::<u32>("k").await, Lookup::Stale(42));
        assert_eq!(store.lookup::<u32>("other").await, Lookup::Absent);
    }

    #[tokio::test]
    async fn set_overwrites_and_refreshes_expiry() {
        let (store, clock) = store_at(0);
        store.set("k", "v1", Duration::from_millis(100)).await;
        clock.set(150);
        store.set("k", "v2", Duration::from_millis(100)).await;
        assert_eq!(store.get::<String>("k").await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn huge_ttl_saturates_instead_of_wrapping() {
        let (store, clock) = store_at(0);
        store
            .set("k", "v", Duration::from_secs((1 << 61) + 1))
            .await;
        clock.set(5_000);
        assert_eq!(store.get::<String>("k").await.as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn undecodable_payload_is_absent() {
        let (store, _) = store_at(0);
        store.set("k", "not a number", Duration::from_secs(1)).await;
        assert!(store.lookup::<u32>("k").await.is_absent());
    }

    #[tokio::test]
    async fn broken_backend_degrades_to_miss() {
        let store = PersistentStore::new(Arc::new(BrokenBackend));
        store.set("k", "v", Duration::from_secs(1)).await;
        assert!(store.get::<String>("k").await.is_none());
        assert!(store.get_stale::<String>("k").await.is_none());
        assert_eq!(store.cleanup().await, 0);
    }

    #[tokio::test]
    async fn cleanup_runs_once() {
        let (store, clock) = store_at(0);
        store.set("a", "x", Duration::from_millis(10)).await;
        store.set("b", "y", Duration::from_millis(10)).await;
        clock.set(100);

        assert_eq!(store.cleanup().await, 2);
        assert!(store.get_stale::<String>("a").await.is_none());

        store.set("c", "z", Duration::from_millis(10)).await;
        clock.set(200);
        assert_eq!(store.cleanup().await, 0);
        assert_eq!(store.get_stale::<String>("c").await.as_deref(), Some("z"));
    }
}
