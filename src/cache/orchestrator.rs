//! Cache-or-fetch with request coalescing and stale fallback.
//!
//! # Flow
//!
//! ```text
//! get_or_fetch(key, ttl, fetch)
//!        │
//!        ├── in flight for key? ──────────────► await the shared handle
//!        │
//!        ├── store has fresh entry? ──────────► return it
//!        │
//!        └── register handle, spawn task:
//!                fetch()
//!                  ├── Ok  → store.set(key, ttl) → Ok(data)
//!                  └── Err → store.get_stale(key)
//!                              ├── Some → warn, Ok(stale)
//!                              └── None → Err(original)
//!                registry entry removed (drop guard)
//! ```
//!
//! The fetch runs on its own tokio task, so a caller that stops waiting
//! does not cancel it: the result still lands in the store for the next
//! caller.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::clock::duration_ms;
use crate::store::PersistentStore;
use crate::telemetry;
use crate::{MimirError, Result};

type FetchOutcome = std::result::Result<Value, Arc<MimirError>>;
type InFlight = Shared<BoxFuture<'static, FetchOutcome>>;
type Registry = Arc<Mutex<HashMap<String, InFlight>>>;

/// Single entry point for cached data access.
///
/// Holds the in-flight registry: at most one fetch per key is outstanding
/// at any time, and concurrent callers for that key share its result.
pub struct CacheOrchestrator {
    store: Arc<PersistentStore>,
    in_flight: Registry,
}

impl CacheOrchestrator {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self {
            store,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<PersistentStore> {
        &self.store
    }

    /// Number of fetches currently outstanding.
    pub fn in_flight(&self) -> usize {
        lock(&self.in_flight).len()
    }

    /// Return fresh cached data for `key`, or fetch, store, and return it.
    ///
    /// `fetch` is invoked at most once per call and only when no fetch for
    /// `key` is already running and no fresh entry exists. If it fails and
    /// the store still holds an expired entry, that entry is returned as a
    /// success. An empty result is a valid result and is cached like any
    /// other.
    #[instrument(skip(self, fetch), fields(ttl_ms = duration_ms(ttl)))]
    pub async fn get_or_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if let Some(handle) = self.joinable(key) {
            metrics::counter!(telemetry::COALESCED_TOTAL).increment(1);
            debug!("joining in-flight fetch");
            return settle(handle.await);
        }

        if let Some(data) = self.store.get::<T>(key).await {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "layer" => "store").increment(1);
            return Ok(data);
        }
        metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "layer" => "store").increment(1);

        // The store read above was a suspension point; another caller may
        // have registered a fetch for this key in the meantime.
        let handle = {
            let mut registry = lock(&self.in_flight);
            match registry.get(key) {
                Some(handle) => {
                    metrics::counter!(telemetry::COALESCED_TOTAL).increment(1);
                    handle.clone()
                }
                None => {
                    let handle = self.spawn_fetch(key, ttl, fetch);
                    registry.insert(key.to_string(), handle.clone());
                    handle
                }
            }
        };

        settle(handle.await)
    }

    fn joinable(&self, key: &str) -> Option<InFlight> {
        lock(&self.in_flight).get(key).cloned()
    }

    fn spawn_fetch<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> InFlight
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let store = self.store.clone();
        let guard = InFlightGuard {
            registry: self.in_flight.clone(),
            key: key.to_string(),
        };

        let task = tokio::spawn(async move {
            let guard = guard;
            let key = guard.key.as_str();
            let outcome: FetchOutcome = match fetch().await {
                Ok(data) => match serde_json::to_value(&data) {
                    Ok(value) => {
                        store.set(key, &value, ttl).await;
                        Ok(value)
                    }
                    Err(e) => Err(Arc::new(MimirError::from(e))),
                },
                Err(e) => match store.get_stale::<Value>(key).await {
                    Some(stale) => {
                        warn!(key, error = %e, "fetch failed, serving stale data");
                        metrics::counter!(telemetry::STALE_FALLBACKS_TOTAL, "layer" => "store")
                            .increment(1);
                        Ok(stale)
                    }
                    None => Err(Arc::new(e)),
                },
            };
            outcome
        });

        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => Err(Arc::new(MimirError::Internal(format!(
                    "fetch task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared()
    }
}

/// Removes a key from the registry when its fetch task ends, on every exit
/// path including panics.
struct InFlightGuard {
    registry: Registry,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        lock(&self.registry).remove(&self.key);
    }
}

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, InFlight>> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn settle<T: DeserializeOwned>(outcome: FetchOutcome) -> Result<T> {
    match outcome {
        Ok(value) => Ok(serde_json::from_value(value)?),
        Err(e) => Err(Arc::try_unwrap(e).unwrap_or_else(MimirError::Shared)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::clock::ManualClock;
    use crate::store::MemoryBackend;

    fn orchestrator() -> (CacheOrchestrator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = PersistentStore::with_clock(Arc::new(MemoryBackend::new()), clock.clone());
        (CacheOrchestrator::new(Arc::new(store)), clock)
    }

    #[tokio::test]
    async fn registry_is_empty_after_success_and_failure() {
        let (co, _) = orchestrator();

        let ok: String = co
            .get_or_fetch("a", Duration::from_secs(1), || async { Ok("x".to_string()) })
            .await
            .unwrap();
        assert_eq!(ok, "x");
        assert_eq!(co.in_flight(), 0);

        let err = co
            .get_or_fetch::<String, _, _>("b", Duration::from_secs(1), || async {
                Err(MimirError::Http("down".into()))
            })
            .await;
        assert!(err.is_err());
        assert_eq!(co.in_flight(), 0);
    }

    async fn explode() -> Result<String> {
        panic!("fetch exploded")
    }

    #[tokio::test]
    async fn panicking_fetch_does_not_leave_registry_entry() {
        let (co, _) = orchestrator();
        let result = co
            .get_or_fetch("p", Duration::from_secs(1), explode)
            .await;
        assert!(matches!(result, Err(MimirError::Internal(_))));
        assert_eq!(co.in_flight(), 0);
    }

    #[tokio::test]
    async fn empty_result_is_cached() {
        let (co, _) = orchestrator();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let items: Vec<u32> = co
                .get_or_fetch("empty", Duration::from_secs(60), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::<u32>::new())
                })
                .await
                .unwrap();
            assert!(items.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_cache_entry_triggers_fetch() {
        let (co, _) = orchestrator();
        co.store()
            .set("k", "not a number", Duration::from_secs(60))
            .await;

        let value: u32 = co
            .get_or_fetch("k", Duration::from_secs(60), || async { Ok(9u32) })
            .await
            .unwrap();
        assert_eq!(value, 9);
    }
}
