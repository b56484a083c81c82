//! Application-level caching.
//!
//! - [`CacheOrchestrator`]: cache-or-fetch with per-key request coalescing
//!   and stale fallback, on top of [`PersistentStore`](crate::store::PersistentStore).
//! - [`CacheKey`]: deterministic key construction.
//! - [`DataMode`]: the reduced-data toggle every key is suffixed with.

pub mod key;
pub mod orchestrator;

pub use key::{CacheKey, DataMode};
pub use orchestrator::CacheOrchestrator;
