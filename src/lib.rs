//! Mimir - resilient, cached data access for rate-limited upstream APIs
//!
//! Four layers, from the caller down to the network:
//!
//! - [`CacheOrchestrator`]: cache-or-fetch per key, coalescing concurrent
//!   callers into one fetch and falling back to stale data on failure.
//! - [`PersistentStore`]: typed key-value store with absolute expiry.
//! - [`UpstreamClient`]: rotates across equivalent endpoints, backs off on
//!   rate limits, and remembers which endpoint last worked.
//! - [`InterceptingTransport`]: an optional whole-response cache at the
//!   transport boundary, with per-class freshness windows and offline
//!   fallback.
//!
//! [`Mimir::builder()`] assembles them into a [`DataGateway`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use mimir::{CacheKey, Mimir, RequestKind, UpstreamRequest};
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let gateway = Mimir::builder()
//!         .endpoint("primary", "https://graphql.anilist.co")
//!         .endpoint("mirror", "https://mirror.example/graphql")
//!         .store_path("/tmp/mimir/store.json")
//!         .build()
//!         .await?;
//!
//!     let key = CacheKey::new("media").param("id", 5114);
//!     let request = UpstreamRequest::graphql(
//!         RequestKind::StaticQuery,
//!         "query ($id: Int) { Media(id: $id) { title { romaji } } }",
//!         serde_json::json!({ "id": 5114 }),
//!     );
//!
//!     let body: serde_json::Value = gateway
//!         .query(&key, Duration::from_secs(3600), request)
//!         .await?;
//!     println!("{body}");
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod gateway;
pub mod intercept;
pub mod store;
pub mod telemetry;
pub mod transport;
pub mod upstream;

// Re-export main types at crate root
pub use cache::{CacheKey, CacheOrchestrator, DataMode};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{MimirError, Result};
pub use gateway::{DataGateway, Mimir, MimirBuilder};
pub use intercept::{InterceptConfig, InterceptingTransport};
pub use store::{CacheEntry, Lookup, PersistentStore};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, RequestKind, Transport};
pub use upstream::{Endpoint, RetryConfig, UpstreamClient, UpstreamRequest};
