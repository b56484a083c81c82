//! Transport-level interception cache.
//!
//! [`InterceptingTransport`] sits between the upstream client and the real
//! network. It is keyed by the literal request (method, URL, and body), so
//! it sees nothing of cache keys, data modes or TTLs, and it depends on no
//! other cache layer. Each request is classified by its [`RequestKind`]
//! tag into a [`CachePolicy`]; the policy picks a versioned response store
//! and a freshness rule.
//!
//! | Kind            | Class               | Store                  |
//! |-----------------|---------------------|------------------------|
//! | `Shell` (GET)   | cache-first         | `{prefix}-shell-{v}`   |
//! | `Asset` (GET)   | cache-first+refresh | `{prefix}-assets-{v}`  |
//! | `StaticQuery`   | windowed (long)     | `{prefix}-api-static-{v}` |
//! | `DynamicQuery`  | windowed (short)    | `{prefix}-api-dynamic-{v}` |
//! | anything else   | pass-through        |                        |
//!
//! [`RequestKind`]: crate::RequestKind

pub mod policy;
pub mod storage;
pub mod transport;

pub use policy::{CacheClass, CachePolicy, InterceptConfig};
pub use storage::ResponseStorage;
pub use transport::{CACHED_AT, InterceptingTransport};
