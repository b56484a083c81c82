//! Telemetry metric name constants.
//!
//! Consumers install their own `metrics` recorder (e.g. prometheus, statsd);
//! without a recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mimir_`. Counters end in `_total`.
//!
//! # Common labels
//!
//! - `endpoint`: upstream endpoint name
//! - `layer`: cache layer, "store" or "intercept"

/// Upstream calls issued by the resilient client, one per attempt.
///
/// Labels: `endpoint`, `status` ("ok" | "error" | "rate_limited").
pub const UPSTREAM_ATTEMPTS_TOTAL: &str = "mimir_upstream_attempts_total";

/// Times the preferred endpoint changed after a success elsewhere.
///
/// Labels: `endpoint` (the newly preferred one).
pub const ENDPOINT_PROMOTIONS_TOTAL: &str = "mimir_endpoint_promotions_total";

/// Retries after a rate-limit response (not counting the first attempt).
///
/// Labels: `endpoint`.
pub const RETRIES_TOTAL: &str = "mimir_retries_total";

/// Cache hits.
///
/// Labels: `layer`.
pub const CACHE_HITS_TOTAL: &str = "mimir_cache_hits_total";

/// Cache misses.
///
/// Labels: `layer`.
pub const CACHE_MISSES_TOTAL: &str = "mimir_cache_misses_total";

/// Failed fetches answered from stale data.
///
/// Labels: `layer`.
pub const STALE_FALLBACKS_TOTAL: &str = "mimir_stale_fallbacks_total";

/// Callers that joined an already in-flight fetch instead of starting one.
pub const COALESCED_TOTAL: &str = "mimir_coalesced_total";

/// Store read/write failures that were logged and swallowed.
///
/// Labels: `operation` ("load" | "save" | "sweep").
pub const STORE_ERRORS_TOTAL: &str = "mimir_store_errors_total";
