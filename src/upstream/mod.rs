//! Resilient upstream access.
//!
//! [`UpstreamClient`] performs the real calls, rotating across equivalent
//! [`Endpoint`]s and backing off on rate limits per [`RetryConfig`].

pub mod client;
pub mod retry;

pub use client::{Endpoint, UpstreamClient, UpstreamRequest};
pub use retry::RetryConfig;
