//! Remote registry access.
//!
//! This module provides:
//! - Retry logic with exponential backoff
//! - A transport trait with a rate-limited reqwest implementation
//! - The registry client that persists everything it fetches

mod client;
mod registry;
mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    classify_status, extract_domain, HttpTransport, RateLimitState, RegistryResponse,
    RegistryTransport,
};
pub use registry::{ImageFetch, RegistryClient};
pub use retry::{retry_registry, RetryConfig, RetryStats};
