//! Registry transport: one GET against the registry API.
//!
//! [`HttpTransport`] is the reqwest implementation with:
//! - Client-side pacing through a `governor` rate limiter
//! - Rate limit tracking from `X-RateLimit-*` response headers
//! - Status mapping into [`RegistryResponse`] or typed errors
//!
//! Retries live one level up in [`super::RegistryClient`].

use crate::config::{NetworkConfig, RegistryDomain};
use crate::error::{ProvenanceError, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{header, Client, Response, StatusCode};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Outcome of a successful exchange with the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryResponse {
    Found(serde_json::Value),
    /// HTTP 404: the registry definitively has no such resource.
    NotFound,
}

/// Read-only access to the registry HTTP API.
///
/// `path` is relative to the API base, e.g. `/model-versions/12`.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<RegistryResponse>;
}

/// Rate limit state extracted from response headers.
#[derive(Debug, Clone, Default)]
pub struct RateLimitState {
    pub remaining: Option<u64>,
    pub limit: Option<u64>,
    /// Unix timestamp when the rate limit resets.
    pub reset: Option<u64>,
}

impl RateLimitState {
    /// Throttle when the remaining budget is under 10% of the limit.
    pub fn should_throttle(&self) -> bool {
        match (self.remaining, self.limit) {
            (Some(remaining), Some(limit)) if limit > 0 => {
                let threshold = (limit as f64 * 0.1) as u64;
                remaining < threshold.max(1)
            }
            _ => false,
        }
    }

    pub fn time_until_reset(&self) -> Option<Duration> {
        let reset = self.reset?;
        let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
        (reset > now).then(|| Duration::from_secs(reset - now))
    }

    /// Pause before the next request, if any.
    ///
    /// An exhausted budget waits for the advertised reset; a low one waits
    /// `fallback`. Never longer than `cap`.
    pub fn throttle_wait(&self, fallback: Duration, cap: Duration) -> Option<Duration> {
        if !self.should_throttle() {
            return None;
        }
        let wait = match self.remaining {
            Some(0) => self.time_until_reset().unwrap_or(fallback),
            _ => fallback,
        };
        Some(wait.min(cap))
    }
}

/// reqwest-backed [`RegistryTransport`].
pub struct HttpTransport {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    limiter: DefaultDirectRateLimiter,
    rate_limit_remaining: AtomicI64,
    rate_limit_limit: AtomicU64,
    rate_limit_reset: AtomicU64,
    throttle_delay: Duration,
}

impl HttpTransport {
    pub fn new(domain: RegistryDomain) -> Result<Self> {
        Self::with_options(
            domain.api_base(),
            None,
            NetworkConfig::REQUEST_TIMEOUT,
            NetworkConfig::REQUESTS_PER_SECOND,
        )
    }

    /// Build a transport against an arbitrary API base URL.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| ProvenanceError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        let rate = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            timeout,
            limiter: RateLimiter::direct(Quota::per_second(rate)),
            rate_limit_remaining: AtomicI64::new(-1),
            rate_limit_limit: AtomicU64::new(0),
            rate_limit_reset: AtomicU64::new(0),
            throttle_delay: NetworkConfig::THROTTLE_DELAY,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.trim().is_empty());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn rate_limit_state(&self) -> RateLimitState {
        let remaining = self.rate_limit_remaining.load(Ordering::SeqCst);
        let limit = self.rate_limit_limit.load(Ordering::SeqCst);
        let reset = self.rate_limit_reset.load(Ordering::SeqCst);
        RateLimitState {
            remaining: (remaining >= 0).then_some(remaining as u64),
            limit: (limit > 0).then_some(limit),
            reset: (reset > 0).then_some(reset),
        }
    }

    async fn pace(&self) {
        self.limiter.until_ready().await;

        let state = self.rate_limit_state();
        if let Some(wait) = state.throttle_wait(self.throttle_delay, NetworkConfig::RETRY_MAX_DELAY) {
            warn!(
                "Rate limit approaching (remaining: {:?}/{:?}), throttling for {:?}",
                state.remaining, state.limit, wait
            );
            tokio::time::sleep(wait).await;
        }
    }

    fn update_rate_limits(&self, response: &Response) {
        let headers = response.headers();
        let parse = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        if let Some(num) = parse("X-RateLimit-Remaining").and_then(|v| v.parse::<i64>().ok()) {
            self.rate_limit_remaining.store(num, Ordering::SeqCst);
        }
        if let Some(num) = parse("X-RateLimit-Limit").and_then(|v| v.parse::<u64>().ok()) {
            self.rate_limit_limit.store(num, Ordering::SeqCst);
        }
        if let Some(num) = parse("X-RateLimit-Reset").and_then(|v| v.parse::<u64>().ok()) {
            self.rate_limit_reset.store(num, Ordering::SeqCst);
        }
    }
}

/// Map an HTTP status to a transport outcome. `Ok(None)` means success.
pub fn classify_status(
    status: StatusCode,
    path: &str,
    service: &str,
    retry_after_secs: Option<u64>,
) -> Result<Option<RegistryResponse>> {
    if status.is_success() {
        return Ok(None);
    }
    match status.as_u16() {
        404 => Ok(Some(RegistryResponse::NotFound)),
        429 => Err(ProvenanceError::RateLimited {
            service: service.to_string(),
            retry_after_secs,
        }),
        408 | 500..=599 => Err(ProvenanceError::Network {
            message: format!("GET {} failed with HTTP {}", path, status.as_u16()),
            cause: status.canonical_reason().map(str::to_string),
        }),
        code => Err(ProvenanceError::Registry {
            status: code,
            path: path.to_string(),
        }),
    }
}

#[async_trait]
impl RegistryTransport for HttpTransport {
    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<RegistryResponse> {
        self.pace().await;

        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(query);
        if let Some(key) = &self.api_key {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProvenanceError::Timeout(self.timeout)
            } else {
                ProvenanceError::Network {
                    message: format!("GET {} failed: {}", path, e),
                    cause: None,
                }
            }
        })?;

        self.update_rate_limits(&response);

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());

        if let Some(outcome) =
            classify_status(response.status(), path, &extract_domain(&url), retry_after)?
        {
            debug!("GET {} -> not found", path);
            return Ok(outcome);
        }

        let body = response.json::<serde_json::Value>().await.map_err(|e| {
            ProvenanceError::MalformedPayload {
                message: format!("GET {} returned invalid JSON: {}", path, e),
            }
        })?;
        Ok(RegistryResponse::Found(body))
    }
}

/// Extract domain from a URL.
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.host_str().unwrap_or("unknown").to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
