//! Backoff policy for registry calls.
//!
//! Transient failures (network errors, timeouts, 429s) are retried on a
//! doubling delay. A `Retry-After` hint from the registry raises the next
//! wait when it is longer than the computed one. Anything else, including a
//! 404 (which is a successful [`RegistryResponse::NotFound`]), returns at once.
//!
//! [`RegistryResponse::NotFound`]: super::RegistryResponse::NotFound

use crate::config::NetworkConfig;
use crate::error::{ProvenanceError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and delay curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first one. Never below 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `0.5..1.5`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::registry_default()
    }
}

impl RetryConfig {
    /// 4 attempts, waiting 5s, 10s and 20s in between.
    pub fn registry_default() -> Self {
        Self {
            max_attempts: NetworkConfig::MAX_ATTEMPTS,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            jitter: false,
        }
    }

    /// One attempt, no waiting.
    pub fn no_retry() -> Self {
        Self::registry_default().with_max_attempts(1)
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait after the failed attempt `retry` (0 for the first failure).
    pub fn backoff(&self, retry: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        let capped = doubled.min(self.max_delay);
        if !self.jitter {
            return capped;
        }
        let factor: f64 = rand::rng().random_range(0.5..1.5);
        capped.mul_f64(factor).min(self.max_delay)
    }

    /// Backoff, raised to the registry's `Retry-After` hint when that is longer.
    fn delay_after(&self, retry: u32, error: &ProvenanceError) -> Duration {
        let backoff = self.backoff(retry);
        match error {
            ProvenanceError::RateLimited {
                retry_after_secs: Some(secs),
                ..
            } => backoff.max(Duration::from_secs(*secs)).min(self.max_delay),
            _ => backoff,
        }
    }
}

/// How a retried call went.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
}

/// Run a registry call under `config`, retrying what [`ProvenanceError::is_retryable`] accepts.
pub async fn retry_registry<F, Fut, T>(config: &RetryConfig, mut call: F) -> (Result<T>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stats = RetryStats::default();
    let max_attempts = config.max_attempts.max(1);

    loop {
        stats.attempts += 1;
        let error = match call().await {
            Ok(value) => return (Ok(value), stats),
            Err(e) => e,
        };

        if !error.is_retryable() {
            debug!("Not retrying: {}", error);
            return (Err(error), stats);
        }
        if stats.attempts >= max_attempts {
            warn!("Giving up after {} attempts: {}", stats.attempts, error);
            return (Err(error), stats);
        }

        let delay = config.delay_after(stats.attempts - 1, &error);
        warn!(
            "Registry call failed ({}), attempt {}/{}; next try in {:?}",
            error, stats.attempts, max_attempts, delay
        );
        stats.total_delay += delay;
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn rate_limited(retry_after_secs: Option<u64>) -> ProvenanceError {
        ProvenanceError::RateLimited {
            service: "civitai.com".into(),
            retry_after_secs,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig::registry_default();
        assert_eq!(config.backoff(0), Duration::from_secs(5));
        assert_eq!(config.backoff(1), Duration::from_secs(10));
        assert_eq!(config.backoff(2), Duration::from_secs(20));
        assert_eq!(config.backoff(10), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = RetryConfig::registry_default()
            .with_base_delay(Duration::from_secs(2))
            .with_jitter(true);
        for _ in 0..20 {
            let delay = config.backoff(0);
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_then_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, stats) = retry_registry(&RetryConfig::registry_default(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ProvenanceError::Network {
                    message: "HTTP 503".into(),
                    cause: None,
                })
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.total_delay, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_exhausts_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let (result, stats) = retry_registry(&RetryConfig::registry_default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(rate_limited(None))
        })
        .await;

        assert!(matches!(result, Err(ProvenanceError::RateLimited { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(stats.total_delay, Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_raises_wait() {
        let config = RetryConfig::registry_default().with_max_attempts(2);
        let (_, stats) =
            retry_registry(&config, || async { Err::<(), _>(rate_limited(Some(30))) }).await;
        assert_eq!(stats.total_delay, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_definitive_error_is_not_retried() {
        let (result, stats) = retry_registry(&RetryConfig::registry_default(), || async {
            Err::<(), _>(ProvenanceError::Registry {
                status: 403,
                path: "/models/1".into(),
            })
        })
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
    }
}
