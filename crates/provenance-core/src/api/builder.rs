//! Builder for configuring ProvenanceEngine initialization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::analysis::Analyzer;
use crate::config::{NetworkConfig, PathsConfig, RegistryConfig, RegistryDomain, ScanConfig};
use crate::error::{ProvenanceError, Result};
use crate::inventory::{FolderLayout, InventoryScanner, ModelDirectories};
use crate::network::{HttpTransport, RegistryClient, RegistryTransport, RetryConfig};
use crate::resolution::IdentityResolver;
use crate::store::IdentityStore;
use crate::ProvenanceEngine;
use tracing::{debug, info};

/// Builder for configuring ProvenanceEngine initialization.
///
/// # Example
///
/// ```rust,ignore
/// use provenance_core::{FolderLayout, ProvenanceEngine, RegistryDomain};
///
/// let engine = ProvenanceEngine::builder("./data")
///     .with_provider(FolderLayout::from_models_root("./models"))
///     .with_domain(RegistryDomain::Work)
///     .with_negative_ttl(std::time::Duration::from_secs(3600))
///     .build()?;
/// ```
pub struct ProvenanceEngineBuilder {
    data_dir: PathBuf,
    db_path: Option<PathBuf>,
    in_memory: bool,
    provider: Option<Arc<dyn ModelDirectories>>,
    transport: Option<Arc<dyn RegistryTransport>>,
    domain: Option<RegistryDomain>,
    api_key: Option<String>,
    retry: RetryConfig,
    negative_ttl: Duration,
    refresh_interval: Duration,
    hash_workers: Option<usize>,
    hash_timeout: Duration,
    lookup_timeout: Duration,
    request_timeout: Duration,
    requests_per_second: u32,
    page_delay: Duration,
    prewarm_concurrency: usize,
    backfill_concurrency: usize,
}

impl ProvenanceEngineBuilder {
    /// Create a new builder with the data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            db_path: None,
            in_memory: false,
            provider: None,
            transport: None,
            domain: None,
            api_key: None,
            retry: RetryConfig::registry_default(),
            negative_ttl: RegistryConfig::NEGATIVE_CACHE_TTL,
            refresh_interval: ScanConfig::REFRESH_INTERVAL,
            hash_workers: None,
            hash_timeout: ScanConfig::HASH_TIMEOUT,
            lookup_timeout: RegistryConfig::LOOKUP_TIMEOUT,
            request_timeout: NetworkConfig::REQUEST_TIMEOUT,
            requests_per_second: NetworkConfig::REQUESTS_PER_SECOND,
            page_delay: RegistryConfig::IMAGES_PAGE_DELAY,
            prewarm_concurrency: RegistryConfig::PREWARM_CONCURRENCY,
            backfill_concurrency: RegistryConfig::BACKFILL_CONCURRENCY,
        }
    }

    /// Database file location. Default: `<data_dir>/provenance.db`.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    /// Keep the store in memory. Nothing is written to `data_dir`.
    pub fn in_memory(mut self, enable: bool) -> Self {
        self.in_memory = enable;
        self
    }

    /// Host view of the model directories. Default: no directories.
    pub fn with_provider(mut self, provider: impl ModelDirectories + 'static) -> Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    pub fn with_shared_provider(mut self, provider: Arc<dyn ModelDirectories>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Registry transport. Default: an [`HttpTransport`] against the selected domain.
    pub fn with_transport(mut self, transport: Arc<dyn RegistryTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registry mirror. Persisted so later opens without a domain reuse it.
    pub fn with_domain(mut self, domain: RegistryDomain) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// How long a not-found answer suppresses new lookups. Default: 24 hours.
    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    /// Minimum time between unforced syncs of a category. Default: 1 hour.
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Concurrent hash computations. Default: available CPU cores.
    pub fn with_hash_workers(mut self, workers: usize) -> Self {
        self.hash_workers = Some(workers);
        self
    }

    pub fn with_hash_timeout(mut self, timeout: Duration) -> Self {
        self.hash_timeout = timeout;
        self
    }

    /// Upper bound for one lookup inside a batch, retries included.
    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Per-request HTTP timeout of the default transport.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_requests_per_second(mut self, rate: u32) -> Self {
        self.requests_per_second = rate;
        self
    }

    /// Pause between pages of sample outputs.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn with_prewarm_concurrency(mut self, concurrency: usize) -> Self {
        self.prewarm_concurrency = concurrency.max(1);
        self
    }

    pub fn with_backfill_concurrency(mut self, concurrency: usize) -> Self {
        self.backfill_concurrency = concurrency.max(1);
        self
    }

    fn open_store(&self) -> Result<IdentityStore> {
        if self.in_memory {
            return IdentityStore::open_in_memory();
        }
        let db_path = self
            .db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(PathsConfig::DATABASE_FILENAME));
        IdentityStore::open(db_path)
    }

    fn resolve_domain(&self, store: &IdentityStore) -> Result<RegistryDomain> {
        if let Some(domain) = self.domain {
            store.set_setting(RegistryConfig::DOMAIN_SETTING_KEY, domain.as_str())?;
            return Ok(domain);
        }
        let stored: Option<String> = store
            .get_setting(RegistryConfig::DOMAIN_SETTING_KEY)?
            .and_then(|v| v.as_str().map(str::to_string));
        Ok(stored
            .as_deref()
            .and_then(RegistryDomain::parse)
            .unwrap_or_default())
    }

    /// Build the ProvenanceEngine instance.
    ///
    /// Failing to open the store is the only fatal error.
    pub fn build(self) -> Result<ProvenanceEngine> {
        let store = Arc::new(self.open_store().map_err(|e| ProvenanceError::Config {
            message: format!("Failed to open identity store: {}", e),
        })?);
        let domain = self.resolve_domain(&store)?;

        let transport: Arc<dyn RegistryTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::with_options(
                domain.api_base(),
                self.api_key,
                self.request_timeout,
                self.requests_per_second,
            )?),
        };
        let provider = self.provider.unwrap_or_else(|| {
            debug!("No model directories configured");
            Arc::new(FolderLayout::new())
        });

        let client = Arc::new(
            RegistryClient::new(transport, store.clone())
                .with_retry(self.retry)
                .with_page_delay(self.page_delay),
        );
        let resolver = Arc::new(
            IdentityResolver::new(store.clone(), client.clone())
                .with_negative_ttl(self.negative_ttl)
                .with_lookup_timeout(self.lookup_timeout),
        );

        let mut scanner = InventoryScanner::new(store.clone(), provider)
            .with_hash_timeout(self.hash_timeout)
            .with_refresh_interval(self.refresh_interval);
        if let Some(workers) = self.hash_workers {
            scanner = scanner.with_workers(workers);
        }

        let analyzer = Analyzer::new(resolver.clone())
            .with_prewarm_concurrency(self.prewarm_concurrency)
            .with_lookup_timeout(self.lookup_timeout);

        info!("Provenance engine ready (registry: {})", domain.host());

        Ok(ProvenanceEngine {
            data_dir: (!self.in_memory).then_some(self.data_dir),
            store,
            scanner,
            client,
            resolver,
            analyzer,
            domain,
            backfill_concurrency: self.backfill_concurrency,
            prewarm_concurrency: self.prewarm_concurrency,
            lookup_timeout: self.lookup_timeout,
        })
    }
}
