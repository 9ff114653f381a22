//! Identity resolution: store first, registry on miss.

use super::VersionSource;
use crate::config::RegistryConfig;
use crate::error::{ProvenanceError, Result};
use crate::inventory::hashing::{compute_sha256_blocking, normalize_hash};
use crate::inventory::provider::normalize_path;
use crate::models::VersionRecord;
use crate::network::RegistryClient;
use crate::store::{IdentityStore, VersionLookup};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityKey {
    Hash(String),
    /// A local file; its hash comes from the inventory or is computed.
    Path(PathBuf),
}

impl IdentityKey {
    pub fn hash(hash: impl Into<String>) -> Self {
        IdentityKey::Hash(hash.into())
    }

    pub fn path(path: impl Into<PathBuf>) -> Self {
        IdentityKey::Path(path.into())
    }
}

/// Outcome of a batch of remote lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub resolved: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Trigger words of one model from both of their sources.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerWords {
    /// Training tags from the file's own header, most frequent first.
    pub from_metadata: Vec<String>,
    /// Trained words the registry lists for the version.
    pub from_registry: Vec<String>,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.resolved + self.not_found + self.failed
    }
}

/// Resolves local content to registry identities.
pub struct IdentityResolver {
    store: Arc<IdentityStore>,
    client: Arc<RegistryClient>,
    negative_ttl: Duration,
    lookup_timeout: Duration,
}

impl IdentityResolver {
    pub fn new(store: Arc<IdentityStore>, client: Arc<RegistryClient>) -> Self {
        Self {
            store,
            client,
            negative_ttl: RegistryConfig::NEGATIVE_CACHE_TTL,
            lookup_timeout: RegistryConfig::LOOKUP_TIMEOUT,
        }
    }

    pub fn with_negative_ttl(mut self, ttl: Duration) -> Self {
        self.negative_ttl = ttl;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Arc<RegistryClient> {
        &self.client
    }

    /// Whether a not-found marker still suppresses remote lookups.
    pub fn is_negative_fresh(&self, record: &VersionRecord) -> bool {
        if !record.is_negative() {
            return false;
        }
        match record.last_checked_at {
            Some(checked_at) => {
                let age = Utc::now().signed_duration_since(checked_at);
                age.to_std().map(|age| age < self.negative_ttl).unwrap_or(true)
            }
            None => false,
        }
    }

    /// Registry identity for a hash or a local path.
    pub async fn resolve(&self, key: &IdentityKey) -> Result<Option<VersionRecord>> {
        self.resolve_with(key, false).await
    }

    /// Like [`resolve`](Self::resolve); `force_refresh` skips the store.
    ///
    /// Registry failures degrade to `None`. Store failures and an unreadable
    /// path are errors.
    pub async fn resolve_with(
        &self,
        key: &IdentityKey,
        force_refresh: bool,
    ) -> Result<Option<VersionRecord>> {
        let hash = self.hash_for_key(key).await?;

        if !force_refresh {
            if let Some(record) = self.store.get_version(VersionLookup::Hash(&hash))? {
                if record.is_positive() {
                    debug!("Resolved {} from the store", hash);
                    return Ok(Some(record));
                }
                if self.is_negative_fresh(&record) {
                    debug!("{} is a recent not-found, skipping remote lookup", hash);
                    return Ok(None);
                }
            }
        }

        match self.client.lookup_by_hash(&hash).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("Remote lookup for {} failed: {}", hash, e);
                Ok(None)
            }
        }
    }

    /// Registry version by id, from the store when known.
    pub async fn resolve_version_id(&self, version_id: i64) -> Result<Option<VersionRecord>> {
        if let Some(record) = self.store.get_version(VersionLookup::Id(version_id))? {
            if record.is_positive() {
                return Ok(Some(record));
            }
        }

        match self.client.lookup_by_id(version_id).await {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!("Remote lookup for version {} failed: {}", version_id, e);
                Ok(None)
            }
        }
    }

    /// Trigger words of the version behind a hash.
    ///
    /// Served from the store unless `force_refresh` is set or nothing is
    /// cached yet.
    pub async fn trained_words(&self, hash: &str, force_refresh: bool) -> Result<Vec<String>> {
        let hash = normalize_hash(hash);

        if !force_refresh {
            if let Some(record) = self.store.get_version(VersionLookup::Hash(&hash))? {
                if !record.trained_words.is_empty() || self.is_negative_fresh(&record) {
                    return Ok(record.trained_words);
                }
            }
        }

        let record = self
            .resolve_with(&IdentityKey::Hash(hash), true)
            .await?;
        Ok(record.map(|r| r.trained_words).unwrap_or_default())
    }

    /// Look up every local hash that was never checked against the registry.
    pub async fn fetch_missing(&self, concurrency: usize) -> Result<BatchSummary> {
        let hashes = self.store.unchecked_local_hashes()?;
        if hashes.is_empty() {
            info!("All local models already have registry information");
            return Ok(BatchSummary::default());
        }
        info!("Fetching registry information for {} local models", hashes.len());

        let timeout = self.lookup_timeout;
        let outcomes: Vec<std::result::Result<Option<VersionRecord>, String>> =
            stream::iter(hashes)
                .map(|hash| async move {
                    match tokio::time::timeout(timeout, self.client.lookup_by_hash(&hash)).await {
                        Ok(Ok(record)) => Ok(record),
                        Ok(Err(e)) => {
                            warn!("Lookup for {} failed: {}", hash, e);
                            Err(e.to_string())
                        }
                        Err(_) => {
                            warn!("Lookup for {} timed out after {:?}", hash, timeout);
                            Err("timeout".to_string())
                        }
                    }
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;

        let mut summary = BatchSummary::default();
        for outcome in outcomes {
            match outcome {
                Ok(Some(_)) => summary.resolved += 1,
                Ok(None) => summary.not_found += 1,
                Err(_) => summary.failed += 1,
            }
        }

        info!(
            "Registry backfill finished: {} resolved, {} not found, {} failed",
            summary.resolved, summary.not_found, summary.failed
        );
        Ok(summary)
    }

    /// Content hash behind a key; an uninventoried path is hashed.
    pub async fn hash_for_key(&self, key: &IdentityKey) -> Result<String> {
        match key {
            IdentityKey::Hash(hash) => Ok(normalize_hash(hash)),
            IdentityKey::Path(path) => {
                let path = normalize_path(path);
                if let Some(record) = self.store.local_file_by_path(&path)? {
                    return Ok(record.content_hash);
                }
                if !path.is_file() {
                    return Err(ProvenanceError::FileNotFound(path));
                }
                debug!("{} is not in the inventory, hashing it", path.display());
                compute_sha256_blocking(path).await
            }
        }
    }
}

#[async_trait]
impl VersionSource for IdentityResolver {
    async fn version_by_id(&self, version_id: i64) -> Result<Option<VersionRecord>> {
        self.resolve_version_id(version_id).await
    }
}
