//! Centralized configuration for the provenance engine.
//!
//! Constant groups for scanning, network operations, the registry API and
//! on-disk paths. Runtime overrides go through [`crate::ProvenanceEngineBuilder`].

use crate::error::ProvenanceError;
use std::time::Duration;

/// Local inventory scanning.
pub struct ScanConfig;

impl ScanConfig {
    /// Unforced syncs within this interval of the last full sync are no-ops.
    pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);
    /// Read block size for content hashing (8MB).
    pub const HASH_CHUNK_SIZE: usize = 8 * 1024 * 1024;
    /// Upper bound for hashing a single file before it is abandoned.
    pub const HASH_TIMEOUT: Duration = Duration::from_secs(30 * 60);
    /// File extensions recognized as model artifacts.
    pub const MODEL_EXTENSIONS: &'static [&'static str] =
        &["safetensors", "ckpt", "pt", "pth", "bin", "gguf", "sft"];
    /// Larger safetensors headers are treated as corrupt.
    pub const MAX_SAFETENSORS_HEADER: u64 = 100_000_000;
    /// Settings key prefix for the per-category last sync timestamp.
    pub const LAST_SYNC_KEY_PREFIX: &'static str = "last_sync_";
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
    /// Attempts per call, including the first one.
    pub const MAX_ATTEMPTS: u32 = 4;
    /// First delay after a 429 or transient failure; doubles on each retry.
    pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
    /// Client-side pacing of registry requests.
    pub const REQUESTS_PER_SECOND: u32 = 5;
    pub const THROTTLE_DELAY: Duration = Duration::from_millis(500);
    pub const USER_AGENT: &'static str = "provenance/0.3";
}

/// Registry API configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const API_PATH: &'static str = "/api/v1";
    /// Images requested per page when paging sample outputs.
    pub const IMAGES_PAGE_LIMIT: u32 = 100;
    pub const IMAGES_PAGE_DELAY: Duration = Duration::from_millis(100);
    /// Hard stop for paging when pages keep coming without usable items.
    pub const IMAGES_MAX_PAGES: u32 = 100;
    /// How long a not-found marker suppresses repeated lookups.
    pub const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(24 * 3600);
    /// Concurrent lookups when pre-warming a resolution session.
    pub const PREWARM_CONCURRENCY: usize = 10;
    /// Concurrent lookups when backfilling never-checked hashes.
    pub const BACKFILL_CONCURRENCY: usize = 5;
    /// Upper bound for one lookup inside a batch, retries included.
    pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(120);
    /// Settings key holding the selected [`RegistryDomain`].
    pub const DOMAIN_SETTING_KEY: &'static str = "network_choice";
}

/// Shared directory and file names.
pub struct PathsConfig;

impl PathsConfig {
    pub const DATA_DIR_NAME: &'static str = "data";
    pub const DATABASE_FILENAME: &'static str = "provenance.db";
    pub const LEGACY_CHECKPOINT_CACHE: &'static str = "hash_cache.json";
    pub const LEGACY_LORA_CACHE: &'static str = "loras_hash_cache.json";
    pub const MIGRATED_SUFFIX: &'static str = ".migrated";
}

/// Registry mirror domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RegistryDomain {
    #[default]
    Com,
    Work,
}

impl RegistryDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistryDomain::Com => "com",
            RegistryDomain::Work => "work",
        }
    }

    pub fn host(&self) -> &'static str {
        match self {
            RegistryDomain::Com => "civitai.com",
            RegistryDomain::Work => "civitai.work",
        }
    }

    /// Base URL of the versioned API.
    pub fn api_base(&self) -> String {
        format!("https://{}{}", self.host(), RegistryConfig::API_PATH)
    }

    /// Public page of a model family.
    pub fn model_url(&self, model_id: i64) -> String {
        format!("https://{}/models/{}", self.host(), model_id)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "com" | "civitai.com" => Some(RegistryDomain::Com),
            "work" | "civitai.work" => Some(RegistryDomain::Work),
            _ => None,
        }
    }
}

impl std::fmt::Display for RegistryDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RegistryDomain {
    type Err = ProvenanceError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| ProvenanceError::Config {
            message: format!("Unknown registry domain: {}", s),
        })
    }
}
