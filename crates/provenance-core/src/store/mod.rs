//! Persistent identity store.
//!
//! One SQLite database holds the settings table, registry models and
//! versions keyed by content hash, the local file inventory, fetched sample
//! images and memoized analyses. The store is opened explicitly, shared as
//! `Arc<IdentityStore>` and closed explicitly.

mod identity;
mod images;
mod local_files;

pub use identity::{IdentityStore, StoreStats, VersionLookup};

/// Which cached data [`IdentityStore::clear_cache`] drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// Memoized batch analyses.
    Analysis,
    /// Stored registry payloads and check times.
    ApiResponses,
    /// Cached trigger words.
    TrainedWords,
    All,
}

impl CacheKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "analysis" => Some(CacheKind::Analysis),
            "api" | "api_responses" | "api-responses" => Some(CacheKind::ApiResponses),
            "triggers" | "trained_words" | "trained-words" => Some(CacheKind::TrainedWords),
            "all" => Some(CacheKind::All),
            _ => None,
        }
    }
}
