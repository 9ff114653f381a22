//! Provenance Core - local/remote model identity resolution and recipe extraction.
//!
//! This crate keeps a content-hash inventory of local model files, resolves
//! each hash to its identity on a remote model registry (with positive and
//! negative caching in an embedded SQLite store), and extracts "recipes"
//! (base model plus auxiliary resources and their weights) from the
//! generation metadata attached to sample outputs.
//!
//! # Example
//!
//! ```rust,ignore
//! use provenance_core::{FolderLayout, IdentityKey, ModelCategory, ProvenanceEngine};
//!
//! #[tokio::main]
//! async fn main() -> provenance_core::Result<()> {
//!     let engine = ProvenanceEngine::builder("./data")
//!         .with_provider(FolderLayout::from_models_root("./models"))
//!         .build()?;
//!
//!     let report = engine.sync(ModelCategory::Loras, false).await?;
//!     println!("{} new files hashed", report.new_count);
//!
//!     let identity = engine.resolve_identity(&IdentityKey::path("./models/loras/a.safetensors")).await?;
//!     println!("{:?}", identity.map(|v| v.version_id));
//!
//!     engine.close()
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod inventory;
pub mod models;
pub mod network;
pub mod recipe;
pub mod resolution;
pub mod store;

mod api;

pub use analysis::{AnalysisQuery, AnalysisReport, Analyzer, DominantParameters, ResourceUsage};
pub use config::RegistryDomain;
pub use error::{ProvenanceError, Result};
pub use inventory::{
    FolderLayout, InventoryScanner, LocalHashIndex, MigrationReport, ModelCategory,
    ModelDirectories, SyncReport,
};
pub use models::{
    ImageQuery, ImageSort, LocalModelEntry, MediaFilter, NsfwLevel, VersionRecord,
};
pub use network::{HttpTransport, RegistryClient, RegistryResponse, RegistryTransport, RetryConfig};
pub use recipe::{Recipe, RecipeResource, ResourceKind};
pub use resolution::{
    BatchSummary, IdentityKey, IdentityResolver, ResolutionSession, TriggerWords,
};
pub use store::{CacheKind, IdentityStore, StoreStats};

pub use api::ProvenanceEngineBuilder;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Entry point owning the store and every component built on it.
///
/// Components share one [`IdentityStore`]; nothing else holds global state.
/// Dropping the engine closes the store with it, [`close`](Self::close) does
/// so explicitly and reports errors.
pub struct ProvenanceEngine {
    /// Directory holding the database and legacy caches, if on disk.
    data_dir: Option<PathBuf>,
    store: Arc<IdentityStore>,
    scanner: InventoryScanner,
    client: Arc<RegistryClient>,
    resolver: Arc<IdentityResolver>,
    analyzer: Analyzer,
    domain: RegistryDomain,
    backfill_concurrency: usize,
    prewarm_concurrency: usize,
    lookup_timeout: Duration,
}

impl ProvenanceEngine {
    /// Create a builder for an engine whose data lives in `data_dir`.
    pub fn builder(data_dir: impl Into<PathBuf>) -> ProvenanceEngineBuilder {
        ProvenanceEngineBuilder::new(data_dir)
    }

    /// Open an engine with default settings and no model directories.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self> {
        Self::builder(data_dir).build()
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub fn resolver(&self) -> &Arc<IdentityResolver> {
        &self.resolver
    }

    pub fn scanner(&self) -> &InventoryScanner {
        &self.scanner
    }

    pub fn data_dir(&self) -> Option<&std::path::Path> {
        self.data_dir.as_deref()
    }

    /// Registry mirror this engine talks to.
    pub fn domain(&self) -> RegistryDomain {
        self.domain
    }

    /// Close the store connection.
    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}
