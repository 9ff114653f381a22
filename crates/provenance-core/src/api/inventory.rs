//! Local inventory methods.

use crate::error::{ProvenanceError, Result};
use crate::inventory::{self, LocalHashIndex, MigrationReport, ModelCategory, SyncReport};
use crate::models::LocalModelEntry;
use crate::ProvenanceEngine;
use std::path::Path;

impl ProvenanceEngine {
    /// Hash new and modified files of a category.
    pub async fn sync(&self, category: ModelCategory, force: bool) -> Result<SyncReport> {
        self.scanner.sync(category, force).await
    }

    /// Sync every configured category, skipping the ones that fail.
    pub async fn sync_all(&self, force: bool) -> Vec<SyncReport> {
        self.scanner.sync_all(force).await
    }

    /// Hash every file of a category again, ignoring stored mtimes.
    pub async fn rehash_all(&self, category: ModelCategory) -> Result<SyncReport> {
        self.scanner.rehash_all(category).await
    }

    pub fn local_hash_index(&self, categories: &[ModelCategory]) -> Result<LocalHashIndex> {
        self.scanner.local_hash_index(categories)
    }

    /// Listed files of a category with their registry names, when known.
    pub fn local_models(&self, category: ModelCategory) -> Result<Vec<LocalModelEntry>> {
        self.scanner.local_models(category)
    }

    /// Import the JSON hash caches of older releases from the data directory.
    pub fn migrate_legacy_caches(&self) -> Result<MigrationReport> {
        let data_dir = self.data_dir.as_deref().ok_or_else(|| ProvenanceError::Config {
            message: "In-memory engine has no data directory".to_string(),
        })?;
        self.migrate_legacy_caches_from(data_dir)
    }

    /// Import legacy caches found in `dir`.
    pub fn migrate_legacy_caches_from(&self, dir: &Path) -> Result<MigrationReport> {
        inventory::migrate_legacy_caches(dir, &self.store, self.scanner.provider().as_ref())
    }

    pub fn has_legacy_caches(&self) -> bool {
        self.data_dir
            .as_deref()
            .map(|dir| !inventory::legacy::legacy_cache_files(dir).is_empty())
            .unwrap_or(false)
    }
}
