//! Identity resolution, recipe extraction and analysis methods.

use crate::analysis::{AnalysisQuery, AnalysisReport};
use crate::error::{ProvenanceError, Result};
use crate::inventory::provider::normalize_path;
use crate::inventory::safetensors::file_trigger_words_blocking;
use crate::inventory::{LocalHashIndex, ModelCategory};
use crate::models::VersionRecord;
use crate::recipe::{self, Recipe};
use crate::resolution::{BatchSummary, IdentityKey, ResolutionSession, TriggerWords};
use crate::ProvenanceEngine;
use serde_json::Value;
use std::collections::BTreeSet;

impl ProvenanceEngine {
    /// Registry identity of a hash or local file, store first.
    ///
    /// `Ok(None)` covers both "not on the registry" and "registry
    /// unreachable"; neither blocks local work.
    pub async fn resolve_identity(&self, key: &IdentityKey) -> Result<Option<VersionRecord>> {
        self.resolver.resolve(key).await
    }

    /// Like [`resolve_identity`](Self::resolve_identity) but always asks the registry.
    pub async fn refresh_identity(&self, key: &IdentityKey) -> Result<Option<VersionRecord>> {
        self.resolver.resolve_with(key, true).await
    }

    pub async fn resolve_version_id(&self, version_id: i64) -> Result<Option<VersionRecord>> {
        self.resolver.resolve_version_id(version_id).await
    }

    /// Trigger words of the version behind a hash.
    pub async fn trained_words(&self, hash: &str, force_refresh: bool) -> Result<Vec<String>> {
        self.resolver.trained_words(hash, force_refresh).await
    }

    /// Training tags embedded in a local file's safetensors header.
    ///
    /// A hash key reads the inventoried file holding that content.
    pub async fn local_trigger_words(&self, key: &IdentityKey) -> Result<Vec<String>> {
        let path = match key {
            IdentityKey::Path(path) => normalize_path(path),
            IdentityKey::Hash(hash) => self
                .store
                .local_file_by_hash(hash)?
                .and_then(|record| record.path)
                .ok_or_else(|| ProvenanceError::IdentityNotFound(hash.clone()))?,
        };
        if !path.is_file() {
            return Err(ProvenanceError::FileNotFound(path));
        }
        file_trigger_words_blocking(path).await
    }

    /// Trigger words from the file's own metadata and from the registry.
    ///
    /// The file half is empty when no local file holds the content.
    pub async fn trigger_words(
        &self,
        key: &IdentityKey,
        force_refresh: bool,
    ) -> Result<TriggerWords> {
        let from_metadata = match self.local_trigger_words(key).await {
            Ok(words) => words,
            Err(ProvenanceError::IdentityNotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        let hash = self.resolver.hash_for_key(key).await?;
        let from_registry = self.resolver.trained_words(&hash, force_refresh).await?;
        Ok(TriggerWords {
            from_metadata,
            from_registry,
        })
    }

    /// Full model payload from the registry; also refreshes the stored model row.
    pub async fn fetch_model(&self, model_id: i64) -> Result<Option<Value>> {
        self.client.fetch_model(model_id).await
    }

    /// Look up every local hash that was never checked against the registry.
    pub async fn fetch_missing_remote_info(&self) -> Result<BatchSummary> {
        self.resolver.fetch_missing(self.backfill_concurrency).await
    }

    /// Filename/hash index over every category, for name-based references.
    pub fn recipe_index(&self) -> Result<LocalHashIndex> {
        self.scanner.local_hash_index(&ModelCategory::ALL)
    }

    /// Extract the recipe of one metadata record.
    ///
    /// Registry versions the record references are resolved first, so the
    /// result carries their names and hashes when the registry knows them.
    pub async fn extract_recipe(&self, metadata: &Value) -> Result<Recipe> {
        let mut recipes = self.extract_recipes(std::slice::from_ref(metadata)).await?;
        Ok(recipes.pop().unwrap_or_default())
    }

    /// Extract many records with one shared resolution session.
    pub async fn extract_recipes(&self, records: &[Value]) -> Result<Vec<Recipe>> {
        let index = self.recipe_index()?;
        let session = ResolutionSession::new();

        let version_ids: BTreeSet<i64> = records
            .iter()
            .flat_map(recipe::referenced_version_ids)
            .collect();
        session
            .prewarm(
                version_ids,
                self.resolver.as_ref(),
                self.prewarm_concurrency,
                self.lookup_timeout,
            )
            .await;

        Ok(records
            .iter()
            .map(|record| recipe::extract(record, &index, &session))
            .collect())
    }

    /// Analyze the published sample outputs of the version behind `subject_hash`.
    pub async fn analyze(
        &self,
        subject_hash: &str,
        query: &AnalysisQuery,
        force_refresh: bool,
    ) -> Result<AnalysisReport> {
        let index = self.recipe_index()?;
        self.analyzer
            .analyze(subject_hash, query, &index, force_refresh)
            .await
    }
}
