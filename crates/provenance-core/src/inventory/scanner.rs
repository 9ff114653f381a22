//! Incremental content-hash inventory of local model files.
//!
//! A sync lists what the host knows for a category, compares each file's
//! mtime with the stored one and hashes only new or modified files. Hashes
//! run on the blocking pool with a bounded number in flight, and each result
//! is written as its own transaction, in path order.
//!
//! A hash has one owning path. Other files with the same content are kept
//! as duplicate paths, so they are not hashed again while unchanged and take
//! over the hash when the owner disappears.

use super::category::ModelCategory;
use super::hashing::compute_sha256_blocking;
use super::index::LocalHashIndex;
use super::provider::{normalize_path, ModelDirectories};
use crate::config::ScanConfig;
use crate::error::{ProvenanceError, Result};
use crate::models::{LocalFileRecord, LocalModelEntry};
use crate::store::{IdentityStore, VersionLookup};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Counts from one sync of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub category: ModelCategory,
    /// Files hashed for the first time.
    pub new_count: usize,
    /// Known files hashed again because their mtime changed.
    pub rehashed_count: usize,
    pub unchanged: usize,
    /// Known paths no longer listed by the host.
    pub removed: usize,
    /// Files whose stat or hash failed or timed out.
    pub failed: usize,
    /// Files hashed in this sync whose content another live file owns.
    pub duplicates: usize,
    /// The sync was a no-op because the last one is recent.
    pub skipped_recently: bool,
}

impl SyncReport {
    fn empty(category: ModelCategory) -> Self {
        Self {
            category,
            new_count: 0,
            rehashed_count: 0,
            unchanged: 0,
            removed: 0,
            failed: 0,
            duplicates: 0,
            skipped_recently: false,
        }
    }

    pub fn hashed(&self) -> usize {
        self.new_count + self.rehashed_count
    }
}

struct HashJob {
    path: PathBuf,
    mtime_ns: i64,
    known: bool,
}

/// Keeps the `local_files` table in step with the host's directories.
pub struct InventoryScanner {
    store: Arc<IdentityStore>,
    provider: Arc<dyn ModelDirectories>,
    workers: usize,
    hash_timeout: Duration,
    refresh_interval: Duration,
}

impl InventoryScanner {
    pub fn new(store: Arc<IdentityStore>, provider: Arc<dyn ModelDirectories>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            store,
            provider,
            workers,
            hash_timeout: ScanConfig::HASH_TIMEOUT,
            refresh_interval: ScanConfig::REFRESH_INTERVAL,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_hash_timeout(mut self, timeout: Duration) -> Self {
        self.hash_timeout = timeout;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn provider(&self) -> &Arc<dyn ModelDirectories> {
        &self.provider
    }

    /// Bring one category up to date.
    ///
    /// Unforced calls within the refresh interval of the previous sync do
    /// nothing. Per-file failures are counted, not returned.
    pub async fn sync(&self, category: ModelCategory, force: bool) -> Result<SyncReport> {
        let mut report = SyncReport::empty(category);
        let sync_key = category.last_sync_key();

        if !force {
            let last_sync: i64 = self.store.get_setting_or(&sync_key, 0)?;
            let elapsed = Utc::now().timestamp().saturating_sub(last_sync);
            if elapsed >= 0 && (elapsed as u64) < self.refresh_interval.as_secs() {
                debug!("Skipping {} sync, last one was {}s ago", category, elapsed);
                report.skipped_recently = true;
                return Ok(report);
            }
        }

        info!("Syncing local {}", category);

        let known: HashMap<PathBuf, LocalFileRecord> = self
            .store
            .local_files_for_category(category)?
            .into_iter()
            .filter_map(|record| record.path.clone().map(|path| (path, record)))
            .collect();

        let known_duplicates: HashMap<PathBuf, LocalFileRecord> = self
            .store
            .duplicate_paths_for_category(category)?
            .into_iter()
            .filter_map(|record| record.path.clone().map(|path| (path, record)))
            .collect();

        let mut listed = HashSet::new();
        let mut jobs = Vec::new();
        let mut idle_duplicates = Vec::new();

        for relative in self.provider.list_files(category) {
            let Some(full_path) = self.provider.full_path(category, &relative) else {
                debug!("No file behind listed {} entry {}", category, relative);
                continue;
            };
            let path = normalize_path(&full_path);

            let mtime_ns = match file_mtime_ns(&path) {
                Ok(mtime) => mtime,
                Err(e) => {
                    warn!("Could not stat {}: {}", path.display(), e);
                    report.failed += 1;
                    continue;
                }
            };
            listed.insert(path.clone());

            match (known.get(&path), known_duplicates.get(&path)) {
                (Some(record), _) if record.mtime_ns == Some(mtime_ns) => report.unchanged += 1,
                (None, Some(duplicate)) if duplicate.mtime_ns == Some(mtime_ns) => {
                    report.unchanged += 1;
                    idle_duplicates.push(duplicate.clone());
                }
                (record, duplicate) => jobs.push(HashJob {
                    path,
                    mtime_ns,
                    known: record.is_some() || duplicate.is_some(),
                }),
            }
        }
        jobs.sort_by(|a, b| a.path.cmp(&b.path));

        if !jobs.is_empty() {
            info!("Hashing {} new or modified {} files", jobs.len(), category);
        }

        let timeout = self.hash_timeout;
        let mut results = stream::iter(jobs)
            .map(|job| async move {
                let outcome =
                    match tokio::time::timeout(timeout, compute_sha256_blocking(job.path.clone()))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ProvenanceError::Timeout(timeout)),
                    };
                (job, outcome)
            })
            .buffered(self.workers);

        while let Some((job, outcome)) = results.next().await {
            let hash = match outcome {
                Ok(hash) => hash,
                Err(e) => {
                    warn!("Failed to hash {}: {}", job.path.display(), e);
                    report.failed += 1;
                    continue;
                }
            };

            if self.owned_elsewhere(&hash, &job.path, category, &listed)? {
                debug!(
                    "{} has the same content as another local file",
                    job.path.display()
                );
                report.duplicates += 1;
                if let Err(e) =
                    self.store
                        .record_duplicate_path(&hash, &job.path, job.mtime_ns, category)
                {
                    warn!("Failed to record duplicate {}: {}", job.path.display(), e);
                    report.failed += 1;
                }
                continue;
            }

            match self
                .store
                .record_local_file(&hash, &job.path, job.mtime_ns, category)
            {
                Ok(()) => {
                    if job.known {
                        report.rehashed_count += 1;
                    } else {
                        report.new_count += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to record {}: {}", job.path.display(), e);
                    report.failed += 1;
                }
            }
        }

        for path in known.keys().filter(|path| !listed.contains(*path)) {
            match self.store.clear_local_path(path) {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to clear {}: {}", path.display(), e),
            }
        }
        for path in known_duplicates.keys().filter(|path| !listed.contains(*path)) {
            match self.store.clear_duplicate_path(path) {
                Ok(true) => report.removed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to clear duplicate {}: {}", path.display(), e),
            }
        }

        idle_duplicates.sort_by(|a, b| a.path.cmp(&b.path));
        for duplicate in idle_duplicates {
            self.promote_orphan(duplicate, category, &listed)?;
        }

        self.store
            .set_setting(&sync_key, &Utc::now().timestamp())?;

        info!(
            "Synced {}: {} new, {} re-hashed, {} unchanged, {} removed, {} failed",
            category,
            report.new_count,
            report.rehashed_count,
            report.unchanged,
            report.removed,
            report.failed
        );
        Ok(report)
    }

    /// Whether `hash` belongs to a different file that still exists.
    ///
    /// An owner in the category being synced must also still be listed; an
    /// owner in another category only has to be on disk.
    fn owned_elsewhere(
        &self,
        hash: &str,
        path: &Path,
        category: ModelCategory,
        listed: &HashSet<PathBuf>,
    ) -> Result<bool> {
        let Some(existing) = self.store.local_file_by_hash(hash)? else {
            return Ok(false);
        };
        let Some(owner) = existing.path else {
            return Ok(false);
        };
        if owner == path {
            return Ok(false);
        }
        let still_listed = existing.category != category || listed.contains(&owner);
        Ok(still_listed && owner.is_file())
    }

    /// Hand a hash to an unchanged duplicate whose owner is gone.
    fn promote_orphan(
        &self,
        duplicate: LocalFileRecord,
        category: ModelCategory,
        listed: &HashSet<PathBuf>,
    ) -> Result<()> {
        let (Some(path), Some(mtime_ns)) = (duplicate.path.as_deref(), duplicate.mtime_ns) else {
            return Ok(());
        };
        if self.owned_elsewhere(&duplicate.content_hash, path, category, listed)? {
            return Ok(());
        }
        info!(
            "{} takes over {} from a removed file",
            path.display(),
            duplicate.content_hash
        );
        self.store
            .record_local_file(&duplicate.content_hash, path, mtime_ns, category)
    }

    /// Stored hash of every owning and duplicate path of a category.
    fn hashes_by_path(&self, category: ModelCategory) -> Result<HashMap<PathBuf, String>> {
        let owners = self.store.local_files_for_category(category)?;
        let duplicates = self.store.duplicate_paths_for_category(category)?;
        Ok(owners
            .into_iter()
            .chain(duplicates)
            .filter_map(|record| record.path.map(|path| (path, record.content_hash)))
            .collect())
    }

    /// Sync every category the host has configured. Failures are logged and skipped.
    pub async fn sync_all(&self, force: bool) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        for category in ModelCategory::ALL {
            if !self.provider.is_configured(category) {
                debug!("Skipping {}, no directory configured", category);
                continue;
            }
            match self.sync(category, force).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!("Skipping {} after sync error: {}", category, e),
            }
        }
        reports
    }

    /// Hash every file of a category again.
    pub async fn rehash_all(&self, category: ModelCategory) -> Result<SyncReport> {
        let reset = self.store.reset_local_mtimes(category)?;
        info!("Re-hashing {} known {} files", reset, category);
        self.sync(category, true).await
    }

    /// Filename/hash index over the given categories, from stored hashes only.
    pub fn local_hash_index(&self, categories: &[ModelCategory]) -> Result<LocalHashIndex> {
        let mut index = LocalHashIndex::new();
        for &category in categories {
            let by_path = self.hashes_by_path(category)?;

            for relative in self.provider.list_files(category) {
                let hash = self
                    .provider
                    .full_path(category, &relative)
                    .and_then(|full| by_path.get(&normalize_path(&full)));
                if let Some(hash) = hash {
                    index.insert_alias(relative, hash);
                }
            }
        }
        Ok(index)
    }

    /// Listed files of a category joined with their registry names.
    pub fn local_models(&self, category: ModelCategory) -> Result<Vec<LocalModelEntry>> {
        let by_path = self.hashes_by_path(category)?;

        let mut entries = Vec::new();
        for relative in self.provider.list_files(category) {
            let content_hash = self
                .provider
                .full_path(category, &relative)
                .and_then(|full| by_path.get(&normalize_path(&full)).cloned());

            let version = match &content_hash {
                Some(hash) => self.store.get_version(VersionLookup::Hash(hash))?,
                None => None,
            };
            let positive = version.filter(|v| v.is_positive());

            entries.push(LocalModelEntry {
                relative_path: relative,
                category,
                content_hash,
                model_id: positive.as_ref().and_then(|v| v.model_id),
                model_name: positive
                    .as_ref()
                    .and_then(|v| v.model_name().map(str::to_string)),
                version_name: positive.and_then(|v| v.name),
            });
        }
        Ok(entries)
    }
}

/// Modification time of a file in nanoseconds since the Unix epoch.
pub fn file_mtime_ns(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| ProvenanceError::io_with_path(e, path))?;
    let since_epoch = modified
        .duration_since(UNIX_EPOCH)
        .map_err(|e| ProvenanceError::Other(format!("mtime before epoch: {}", e)))?;
    Ok(since_epoch.as_nanos() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::FolderLayout;
    use tempfile::TempDir;

    fn scanner(root: &Path) -> (InventoryScanner, Arc<IdentityStore>) {
        let store = Arc::new(IdentityStore::open_in_memory().unwrap());
        let layout = FolderLayout::from_models_root(root);
        let scanner = InventoryScanner::new(store.clone(), Arc::new(layout)).with_workers(2);
        (scanner, store)
    }

    fn write(root: &Path, relative: &str, content: &[u8]) -> PathBuf {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_first_sync_hashes_everything() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "loras/a.safetensors", b"aaa");
        write(temp.path(), "loras/sub/b.pt", b"bbb");
        let (scanner, store) = scanner(temp.path());

        let report = scanner.sync(ModelCategory::Loras, false).await.unwrap();
        assert_eq!(report.new_count, 2);
        assert_eq!(report.rehashed_count, 0);
        assert_eq!(store.local_files_for_category(ModelCategory::Loras).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unforced_sync_within_interval_is_noop() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "loras/a.safetensors", b"aaa");
        let (scanner, _store) = scanner(temp.path());

        scanner.sync(ModelCategory::Loras, false).await.unwrap();
        write(temp.path(), "loras/c.safetensors", b"ccc");

        let report = scanner.sync(ModelCategory::Loras, false).await.unwrap();
        assert!(report.skipped_recently);
        assert_eq!(report.hashed(), 0);

        let report = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!(report.new_count, 1);
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn test_modified_file_is_rehashed() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "checkpoints/m.ckpt", b"one");
        let (scanner, store) = scanner(temp.path());
        scanner.sync(ModelCategory::Checkpoints, true).await.unwrap();

        std::fs::write(&path, b"two").unwrap();
        let later = std::time::SystemTime::now() + Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(later)
            .unwrap();

        let report = scanner.sync(ModelCategory::Checkpoints, true).await.unwrap();
        assert_eq!(report.rehashed_count, 1);

        let record = store
            .local_file_by_path(&normalize_path(&path))
            .unwrap()
            .unwrap();
        assert_eq!(
            record.content_hash,
            super::super::hashing::compute_sha256(&path).unwrap()
        );
    }

    #[tokio::test]
    async fn test_deleted_file_path_is_cleared() {
        let temp = TempDir::new().unwrap();
        let path = write(temp.path(), "vae/v.safetensors", b"vae");
        let (scanner, store) = scanner(temp.path());
        scanner.sync(ModelCategory::Vae, true).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        let report = scanner.sync(ModelCategory::Vae, true).await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(store.local_files_for_category(ModelCategory::Vae).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_content_keeps_first_owner() {
        let temp = TempDir::new().unwrap();
        let b = write(temp.path(), "loras/b.safetensors", b"same");
        let a = write(temp.path(), "loras/a.safetensors", b"same");
        let (scanner, store) = scanner(temp.path());

        let report = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!(report.new_count, 1);
        assert_eq!(report.duplicates, 1);

        let owners = store.local_files_for_category(ModelCategory::Loras).unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].path, Some(normalize_path(&a)));

        let duplicates = store
            .duplicate_paths_for_category(ModelCategory::Loras)
            .unwrap();
        assert_eq!(duplicates.len(), 1);
        assert_eq!(duplicates[0].path, Some(normalize_path(&b)));
    }

    #[tokio::test]
    async fn test_unchanged_duplicate_is_not_hashed_again() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "loras/a.safetensors", b"same");
        write(temp.path(), "loras/b.safetensors", b"same");
        let (scanner, _store) = scanner(temp.path());

        let first = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!((first.hashed(), first.duplicates), (1, 1));

        let second = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!(second.hashed(), 0);
        assert_eq!(second.duplicates, 0);
        assert_eq!(second.unchanged, 2);

        let index = scanner.local_hash_index(&[ModelCategory::Loras]).unwrap();
        assert_eq!(index.hash_for_name("a"), index.hash_for_name("b"));
        assert!(index.hash_for_name("b").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_takes_over_removed_owner() {
        let temp = TempDir::new().unwrap();
        let a = write(temp.path(), "loras/a.safetensors", b"same");
        let b = write(temp.path(), "loras/b.safetensors", b"same");
        let (scanner, store) = scanner(temp.path());
        scanner.sync(ModelCategory::Loras, true).await.unwrap();

        std::fs::remove_file(&a).unwrap();
        let report = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.hashed(), 0);

        let owner = store
            .local_file_by_path(&normalize_path(&b))
            .unwrap()
            .unwrap();
        assert_eq!(owner.category, ModelCategory::Loras);
        assert!(store
            .duplicate_paths_for_category(ModelCategory::Loras)
            .unwrap()
            .is_empty());

        let again = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!((again.hashed(), again.unchanged), (0, 1));
    }

    #[tokio::test]
    async fn test_same_content_across_categories() {
        let temp = TempDir::new().unwrap();
        let lora = write(temp.path(), "loras/x.safetensors", b"shared");
        let checkpoint = write(temp.path(), "checkpoints/y.safetensors", b"shared");
        let (scanner, store) = scanner(temp.path());

        scanner.sync(ModelCategory::Loras, true).await.unwrap();
        let report = scanner.sync(ModelCategory::Checkpoints, true).await.unwrap();
        assert_eq!(report.duplicates, 1);

        let loras = store.local_files_for_category(ModelCategory::Loras).unwrap();
        assert_eq!(loras.len(), 1);
        assert_eq!(loras[0].path, Some(normalize_path(&lora)));

        let loras_again = scanner.sync(ModelCategory::Loras, true).await.unwrap();
        assert_eq!((loras_again.hashed(), loras_again.unchanged), (0, 1));
        let checkpoints_again = scanner.sync(ModelCategory::Checkpoints, true).await.unwrap();
        assert_eq!(
            (checkpoints_again.hashed(), checkpoints_again.unchanged),
            (0, 1)
        );

        let models = scanner.local_models(ModelCategory::Checkpoints).unwrap();
        assert_eq!(models[0].content_hash, Some(loras[0].content_hash.clone()));

        // Removing the owner in the other category hands the hash over.
        std::fs::remove_file(&lora).unwrap();
        scanner.sync(ModelCategory::Checkpoints, true).await.unwrap();
        let owner = store
            .local_file_by_hash(&loras[0].content_hash)
            .unwrap()
            .unwrap();
        assert_eq!(owner.path, Some(normalize_path(&checkpoint)));
        assert_eq!(owner.category, ModelCategory::Checkpoints);
    }

    #[tokio::test]
    async fn test_rehash_all_and_index() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "loras/styleA.safetensors", b"style");
        let (scanner, _store) = scanner(temp.path());
        scanner.sync(ModelCategory::Loras, true).await.unwrap();

        let report = scanner.rehash_all(ModelCategory::Loras).await.unwrap();
        assert_eq!(report.rehashed_count, 1);

        let index = scanner.local_hash_index(&[ModelCategory::Loras]).unwrap();
        let hash = index.hash_for_name("styleA").unwrap().to_string();
        assert_eq!(index.filename_for_hash(&hash), Some("styleA.safetensors"));

        let models = scanner.local_models(ModelCategory::Loras).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(models[0].content_hash.as_deref(), Some(hash.as_str()));
        assert!(models[0].model_name.is_none());
    }
}
