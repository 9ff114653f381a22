//! One-shot import of the JSON hash caches written by older releases.
//!
//! Two formats exist. `hash_cache.json` maps `"<path>|<mtime>|<size>"` to a
//! hash and only ever held checkpoints. `loras_hash_cache.json` maps a path
//! relative to the lora folders to `{"hash": .., "mtime": ..}`. Each file is
//! renamed with a `.migrated` suffix once imported so it is never read again.

use super::category::ModelCategory;
use super::provider::{normalize_path, ModelDirectories};
use crate::config::PathsConfig;
use crate::error::{ProvenanceError, Result};
use crate::store::IdentityStore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Outcome of a legacy cache migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub migrated: usize,
    pub skipped: usize,
    /// Legacy files that were found and renamed.
    pub files: Vec<PathBuf>,
}

impl MigrationReport {
    pub fn found_any(&self) -> bool {
        !self.files.is_empty()
    }
}

#[derive(Deserialize)]
struct LoraCacheEntry {
    hash: String,
    mtime: f64,
}

/// Legacy cache files present in `data_dir`.
pub fn legacy_cache_files(data_dir: &Path) -> Vec<PathBuf> {
    [PathsConfig::LEGACY_CHECKPOINT_CACHE, PathsConfig::LEGACY_LORA_CACHE]
        .iter()
        .map(|name| data_dir.join(name))
        .filter(|path| path.is_file())
        .collect()
}

/// Import both legacy caches from `data_dir` into the store.
///
/// Entries that cannot be parsed, or whose lora file no longer resolves,
/// are counted as skipped.
pub fn migrate_legacy_caches(
    data_dir: &Path,
    store: &IdentityStore,
    provider: &dyn ModelDirectories,
) -> Result<MigrationReport> {
    let mut report = MigrationReport::default();

    let checkpoint_cache = data_dir.join(PathsConfig::LEGACY_CHECKPOINT_CACHE);
    if checkpoint_cache.is_file() {
        info!("Migrating checkpoints from {}", checkpoint_cache.display());
        for (key, value) in read_cache(&checkpoint_cache)? {
            match import_checkpoint_entry(store, &key, &value) {
                Ok(()) => report.migrated += 1,
                Err(e) => {
                    debug!("Skipping legacy checkpoint entry {}: {}", key, e);
                    report.skipped += 1;
                }
            }
        }
        mark_migrated(&checkpoint_cache)?;
        report.files.push(checkpoint_cache);
    }

    let lora_cache = data_dir.join(PathsConfig::LEGACY_LORA_CACHE);
    if lora_cache.is_file() {
        info!("Migrating loras from {}", lora_cache.display());
        for (relative, value) in read_cache(&lora_cache)? {
            match import_lora_entry(store, provider, &relative, value) {
                Ok(()) => report.migrated += 1,
                Err(e) => {
                    debug!("Skipping legacy lora entry {}: {}", relative, e);
                    report.skipped += 1;
                }
            }
        }
        mark_migrated(&lora_cache)?;
        report.files.push(lora_cache);
    }

    if report.found_any() {
        info!(
            "Legacy migration complete: {} migrated, {} skipped",
            report.migrated, report.skipped
        );
    } else {
        debug!("No legacy cache files in {}", data_dir.display());
    }
    Ok(report)
}

fn read_cache(path: &Path) -> Result<Map<String, Value>> {
    let content =
        std::fs::read_to_string(path).map_err(|e| ProvenanceError::io_with_path(e, path))?;
    match serde_json::from_str(&content)? {
        Value::Object(map) => Ok(map),
        _ => Err(ProvenanceError::Validation {
            field: path.display().to_string(),
            message: "legacy cache is not a JSON object".to_string(),
        }),
    }
}

fn import_checkpoint_entry(store: &IdentityStore, key: &str, value: &Value) -> Result<()> {
    let parts: Vec<&str> = key.split('|').collect();
    let [path, mtime, _size] = parts.as_slice() else {
        return Err(invalid(key, "expected path|mtime|size"));
    };
    let mtime: f64 = mtime
        .trim()
        .parse()
        .map_err(|_| invalid(key, "mtime is not a number"))?;
    let hash = value
        .as_str()
        .filter(|h| !h.trim().is_empty())
        .ok_or_else(|| invalid(key, "hash is not a string"))?;

    store.record_local_file(
        hash,
        &normalize_path(Path::new(path)),
        secs_to_ns(mtime),
        ModelCategory::Checkpoints,
    )
}

fn import_lora_entry(
    store: &IdentityStore,
    provider: &dyn ModelDirectories,
    relative: &str,
    value: Value,
) -> Result<()> {
    let entry: LoraCacheEntry = serde_json::from_value(value)?;
    let full_path = provider
        .full_path(ModelCategory::Loras, relative)
        .ok_or_else(|| ProvenanceError::FileNotFound(PathBuf::from(relative)))?;

    store.record_local_file(
        &entry.hash,
        &normalize_path(&full_path),
        secs_to_ns(entry.mtime),
        ModelCategory::Loras,
    )
}

fn mark_migrated(path: &Path) -> Result<()> {
    let mut renamed = path.as_os_str().to_owned();
    renamed.push(PathsConfig::MIGRATED_SUFFIX);
    std::fs::rename(path, &renamed).map_err(|e| {
        warn!("Could not rename {}: {}", path.display(), e);
        ProvenanceError::io_with_path(e, path)
    })
}

fn secs_to_ns(secs: f64) -> i64 {
    (secs * 1_000_000_000.0) as i64
}

fn invalid(key: &str, message: &str) -> ProvenanceError {
    ProvenanceError::Validation {
        field: key.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::FolderLayout;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_migrates_both_formats() {
        let data = TempDir::new().unwrap();
        let models = TempDir::new().unwrap();
        let loras = models.path().join("loras");
        std::fs::create_dir_all(&loras).unwrap();
        std::fs::write(loras.join("styleA.safetensors"), b"x").unwrap();

        let checkpoint_cache = json!({
            "/models/checkpoints/base.safetensors|1700000000.5|1234": "ABCDEF0123",
            "broken-key": "ffff",
        });
        let lora_cache = json!({
            "styleA.safetensors": {"hash": "DEF456", "mtime": 1700000001.0},
            "gone.safetensors": {"hash": "0000", "mtime": 1.0},
        });
        std::fs::write(
            data.path().join(PathsConfig::LEGACY_CHECKPOINT_CACHE),
            checkpoint_cache.to_string(),
        )
        .unwrap();
        std::fs::write(
            data.path().join(PathsConfig::LEGACY_LORA_CACHE),
            lora_cache.to_string(),
        )
        .unwrap();

        let store = IdentityStore::open_in_memory().unwrap();
        let layout = FolderLayout::from_models_root(models.path());
        let report = migrate_legacy_caches(data.path(), &store, &layout).unwrap();

        assert_eq!(report.migrated, 2);
        assert_eq!(report.skipped, 2);
        assert!(legacy_cache_files(data.path()).is_empty());
        assert!(data.path().join("hash_cache.json.migrated").is_file());

        let checkpoint = store.local_file_by_hash("abcdef0123").unwrap().unwrap();
        assert_eq!(checkpoint.category, ModelCategory::Checkpoints);
        assert_eq!(checkpoint.mtime_ns, Some(1_700_000_000_500_000_000));

        let lora = store.local_file_by_hash("def456").unwrap().unwrap();
        assert_eq!(lora.category, ModelCategory::Loras);
        assert!(lora.path.unwrap().ends_with("loras/styleA.safetensors"));
    }

    #[test]
    fn test_nothing_to_migrate() {
        let data = TempDir::new().unwrap();
        let store = IdentityStore::open_in_memory().unwrap();
        let report = migrate_legacy_caches(data.path(), &store, &FolderLayout::new()).unwrap();
        assert_eq!(report, MigrationReport::default());
        assert!(!report.found_any());
    }
}
