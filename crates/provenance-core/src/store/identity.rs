//! Store lifecycle, schema, settings and registry identity records.

use super::CacheKind;
use crate::error::{ProvenanceError, Result};
use crate::inventory::hashing::normalize_hash;
use crate::models::{ModelRecord, RegistryVersion, VersionRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Key for [`IdentityStore::get_version`].
#[derive(Debug, Clone, Copy)]
pub enum VersionLookup<'a> {
    Hash(&'a str),
    Id(i64),
}

/// Row counts per table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    /// Local files with a live path, per category.
    pub local_files: BTreeMap<String, usize>,
    /// Paths holding content already owned by another file.
    pub duplicate_paths: usize,
    pub versions: usize,
    pub positive_versions: usize,
    pub negative_versions: usize,
    pub models: usize,
    pub images: usize,
    pub analysis_entries: usize,
}

/// SQLite-backed identity store.
///
/// The connection sits behind a mutex and is taken out on [`close`](Self::close);
/// every call after that fails with a database error.
pub struct IdentityStore {
    db_path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
}

const VERSION_COLUMNS: &str =
    "hash, version_id, model_id, name, trained_words, raw_payload, last_checked_at";

impl IdentityStore {
    /// Open or create the store at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| ProvenanceError::Io {
                    message: format!("Failed to create directory {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(&db_path).map_err(|e| ProvenanceError::Database {
            message: format!("Failed to open identity store {}: {}", db_path.display(), e),
            source: Some(e),
        })?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        info!("Opened identity store at {}", db_path.display());
        Ok(Self {
            db_path: Some(db_path),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Open a throwaway in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::ensure_schema(&conn)?;
        Ok(Self {
            db_path: None,
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Close the connection. Later calls on this store fail.
    pub fn close(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| ProvenanceError::lock_poisoned())?
            .take();

        match conn {
            Some(conn) => {
                conn.close().map_err(|(_, e)| ProvenanceError::Database {
                    message: format!("Failed to close identity store: {}", e),
                    source: Some(e),
                })?;
                debug!("Closed identity store");
                Ok(())
            }
            None => Ok(()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Database file, `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA busy_timeout=30000;
            PRAGMA synchronous=NORMAL;
            ",
        )?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS models (
                model_id INTEGER PRIMARY KEY,
                name TEXT,
                category TEXT
            );

            CREATE TABLE IF NOT EXISTS versions (
                hash TEXT PRIMARY KEY,
                version_id INTEGER UNIQUE,
                model_id INTEGER REFERENCES models(model_id),
                name TEXT,
                trained_words TEXT,
                raw_payload TEXT,
                last_checked_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS local_files (
                hash TEXT PRIMARY KEY,
                path TEXT UNIQUE,
                mtime_ns INTEGER,
                category TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_local_files_category
                ON local_files(category);

            CREATE TABLE IF NOT EXISTS duplicate_paths (
                path TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                mtime_ns INTEGER,
                category TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_duplicate_paths_category
                ON duplicate_paths(category);

            CREATE TABLE IF NOT EXISTS images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                version_id INTEGER,
                metadata TEXT,
                local_filename TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_images_version
                ON images(version_id);

            CREATE TABLE IF NOT EXISTS analysis_cache (
                fingerprint TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| ProvenanceError::Database {
            message: format!("Failed to initialize identity store schema: {}", e),
            source: Some(e),
        })?;
        Ok(())
    }

    /// Run `f` against the open connection.
    pub(super) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| ProvenanceError::lock_poisoned())?;
        let conn = guard.as_mut().ok_or_else(ProvenanceError::store_closed)?;
        f(conn)
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Raw JSON value of a setting.
    pub fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<String> = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM settings WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        Ok(raw.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Ignoring unreadable setting {}: {}", key, e);
                None
            }
        }))
    }

    /// Typed setting, `default` when missing or of the wrong shape.
    pub fn get_setting_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self
            .get_setting(key)?
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or(default))
    }

    pub fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, json],
            )?;
            Ok(())
        })
    }

    // ------------------------------------------------------------------
    // Models
    // ------------------------------------------------------------------

    /// Insert or update a model family. Missing fields keep their stored value.
    pub fn upsert_model(
        &self,
        model_id: i64,
        name: Option<&str>,
        category: Option<&str>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            upsert_model_row(conn, model_id, name, category)?;
            Ok(())
        })
    }

    pub fn get_model(&self, model_id: i64) -> Result<Option<ModelRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT model_id, name, category FROM models WHERE model_id = ?1",
                    params![model_id],
                    |row| {
                        Ok(ModelRecord {
                            model_id: row.get(0)?,
                            name: row.get(1)?,
                            category: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    // ------------------------------------------------------------------
    // Versions
    // ------------------------------------------------------------------

    pub fn get_version(&self, lookup: VersionLookup<'_>) -> Result<Option<VersionRecord>> {
        self.with_conn(|conn| {
            let record = match lookup {
                VersionLookup::Hash(hash) => conn
                    .query_row(
                        &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE hash = ?1"),
                        params![normalize_hash(hash)],
                        row_to_version,
                    )
                    .optional()?,
                VersionLookup::Id(version_id) => conn
                    .query_row(
                        &format!("SELECT {VERSION_COLUMNS} FROM versions WHERE version_id = ?1"),
                        params![version_id],
                        row_to_version,
                    )
                    .optional()?,
            };
            Ok(record)
        })
    }

    /// Persist a registry version payload.
    ///
    /// The payload is stored under `expected_hash` when given (a hash-keyed
    /// lookup), otherwise under the SHA256 of its primary file. A different
    /// hash still linked to the same version id loses that linkage first.
    /// Returns `None` when the payload names no file hash to key on.
    pub fn upsert_version(
        &self,
        payload: &serde_json::Value,
        expected_hash: Option<&str>,
    ) -> Result<Option<VersionRecord>> {
        let version: RegistryVersion =
            serde_json::from_value(payload.clone()).map_err(|e| ProvenanceError::MalformedPayload {
                message: format!("version payload: {}", e),
            })?;

        let model_id = version
            .resolved_model_id()
            .ok_or_else(|| ProvenanceError::MalformedPayload {
                message: format!("version {} carries no model id", version.id),
            })?;

        let hash = match (version.select_file_hash(expected_hash), expected_hash) {
            (Some(hash), _) => hash,
            (None, Some(expected)) => {
                debug!(
                    "Version {} lists no file with SHA256 {}, keeping lookup hash",
                    version.id, expected
                );
                normalize_hash(expected)
            }
            (None, None) => {
                warn!("Version {} lists no file hash, not persisted", version.id);
                return Ok(None);
            }
        };

        let model_name = version.model.as_ref().and_then(|m| m.name.clone());
        let model_type = version.model.as_ref().and_then(|m| m.model_type.clone());
        let trained_words_json = serde_json::to_string(&version.trained_words)?;
        let payload_json = serde_json::to_string(payload)?;
        let now = Utc::now();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            upsert_model_row(&tx, model_id, model_name.as_deref(), model_type.as_deref())?;

            let cleared = tx.execute(
                "UPDATE versions
                 SET version_id = NULL, model_id = NULL, raw_payload = NULL, last_checked_at = NULL
                 WHERE version_id = ?1 AND hash <> ?2",
                params![version.id, hash],
            )?;
            if cleared > 0 {
                debug!(
                    "Cleared stale linkage of version {} before storing it under {}",
                    version.id, hash
                );
            }

            tx.execute(
                "INSERT INTO versions (hash, version_id, model_id, name, trained_words, raw_payload, last_checked_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(hash) DO UPDATE SET
                     version_id = excluded.version_id,
                     model_id = excluded.model_id,
                     name = excluded.name,
                     trained_words = excluded.trained_words,
                     raw_payload = excluded.raw_payload,
                     last_checked_at = excluded.last_checked_at",
                params![
                    hash,
                    version.id,
                    model_id,
                    version.name,
                    trained_words_json,
                    payload_json,
                    now.timestamp(),
                ],
            )?;

            tx.commit()?;
            Ok(())
        })?;

        debug!("Stored version {} under {}", version.id, hash);
        Ok(Some(VersionRecord {
            content_hash: hash,
            version_id: Some(version.id),
            model_id: Some(model_id),
            name: version.name,
            trained_words: version.trained_words,
            raw_payload: Some(payload.clone()),
            last_checked_at: DateTime::from_timestamp(now.timestamp(), 0),
        }))
    }

    /// Record that the registry has no version for this hash.
    pub fn mark_not_found(&self, content_hash: &str) -> Result<VersionRecord> {
        self.mark_not_found_at(content_hash, Utc::now())
    }

    /// [`mark_not_found`](Self::mark_not_found) with an explicit check time.
    pub fn mark_not_found_at(
        &self,
        content_hash: &str,
        checked_at: DateTime<Utc>,
    ) -> Result<VersionRecord> {
        let hash = normalize_hash(content_hash);
        let checked_secs = checked_at.timestamp();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO versions (hash, version_id, model_id, name, trained_words, raw_payload, last_checked_at)
                 VALUES (?1, NULL, NULL, NULL, '[]', '{}', ?2)
                 ON CONFLICT(hash) DO UPDATE SET
                     version_id = NULL,
                     model_id = NULL,
                     name = NULL,
                     trained_words = '[]',
                     raw_payload = '{}',
                     last_checked_at = excluded.last_checked_at",
                params![hash, checked_secs],
            )?;
            Ok(())
        })?;

        info!("Marked {} as not found on the registry", hash);
        Ok(VersionRecord {
            content_hash: hash,
            version_id: None,
            model_id: None,
            name: None,
            trained_words: Vec::new(),
            raw_payload: Some(serde_json::json!({})),
            last_checked_at: DateTime::from_timestamp(checked_secs, 0),
        })
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Forget every stored registry payload so the next lookup goes remote.
    pub fn clear_api_responses(&self) -> Result<usize> {
        let rows = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE versions SET raw_payload = NULL, last_checked_at = NULL",
                [],
            )?)
        })?;
        info!("Cleared {} stored registry responses", rows);
        Ok(rows)
    }

    pub fn clear_trained_words(&self) -> Result<usize> {
        let rows = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE versions SET trained_words = NULL WHERE trained_words IS NOT NULL",
                [],
            )?)
        })?;
        info!("Cleared trained words of {} versions", rows);
        Ok(rows)
    }

    /// Drop one or all caches. Returns affected rows.
    pub fn clear_cache(&self, kind: CacheKind) -> Result<usize> {
        match kind {
            CacheKind::Analysis => self.clear_analysis_cache(),
            CacheKind::ApiResponses => self.clear_api_responses(),
            CacheKind::TrainedWords => self.clear_trained_words(),
            CacheKind::All => Ok(self.clear_analysis_cache()?
                + self.clear_api_responses()?
                + self.clear_trained_words()?),
        }
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<usize> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as usize)
            };

            let mut local_files = BTreeMap::new();
            {
                let mut stmt = conn.prepare(
                    "SELECT category, COUNT(*) FROM local_files
                     WHERE path IS NOT NULL GROUP BY category",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                for row in rows {
                    let (category, n) = row?;
                    local_files.insert(category, n as usize);
                }
            }

            Ok(StoreStats {
                local_files,
                duplicate_paths: count("SELECT COUNT(*) FROM duplicate_paths")?,
                versions: count("SELECT COUNT(*) FROM versions")?,
                positive_versions: count(
                    "SELECT COUNT(*) FROM versions WHERE version_id IS NOT NULL",
                )?,
                negative_versions: count(
                    "SELECT COUNT(*) FROM versions WHERE raw_payload = '{}'",
                )?,
                models: count("SELECT COUNT(*) FROM models")?,
                images: count("SELECT COUNT(*) FROM images")?,
                analysis_entries: count("SELECT COUNT(*) FROM analysis_cache")?,
            })
        })
    }
}

fn upsert_model_row(
    conn: &Connection,
    model_id: i64,
    name: Option<&str>,
    category: Option<&str>,
) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO models (model_id, name, category) VALUES (?1, ?2, ?3)
         ON CONFLICT(model_id) DO UPDATE SET
             name = COALESCE(excluded.name, models.name),
             category = COALESCE(excluded.category, models.category)",
        params![model_id, name, category],
    )
}

fn row_to_version(row: &Row) -> rusqlite::Result<VersionRecord> {
    let hash: String = row.get(0)?;
    let trained_words_json: Option<String> = row.get(4)?;
    let payload_json: Option<String> = row.get(5)?;
    let checked_at: Option<i64> = row.get(6)?;

    let trained_words = trained_words_json
        .and_then(|json| serde_json::from_str::<Vec<String>>(&json).ok())
        .unwrap_or_default();

    let raw_payload = payload_json.and_then(|json| match serde_json::from_str(&json) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Treating corrupt registry payload for {} as unchecked: {}", hash, e);
            None
        }
    });

    Ok(VersionRecord {
        version_id: row.get(1)?,
        model_id: row.get(2)?,
        name: row.get(3)?,
        trained_words,
        raw_payload,
        last_checked_at: checked_at.and_then(|secs| DateTime::from_timestamp(secs, 0)),
        content_hash: hash,
    })
}

/// Deserialize a nullable JSON column, logging and dropping corrupt values.
pub(super) fn parse_json_column<T: DeserializeOwned>(
    raw: Option<String>,
    what: &str,
) -> Option<T> {
    raw.and_then(|raw| match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Ignoring corrupt {}: {}", what, e);
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (IdentityStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = IdentityStore::open(temp_dir.path().join("data/provenance.db")).unwrap();
        (store, temp_dir)
    }

    fn version_payload(version_id: i64, sha: &str) -> serde_json::Value {
        json!({
            "id": version_id,
            "modelId": 7,
            "name": format!("v{}", version_id),
            "model": {"name": "Style", "type": "LORA"},
            "files": [{"name": "style.safetensors", "primary": true, "hashes": {"SHA256": sha}}],
            "trainedWords": ["stylized", "ink"]
        })
    }

    #[test]
    fn test_open_creates_parent_and_close() {
        let (store, temp) = create_test_store();
        assert!(temp.path().join("data/provenance.db").exists());
        assert!(store.is_open());

        store.close().unwrap();
        assert!(!store.is_open());
        assert!(store.get_setting("x").is_err());
        // Closing twice is harmless.
        store.close().unwrap();
    }

    #[test]
    fn test_settings_round_trip_and_default() {
        let store = IdentityStore::open_in_memory().unwrap();
        assert_eq!(store.get_setting_or("last_sync_loras", 0i64).unwrap(), 0);

        store.set_setting("last_sync_loras", &1_700_000_000i64).unwrap();
        assert_eq!(
            store.get_setting_or("last_sync_loras", 0i64).unwrap(),
            1_700_000_000
        );

        store.set_setting("network_choice", "work").unwrap();
        assert_eq!(store.get_setting("network_choice").unwrap(), Some(json!("work")));
    }

    #[test]
    fn test_upsert_version_and_lookup_both_ways() {
        let (store, _temp) = create_test_store();
        let record = store
            .upsert_version(&version_payload(101, "ABCDEF01"), None)
            .unwrap()
            .unwrap();
        assert_eq!(record.content_hash, "abcdef01");
        assert!(record.is_positive());

        let by_hash = store
            .get_version(VersionLookup::Hash("ABCDEF01"))
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.version_id, Some(101));
        assert_eq!(by_hash.model_id, Some(7));
        assert_eq!(by_hash.trained_words, vec!["stylized", "ink"]);
        assert!(by_hash.last_checked_at.is_some());

        let by_id = store.get_version(VersionLookup::Id(101)).unwrap().unwrap();
        assert_eq!(by_id.content_hash, "abcdef01");

        let model = store.get_model(7).unwrap().unwrap();
        assert_eq!(model.name.as_deref(), Some("Style"));
        assert_eq!(model.category.as_deref(), Some("LORA"));
    }

    #[test]
    fn test_upsert_version_selects_matching_file() {
        let store = IdentityStore::open_in_memory().unwrap();
        let payload = json!({
            "id": 55,
            "modelId": 3,
            "files": [
                {"name": "a.pt", "hashes": {"SHA256": "1111aaaa"}},
                {"name": "a.safetensors", "primary": true, "hashes": {"SHA256": "2222bbbb"}}
            ]
        });

        let record = store.upsert_version(&payload, Some("1111AAAA")).unwrap().unwrap();
        assert_eq!(record.content_hash, "1111aaaa");
        assert!(store
            .get_version(VersionLookup::Hash("2222bbbb"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_version_moving_to_new_hash_clears_stale_linkage() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .upsert_version(&version_payload(101, "aaaa0000"), None)
            .unwrap();
        store
            .upsert_version(&version_payload(101, "bbbb1111"), None)
            .unwrap();

        let old = store
            .get_version(VersionLookup::Hash("aaaa0000"))
            .unwrap()
            .unwrap();
        assert_eq!(old.version_id, None);
        assert_eq!(old.model_id, None);
        assert!(!old.is_checked());

        let current = store.get_version(VersionLookup::Id(101)).unwrap().unwrap();
        assert_eq!(current.content_hash, "bbbb1111");
    }

    #[test]
    fn test_upsert_without_model_id_is_malformed() {
        let store = IdentityStore::open_in_memory().unwrap();
        let err = store
            .upsert_version(&json!({"id": 9, "files": []}), Some("abcd1234"))
            .unwrap_err();
        assert!(matches!(err, ProvenanceError::MalformedPayload { .. }));
    }

    #[test]
    fn test_mark_not_found_is_distinct_from_unchecked() {
        let store = IdentityStore::open_in_memory().unwrap();
        assert!(store
            .get_version(VersionLookup::Hash("ffff0000"))
            .unwrap()
            .is_none());

        store.mark_not_found("FFFF0000").unwrap();
        let record = store
            .get_version(VersionLookup::Hash("ffff0000"))
            .unwrap()
            .unwrap();
        assert!(record.is_negative());
        assert_eq!(record.raw_payload, Some(json!({})));
        assert!(record.last_checked_at.is_some());
    }

    #[test]
    fn test_clear_api_responses_resets_checked_state() {
        let store = IdentityStore::open_in_memory().unwrap();
        store.mark_not_found("ffff0000").unwrap();
        store
            .upsert_version(&version_payload(1, "aaaa0000"), None)
            .unwrap();

        assert_eq!(store.clear_cache(CacheKind::ApiResponses).unwrap(), 2);
        let record = store
            .get_version(VersionLookup::Hash("ffff0000"))
            .unwrap()
            .unwrap();
        assert!(!record.is_checked());
        assert!(record.last_checked_at.is_none());
    }

    #[test]
    fn test_stats_counts() {
        let store = IdentityStore::open_in_memory().unwrap();
        store
            .upsert_version(&version_payload(1, "aaaa0000"), None)
            .unwrap();
        store.mark_not_found("ffff0000").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.versions, 2);
        assert_eq!(stats.positive_versions, 1);
        assert_eq!(stats.negative_versions, 1);
        assert_eq!(stats.models, 1);
    }
}
