//! Local file inventory records.

use super::IdentityStore;
use crate::error::Result;
use crate::inventory::hashing::normalize_hash;
use crate::inventory::ModelCategory;
use crate::models::LocalFileRecord;
use rusqlite::{params, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const LOCAL_COLUMNS: &str = "hash, path, mtime_ns, category";

impl IdentityStore {
    /// Record that `path` currently holds content `content_hash`.
    ///
    /// Any other hash still claiming the path loses it in the same
    /// transaction, so a re-hashed file never collides with its stale row.
    pub fn record_local_file(
        &self,
        content_hash: &str,
        path: &Path,
        mtime_ns: i64,
        category: ModelCategory,
    ) -> Result<()> {
        let hash = normalize_hash(content_hash);
        let path_str = path.to_string_lossy().into_owned();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE local_files SET path = NULL, mtime_ns = NULL
                 WHERE path = ?1 AND hash <> ?2",
                params![path_str, hash],
            )?;
            tx.execute(
                "DELETE FROM duplicate_paths WHERE path = ?1",
                params![path_str],
            )?;
            tx.execute(
                "INSERT INTO local_files (hash, path, mtime_ns, category)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(hash) DO UPDATE SET
                     path = excluded.path,
                     mtime_ns = excluded.mtime_ns,
                     category = excluded.category",
                params![hash, path_str, mtime_ns, category.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        debug!("Recorded {} -> {}", hash, path.display());
        Ok(())
    }

    /// Record that `path` holds content another file already owns.
    ///
    /// The path stops owning any hash it held before.
    pub fn record_duplicate_path(
        &self,
        content_hash: &str,
        path: &Path,
        mtime_ns: i64,
        category: ModelCategory,
    ) -> Result<()> {
        let hash = normalize_hash(content_hash);
        let path_str = path.to_string_lossy().into_owned();

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE local_files SET path = NULL, mtime_ns = NULL WHERE path = ?1",
                params![path_str],
            )?;
            tx.execute(
                "INSERT INTO duplicate_paths (path, hash, mtime_ns, category)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(path) DO UPDATE SET
                     hash = excluded.hash,
                     mtime_ns = excluded.mtime_ns,
                     category = excluded.category",
                params![path_str, hash, mtime_ns, category.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        debug!("Recorded duplicate {} -> {}", path.display(), hash);
        Ok(())
    }

    /// Duplicate paths of a category, as records of the content they hold.
    pub fn duplicate_paths_for_category(
        &self,
        category: ModelCategory,
    ) -> Result<Vec<LocalFileRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, path, mtime_ns, category FROM duplicate_paths
                 WHERE category = ?1
                 ORDER BY path",
            )?;
            let rows = stmt.query_map(params![category.as_str()], row_to_local)?;

            let mut records = Vec::new();
            for row in rows {
                match row {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => warn!("Error reading duplicate path row: {}", e),
                }
            }
            Ok(records)
        })
    }

    pub fn clear_duplicate_path(&self, path: &Path) -> Result<bool> {
        let path_str = path.to_string_lossy().into_owned();
        let rows = self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM duplicate_paths WHERE path = ?1",
                params![path_str],
            )?)
        })?;
        Ok(rows > 0)
    }

    /// Detach a path from whatever hash owns it. Returns whether a row changed.
    pub fn clear_local_path(&self, path: &Path) -> Result<bool> {
        let path_str = path.to_string_lossy().into_owned();
        let rows = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE local_files SET path = NULL, mtime_ns = NULL WHERE path = ?1",
                params![path_str],
            )?)
        })?;
        Ok(rows > 0)
    }

    pub fn local_file_by_path(&self, path: &Path) -> Result<Option<LocalFileRecord>> {
        let path_str = path.to_string_lossy().into_owned();
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {LOCAL_COLUMNS} FROM local_files WHERE path = ?1"),
                    params![path_str],
                    row_to_local,
                )
                .optional()?
                .flatten())
        })
    }

    pub fn local_file_by_hash(&self, content_hash: &str) -> Result<Option<LocalFileRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {LOCAL_COLUMNS} FROM local_files WHERE hash = ?1"),
                    params![normalize_hash(content_hash)],
                    row_to_local,
                )
                .optional()?
                .flatten())
        })
    }

    /// Every local file of a category that still has a path.
    pub fn local_files_for_category(&self, category: ModelCategory) -> Result<Vec<LocalFileRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LOCAL_COLUMNS} FROM local_files
                 WHERE category = ?1 AND path IS NOT NULL
                 ORDER BY path"
            ))?;
            let rows = stmt.query_map(params![category.as_str()], row_to_local)?;

            let mut records = Vec::new();
            for row in rows {
                match row {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {}
                    Err(e) => warn!("Error reading local file row: {}", e),
                }
            }
            Ok(records)
        })
    }

    /// Forget stored mtimes so the next sync re-hashes every file,
    /// duplicates included.
    pub fn reset_local_mtimes(&self, category: ModelCategory) -> Result<usize> {
        self.with_conn(|conn| {
            let owners = conn.execute(
                "UPDATE local_files SET mtime_ns = NULL WHERE category = ?1",
                params![category.as_str()],
            )?;
            let duplicates = conn.execute(
                "UPDATE duplicate_paths SET mtime_ns = NULL WHERE category = ?1",
                params![category.as_str()],
            )?;
            Ok(owners + duplicates)
        })
    }

    /// Hashes of present local files that were never looked up remotely.
    pub fn unchecked_local_hashes(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT l.hash FROM local_files l
                 LEFT JOIN versions v ON v.hash = l.hash
                 WHERE l.path IS NOT NULL AND v.raw_payload IS NULL
                 ORDER BY l.hash",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

            let mut hashes = Vec::new();
            for row in rows {
                hashes.push(row?);
            }
            Ok(hashes)
        })
    }
}

/// Map a row, skipping rows whose category is no longer known.
fn row_to_local(row: &Row) -> rusqlite::Result<Option<LocalFileRecord>> {
    let category: String = row.get(3)?;
    let category = match ModelCategory::parse(&category) {
        Ok(category) => category,
        Err(_) => {
            warn!("Skipping local file row with unknown category {}", category);
            return Ok(None);
        }
    };
    let path: Option<String> = row.get(1)?;

    Ok(Some(LocalFileRecord {
        content_hash: row.get(0)?,
        path: path.map(PathBuf::from),
        mtime_ns: row.get(2)?,
        category,
    }))
}
