//! Sample image records and the analysis cache.

use super::identity::parse_json_column;
use super::IdentityStore;
use crate::error::Result;
use crate::models::{AnalysisCacheEntry, ImageRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::debug;

impl IdentityStore {
    /// Insert or update an image by URL.
    ///
    /// Null fields never erase what is already stored.
    pub fn upsert_image(&self, image: &ImageRecord) -> Result<()> {
        let metadata_json = image
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO images (url, version_id, metadata, local_filename)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(url) DO UPDATE SET
                     version_id = COALESCE(excluded.version_id, images.version_id),
                     metadata = COALESCE(excluded.metadata, images.metadata),
                     local_filename = COALESCE(excluded.local_filename, images.local_filename)",
                params![
                    image.url,
                    image.version_id,
                    metadata_json,
                    image.local_filename
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_image_by_url(&self, url: &str) -> Result<Option<ImageRecord>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT url, version_id, metadata, local_filename FROM images WHERE url = ?1",
                    params![url],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<i64>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, Option<String>>(3)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        Ok(row.map(|(url, version_id, metadata, local_filename)| ImageRecord {
            metadata: parse_json_column(metadata, "image metadata"),
            url,
            version_id,
            local_filename,
        }))
    }

    pub fn get_analysis_cache(&self, fingerprint: &str) -> Result<Option<AnalysisCacheEntry>> {
        let row = self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT payload, updated_at FROM analysis_cache WHERE fingerprint = ?1",
                    params![fingerprint],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?)
        })?;

        Ok(row.and_then(|(payload, updated_at)| {
            let payload = parse_json_column(Some(payload), "analysis cache payload")?;
            Some(AnalysisCacheEntry {
                fingerprint: fingerprint.to_string(),
                payload,
                updated_at: DateTime::from_timestamp(updated_at, 0).unwrap_or_default(),
            })
        }))
    }

    pub fn set_analysis_cache(&self, fingerprint: &str, payload: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(payload)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO analysis_cache (fingerprint, payload, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(fingerprint) DO UPDATE SET
                     payload = excluded.payload,
                     updated_at = excluded.updated_at",
                params![fingerprint, json, Utc::now().timestamp()],
            )?;
            Ok(())
        })?;
        debug!("Stored analysis {}", fingerprint);
        Ok(())
    }

    pub fn clear_analysis_cache(&self) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM analysis_cache", [])?))
    }
}
