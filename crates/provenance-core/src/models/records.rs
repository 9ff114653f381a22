//! Persisted record types.

use crate::inventory::ModelCategory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A local file known to the inventory, identified by its content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalFileRecord {
    pub content_hash: String,
    /// Absolute, normalized path. `None` once the path was cleared.
    pub path: Option<PathBuf>,
    /// Modification time in nanoseconds since the Unix epoch.
    pub mtime_ns: Option<i64>,
    pub category: ModelCategory,
}

/// An upstream model family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_id: i64,
    pub name: Option<String>,
    /// Registry model type, e.g. `LORA` or `Checkpoint`.
    pub category: Option<String>,
}

/// Registry identity of one distinct file content.
///
/// `raw_payload` distinguishes three states: `None` was never checked, an
/// empty object is a negative-cache marker, anything else is the registry
/// response the record was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub content_hash: String,
    pub version_id: Option<i64>,
    pub model_id: Option<i64>,
    pub name: Option<String>,
    pub trained_words: Vec<String>,
    pub raw_payload: Option<serde_json::Value>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl VersionRecord {
    /// Whether the registry confirmed this hash does not exist.
    pub fn is_negative(&self) -> bool {
        match &self.raw_payload {
            Some(serde_json::Value::Object(map)) => map.is_empty(),
            _ => false,
        }
    }

    /// Whether this record carries a registry identity.
    pub fn is_positive(&self) -> bool {
        self.version_id.is_some() && !self.is_negative()
    }

    /// Whether a lookup was ever performed for this hash.
    pub fn is_checked(&self) -> bool {
        self.raw_payload.is_some()
    }

    /// Model family name from the stored payload.
    pub fn model_name(&self) -> Option<&str> {
        self.payload_model_field("name")
    }

    /// Registry model type from the stored payload.
    pub fn model_type(&self) -> Option<&str> {
        self.payload_model_field("type")
    }

    /// Base model architecture label from the stored payload.
    pub fn base_model(&self) -> Option<&str> {
        self.raw_payload
            .as_ref()
            .and_then(|p| p.get("baseModel"))
            .and_then(|v| v.as_str())
    }

    fn payload_model_field(&self, field: &str) -> Option<&str> {
        self.raw_payload
            .as_ref()
            .and_then(|p| p.get("model"))
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_str())
    }
}

/// A sample output fetched from the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub url: String,
    pub version_id: Option<i64>,
    pub metadata: Option<serde_json::Value>,
    pub local_filename: Option<String>,
}

/// A memoized batch analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisCacheEntry {
    pub fingerprint: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// A locally known file joined with its registry names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalModelEntry {
    pub relative_path: String,
    pub category: ModelCategory,
    pub content_hash: Option<String>,
    pub model_id: Option<i64>,
    pub model_name: Option<String>,
    pub version_name: Option<String>,
}
