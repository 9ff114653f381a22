//! Training metadata embedded in safetensors headers.
//!
//! A safetensors file starts with an 8-byte little-endian header length
//! followed by a JSON header. Trainers store string-valued metadata under
//! `__metadata__`; `ss_tag_frequency` is itself JSON mapping each dataset
//! bucket to `{tag: count}`.

use crate::config::ScanConfig;
use crate::error::{ProvenanceError, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TAG_FREQUENCY_KEY: &str = "ss_tag_frequency";

/// `__metadata__` of a safetensors file.
///
/// Files without a metadata block yield an empty map. A header that is not
/// a safetensors header is an error.
pub fn read_metadata(path: impl AsRef<Path>) -> Result<Map<String, Value>> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| ProvenanceError::io_with_path(e, path))?;

    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf)
        .map_err(|e| ProvenanceError::io_with_path(e, path))?;
    let header_len = u64::from_le_bytes(len_buf);
    if header_len == 0 || header_len > ScanConfig::MAX_SAFETENSORS_HEADER {
        return Err(ProvenanceError::MalformedPayload {
            message: format!(
                "{} has an implausible safetensors header length {}",
                path.display(),
                header_len
            ),
        });
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|e| ProvenanceError::io_with_path(e, path))?;
    let header: Value =
        serde_json::from_slice(&header).map_err(|e| ProvenanceError::MalformedPayload {
            message: format!("{} has an unreadable safetensors header: {}", path.display(), e),
        })?;

    Ok(match header.get("__metadata__") {
        Some(Value::Object(metadata)) => metadata.clone(),
        _ => Map::new(),
    })
}

/// Training tags from `ss_tag_frequency`, most frequent first.
///
/// Counts for the same tag are summed across buckets. Ties keep
/// alphabetical order. Missing or unparsable frequency data gives an
/// empty list.
pub fn tags_by_frequency(metadata: &Map<String, Value>) -> Vec<String> {
    let Some(raw) = metadata.get(TAG_FREQUENCY_KEY) else {
        return Vec::new();
    };
    let parsed = match raw {
        Value::String(s) => serde_json::from_str::<Value>(s),
        other => Ok(other.clone()),
    };
    let buckets = match parsed {
        Ok(Value::Object(buckets)) => buckets,
        Ok(_) => return Vec::new(),
        Err(e) => {
            warn!("Unparsable {}: {}", TAG_FREQUENCY_KEY, e);
            return Vec::new();
        }
    };

    let mut counts: HashMap<String, u64> = HashMap::new();
    for dataset in buckets.values() {
        let Some(tags) = dataset.as_object() else {
            continue;
        };
        for (tag, count) in tags {
            let tag = tag.trim();
            if tag.is_empty() {
                continue;
            }
            *counts.entry(tag.to_string()).or_default() += count.as_u64().unwrap_or(0);
        }
    }

    let mut ranked: Vec<(String, u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().map(|(tag, _)| tag).collect()
}

/// Training tags of a model file; non-safetensors files have none.
pub fn file_trigger_words(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !is_safetensors(path) {
        debug!("{} is not a safetensors file, no embedded tags", path.display());
        return Ok(Vec::new());
    }
    Ok(tags_by_frequency(&read_metadata(path)?))
}

/// [`file_trigger_words`] on the blocking pool.
pub async fn file_trigger_words_blocking(path: PathBuf) -> Result<Vec<String>> {
    tokio::task::spawn_blocking(move || file_trigger_words(&path))
        .await
        .map_err(|e| ProvenanceError::Other(format!("Header read task failed: {}", e)))?
}

fn is_safetensors(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors") || ext.eq_ignore_ascii_case("sft"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    /// Write a minimal safetensors file carrying `metadata`.
    fn write_safetensors(path: &Path, metadata: Option<Value>) {
        let mut header = json!({
            "w": {"dtype": "F32", "shape": [1], "data_offsets": [0, 4]}
        });
        if let Some(metadata) = metadata {
            header["__metadata__"] = metadata;
        }
        let header = serde_json::to_vec(&header).unwrap();

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(&(header.len() as u64).to_le_bytes()).unwrap();
        file.write_all(&header).unwrap();
        file.write_all(&[0u8; 4]).unwrap();
    }

    fn tag_metadata() -> Value {
        let frequency = json!({
            "10_ink": {"ink style": 12, "monochrome": 4, " sketch ": 1},
            "5_color": {"monochrome": 9, "watercolor": 4}
        });
        json!({
            "ss_network_module": "networks.lora",
            "ss_tag_frequency": frequency.to_string()
        })
    }

    #[test]
    fn test_tags_summed_and_sorted() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ink.safetensors");
        write_safetensors(&path, Some(tag_metadata()));

        let metadata = read_metadata(&path).unwrap();
        assert_eq!(metadata["ss_network_module"], "networks.lora");
        assert_eq!(
            file_trigger_words(&path).unwrap(),
            vec!["monochrome", "ink style", "watercolor", "sketch"]
        );
    }

    #[test]
    fn test_missing_metadata_gives_no_tags() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plain.safetensors");
        write_safetensors(&path, None);
        assert!(read_metadata(&path).unwrap().is_empty());
        assert!(file_trigger_words(&path).unwrap().is_empty());

        let mut broken = Map::new();
        broken.insert(TAG_FREQUENCY_KEY.into(), json!("{not json"));
        assert!(tags_by_frequency(&broken).is_empty());
    }

    #[test]
    fn test_non_safetensors_and_bad_header() {
        let temp = TempDir::new().unwrap();
        let pt = temp.path().join("model.pt");
        std::fs::write(&pt, b"PK\x03\x04 pickle").unwrap();
        assert!(file_trigger_words(&pt).unwrap().is_empty());

        let bogus = temp.path().join("bogus.safetensors");
        std::fs::write(&bogus, u64::MAX.to_le_bytes()).unwrap();
        assert!(matches!(
            read_metadata(&bogus),
            Err(ProvenanceError::MalformedPayload { .. })
        ));
    }
}
