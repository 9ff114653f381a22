//! Streaming content hashing for model files.
//!
//! Files are read in fixed 8MB blocks so memory stays bounded for
//! multi-gigabyte artifacts. Nothing is cached here; the scanner decides
//! which files need hashing.

use crate::config::ScanConfig;
use crate::error::{ProvenanceError, Result};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Length of the short "AutoV2" hash embedded in generation metadata.
pub const SHORT_HASH_LEN: usize = 10;

/// Compute the SHA256 of a file as lowercase hex.
pub fn compute_sha256(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path).map_err(|e| ProvenanceError::io_with_path(e, path))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ScanConfig::HASH_CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| ProvenanceError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA256 on the blocking pool.
pub async fn compute_sha256_blocking(path: PathBuf) -> Result<String> {
    tokio::task::spawn_blocking(move || compute_sha256(&path))
        .await
        .map_err(|e| ProvenanceError::Other(format!("Hash computation task failed: {}", e)))?
}

/// Canonical form of a hash string: trimmed, lowercase.
pub fn normalize_hash(hash: &str) -> String {
    hash.trim().to_lowercase()
}

/// Short prefix form used by older generation tools.
pub fn short_hash(hash: &str) -> String {
    normalize_hash(hash).chars().take(SHORT_HASH_LEN).collect()
}

/// Whether a string looks like a hex digest or a prefix of one.
pub fn is_hex_hash(value: &str) -> bool {
    let value = value.trim();
    value.len() >= 8 && value.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_sha256_empty_file() {
        let file = NamedTempFile::new().unwrap();
        assert_eq!(
            compute_sha256(file.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_sha256_spans_chunks() {
        let mut file = NamedTempFile::new().unwrap();
        let data = vec![7u8; ScanConfig::HASH_CHUNK_SIZE + 13];
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(compute_sha256(file.path()).unwrap(), expected);
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = compute_sha256("/definitely/not/here.safetensors").unwrap_err();
        assert!(err.to_string().contains("not/here.safetensors"));
    }

    #[test]
    fn test_normalize_and_short_hash() {
        assert_eq!(normalize_hash("  ABCdef0123 "), "abcdef0123");
        assert_eq!(
            short_hash("E3B0C44298FC1C149AFBF4C8996FB924"),
            "e3b0c44298"
        );
        assert!(is_hex_hash("e3b0c44298"));
        assert!(!is_hex_hash("styleA"));
        assert!(!is_hex_hash("abc"));
    }

    #[tokio::test]
    async fn test_blocking_variant_matches() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();
        file.flush().unwrap();

        let sync_hash = compute_sha256(file.path()).unwrap();
        let async_hash = compute_sha256_blocking(file.path().to_path_buf())
            .await
            .unwrap();
        assert_eq!(sync_hash, async_hash);
    }
}
