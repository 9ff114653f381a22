//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use provenance_core::{
    FolderLayout, ProvenanceEngine, ProvenanceError, RegistryResponse, RegistryTransport,
    RetryConfig,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory registry answering by path. Unknown paths answer 404.
#[derive(Default)]
pub struct StubRegistry {
    replies: Mutex<HashMap<String, Value>>,
    failing: Mutex<Vec<String>>,
    calls: Mutex<Vec<String>>,
}

impl StubRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, key: &str, body: Value) {
        self.replies.lock().unwrap().insert(key.to_string(), body);
    }

    /// Answer `key` with a server error.
    pub fn fail(&self, key: &str) {
        self.failing.lock().unwrap().push(key.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_to(&self, key: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|k| *k == key).count()
    }
}

#[async_trait]
impl RegistryTransport for StubRegistry {
    async fn get(
        &self,
        path: &str,
        query: &[(String, String)],
    ) -> provenance_core::Result<RegistryResponse> {
        let key = match query.iter().find(|(k, _)| k == "page") {
            Some((_, page)) => format!("{}?page={}", path, page),
            None => path.to_string(),
        };
        self.calls.lock().unwrap().push(key.clone());

        if self.failing.lock().unwrap().contains(&key) {
            return Err(ProvenanceError::Network {
                message: format!("GET {} failed with HTTP 503", path),
                cause: None,
            });
        }
        Ok(match self.replies.lock().unwrap().get(&key) {
            Some(body) => RegistryResponse::Found(body.clone()),
            None => RegistryResponse::NotFound,
        })
    }
}

/// Registry version payload with one primary file.
pub fn version_payload(id: i64, model_id: i64, sha: &str, model: &str, kind: &str) -> Value {
    json!({
        "id": id,
        "modelId": model_id,
        "name": "v1.0",
        "baseModel": "SDXL 1.0",
        "trainedWords": ["ink style"],
        "model": {"name": model, "type": kind},
        "files": [{"primary": true, "hashes": {"SHA256": sha.to_uppercase()}}]
    })
}

/// Bytes of a small safetensors file whose header carries `metadata`.
pub fn safetensors_bytes(metadata: Value) -> Vec<u8> {
    let header = serde_json::to_vec(&json!({
        "__metadata__": metadata,
        "w": {"dtype": "F16", "shape": [2], "data_offsets": [0, 4]}
    }))
    .unwrap();
    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&[0u8; 4]);
    bytes
}

/// Temp data dir plus a models root with one subdirectory per category.
pub struct TestEnv {
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        for sub in ["data", "models/checkpoints", "models/loras", "models/vae", "models/embeddings"] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        Self { dir }
    }

    pub fn data_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("data")
    }

    pub fn models_root(&self) -> std::path::PathBuf {
        self.dir.path().join("models")
    }

    pub fn write_model(&self, relative: &str, content: &[u8]) -> std::path::PathBuf {
        let path = self.models_root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Engine over this environment talking to `registry`.
    pub fn engine(&self, registry: Arc<StubRegistry>) -> ProvenanceEngine {
        ProvenanceEngine::builder(self.data_dir())
            .with_provider(FolderLayout::from_models_root(self.models_root()))
            .with_transport(registry)
            .with_retry(RetryConfig::no_retry())
            .with_page_delay(Duration::ZERO)
            .build()
            .expect("engine should build")
    }
}

pub fn sha256_of(path: &Path) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(std::fs::read(path).unwrap()))
}
