//! Registry client: hash and id lookups with write-through persistence.
//!
//! Every successful fetch is persisted through the [`IdentityStore`] before
//! it is returned, so a cold identifier becomes warm exactly once. A 404 on
//! a hash lookup is a definitive answer and becomes a not-found marker.

use super::client::{RegistryResponse, RegistryTransport};
use super::retry::{retry_registry, RetryConfig};
use crate::config::RegistryConfig;
use crate::error::Result;
use crate::inventory::hashing::normalize_hash;
use crate::models::{ImageQuery, ImageRecord, RegistryImage, RegistryImagePage, VersionRecord};
use crate::store::IdentityStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Images collected for one version.
#[derive(Debug, Clone, Default)]
pub struct ImageFetch {
    pub images: Vec<RegistryImage>,
    pub pages: u32,
    /// Error that stopped paging early, if any.
    pub halted: Option<String>,
}

/// Registry lookups backed by a transport and the identity store.
pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    store: Arc<IdentityStore>,
    retry: RetryConfig,
    page_delay: Duration,
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn RegistryTransport>, store: Arc<IdentityStore>) -> Self {
        Self {
            transport,
            store,
            retry: RetryConfig::registry_default(),
            page_delay: RegistryConfig::IMAGES_PAGE_DELAY,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    async fn get(&self, path: &str, query: &[(String, String)]) -> Result<RegistryResponse> {
        let (result, stats) = retry_registry(&self.retry, || self.transport.get(path, query)).await;
        if stats.attempts > 1 {
            debug!(
                "GET {} took {} attempts ({:?} waiting)",
                path, stats.attempts, stats.total_delay
            );
        }
        result
    }

    /// Look up the version whose file has this SHA256.
    ///
    /// `Ok(None)` means the registry does not know the hash; that answer is
    /// persisted as a not-found marker. Transport failures surface as errors.
    pub async fn lookup_by_hash(&self, hash: &str) -> Result<Option<VersionRecord>> {
        let hash = normalize_hash(hash);
        let path = format!("/model-versions/by-hash/{}", hash);

        match self.get(&path, &[]).await? {
            RegistryResponse::Found(payload) if has_id(&payload) => {
                self.store.upsert_version(&payload, Some(&hash))
            }
            _ => {
                self.store.mark_not_found(&hash)?;
                Ok(None)
            }
        }
    }

    /// Look up a version by registry id.
    pub async fn lookup_by_id(&self, version_id: i64) -> Result<Option<VersionRecord>> {
        let path = format!("/model-versions/{}", version_id);

        match self.get(&path, &[]).await? {
            RegistryResponse::Found(payload) if has_id(&payload) => {
                let record = self.store.upsert_version(&payload, None)?;
                if record.is_none() {
                    warn!("Version {} has no hashed file, not cached", version_id);
                }
                Ok(record)
            }
            _ => {
                debug!("Version {} does not exist on the registry", version_id);
                Ok(None)
            }
        }
    }

    /// Full model payload (tags, description). Updates the stored model row.
    pub async fn fetch_model(&self, model_id: i64) -> Result<Option<serde_json::Value>> {
        let path = format!("/models/{}", model_id);

        match self.get(&path, &[]).await? {
            RegistryResponse::Found(payload) => {
                let name = payload.get("name").and_then(|v| v.as_str());
                let model_type = payload.get("type").and_then(|v| v.as_str());
                self.store.upsert_model(model_id, name, model_type)?;
                Ok(Some(payload))
            }
            RegistryResponse::NotFound => Ok(None),
        }
    }

    /// Page through sample outputs of a version.
    ///
    /// Only items with a metadata object that pass the media filter are
    /// kept. Paging stops at the limit, on an empty page or on a persistent
    /// error; whatever was collected is persisted and returned.
    pub async fn fetch_images(&self, version_id: i64, query: &ImageQuery) -> ImageFetch {
        let mut fetch = ImageFetch::default();
        let mut page = 1u32;

        while fetch.images.len() < query.limit && page <= RegistryConfig::IMAGES_MAX_PAGES {
            let params = vec![
                ("modelVersionId".to_string(), version_id.to_string()),
                ("limit".to_string(), RegistryConfig::IMAGES_PAGE_LIMIT.to_string()),
                ("sort".to_string(), query.sort.as_str().to_string()),
                ("nsfw".to_string(), query.nsfw.as_str().to_string()),
                ("page".to_string(), page.to_string()),
            ];

            let payload = match self.get("/images", &params).await {
                Ok(RegistryResponse::Found(payload)) => payload,
                Ok(RegistryResponse::NotFound) => break,
                Err(e) => {
                    warn!("Halting image fetch for version {}: {}", version_id, e);
                    fetch.halted = Some(e.to_string());
                    break;
                }
            };

            let items = match serde_json::from_value::<RegistryImagePage>(payload) {
                Ok(page) => page.items,
                Err(e) => {
                    warn!("Unreadable image page {} for version {}: {}", page, version_id, e);
                    fetch.halted = Some(e.to_string());
                    break;
                }
            };
            fetch.pages = page;

            if items.is_empty() {
                debug!("Reached the end of images for version {}", version_id);
                break;
            }

            fetch.images.extend(
                items
                    .into_iter()
                    .filter(|img| img.has_meta() && query.media.accepts(img)),
            );

            if fetch.images.len() >= query.limit {
                break;
            }
            page += 1;
            tokio::time::sleep(self.page_delay).await;
        }

        fetch.images.truncate(query.limit);

        for image in &fetch.images {
            if image.url.is_empty() {
                continue;
            }
            let record = ImageRecord {
                url: image.url.clone(),
                version_id: Some(version_id),
                metadata: image.meta.clone(),
                local_filename: None,
            };
            if let Err(e) = self.store.upsert_image(&record) {
                warn!("Failed to store image {}: {}", image.url, e);
            }
        }

        info!(
            "Fetched {} images for version {} over {} pages",
            fetch.images.len(),
            version_id,
            fetch.pages
        );
        fetch
    }
}

fn has_id(payload: &serde_json::Value) -> bool {
    payload.get("id").and_then(|v| v.as_i64()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaFilter;
    use crate::network::testing::{StubReply, StubTransport};
    use crate::store::VersionLookup;
    use serde_json::json;

    fn client(stub: Arc<StubTransport>) -> (RegistryClient, Arc<IdentityStore>) {
        let store = Arc::new(IdentityStore::open_in_memory().unwrap());
        let client = RegistryClient::new(stub, store.clone())
            .with_retry(RetryConfig::no_retry())
            .with_page_delay(Duration::ZERO);
        (client, store)
    }

    fn version(id: i64, sha: &str) -> serde_json::Value {
        json!({
            "id": id,
            "modelId": 1,
            "name": "v1",
            "model": {"name": "Style", "type": "LORA"},
            "files": [{"primary": true, "hashes": {"SHA256": sha}}]
        })
    }

    #[tokio::test]
    async fn test_lookup_by_hash_persists_result() {
        let stub = Arc::new(StubTransport::new());
        stub.reply("/model-versions/by-hash/abcd1234", StubReply::Json(version(9, "ABCD1234")));
        let (client, store) = client(stub.clone());

        let record = client.lookup_by_hash("ABCD1234").await.unwrap().unwrap();
        assert_eq!(record.version_id, Some(9));
        assert!(store
            .get_version(VersionLookup::Hash("abcd1234"))
            .unwrap()
            .unwrap()
            .is_positive());
        assert_eq!(stub.calls(), 1);
    }

    #[tokio::test]
    async fn test_lookup_by_hash_404_marks_not_found() {
        let stub = Arc::new(StubTransport::new());
        let (client, store) = client(stub.clone());

        assert!(client.lookup_by_hash("ffff0000").await.unwrap().is_none());
        let record = store
            .get_version(VersionLookup::Hash("ffff0000"))
            .unwrap()
            .unwrap();
        assert!(record.is_negative());
    }

    #[tokio::test]
    async fn test_object_without_id_counts_as_missing() {
        let stub = Arc::new(StubTransport::new());
        stub.reply("/model-versions/by-hash/eeee0000", StubReply::Json(json!({"error": "nope"})));
        let (client, store) = client(stub);

        assert!(client.lookup_by_hash("eeee0000").await.unwrap().is_none());
        assert!(store
            .get_version(VersionLookup::Hash("eeee0000"))
            .unwrap()
            .unwrap()
            .is_negative());
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_without_marking() {
        let stub = Arc::new(StubTransport::new());
        stub.reply("/model-versions/by-hash/aaaa0000", StubReply::ServerError);
        let (client, store) = client(stub);

        assert!(client.lookup_by_hash("aaaa0000").await.is_err());
        assert!(store
            .get_version(VersionLookup::Hash("aaaa0000"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_fetch_images_filters_and_pages() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(
            "/images?page=1",
            StubReply::Json(json!({"items": [
                {"url": "u1", "type": "image", "meta": {"seed": 1}},
                {"url": "u2", "type": "image", "meta": null},
                {"url": "u3", "type": "video", "meta": {"seed": 3}}
            ]})),
        );
        stub.reply(
            "/images?page=2",
            StubReply::Json(json!({"items": [{"url": "u4", "type": "image", "meta": {"seed": 4}}]})),
        );
        stub.reply("/images?page=3", StubReply::Json(json!({"items": []})));
        let (client, store) = client(stub);

        let query = ImageQuery {
            limit: 10,
            media: MediaFilter::Image,
            ..ImageQuery::default()
        };
        let fetch = client.fetch_images(9, &query).await;
        let urls: Vec<_> = fetch.images.iter().map(|i| i.url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u4"]);
        assert!(fetch.halted.is_none());

        let stored = store.get_image_by_url("u4").unwrap().unwrap();
        assert_eq!(stored.version_id, Some(9));
    }

    #[tokio::test]
    async fn test_fetch_images_keeps_partial_results_on_error() {
        let stub = Arc::new(StubTransport::new());
        stub.reply(
            "/images?page=1",
            StubReply::Json(json!({"items": [{"url": "u1", "meta": {"seed": 1}}]})),
        );
        stub.reply("/images?page=2", StubReply::ServerError);
        let (client, _store) = client(stub);

        let fetch = client.fetch_images(9, &ImageQuery::default()).await;
        assert_eq!(fetch.images.len(), 1);
        assert!(fetch.halted.is_some());
    }
}
