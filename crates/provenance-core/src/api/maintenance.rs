//! Settings, cache maintenance and statistics.

use crate::error::Result;
use crate::store::{CacheKind, StoreStats};
use crate::ProvenanceEngine;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

impl ProvenanceEngine {
    pub fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        self.store.get_setting(key)
    }

    /// Stored setting, or `default` when absent or of another type.
    pub fn get_setting_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        self.store.get_setting_or(key, default)
    }

    pub fn set_setting<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.store.set_setting(key, value)
    }

    /// Clear one family of cached data. Returns the number of rows affected.
    pub fn clear_cache(&self, kind: CacheKind) -> Result<usize> {
        let cleared = self.store.clear_cache(kind)?;
        info!("Cleared {} cached rows ({:?})", cleared, kind);
        Ok(cleared)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }
}
