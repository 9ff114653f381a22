//! Per-batch deduplicating resolution cache.
//!
//! A [`SessionCache`] maps a key to a once-initialized slot. The map mutex is
//! held only to find or create the slot; the fetch itself runs outside it, and
//! concurrent callers for the same key wait on the slot instead of fetching.

use super::VersionSource;
use crate::models::VersionRecord;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Concurrent map with single-flight initialization per key.
pub struct SessionCache<K, V> {
    entries: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
    fetches: AtomicUsize,
}

impl<K, V> Default for SessionCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }
}

impl<K, V> SessionCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: K) -> Arc<OnceCell<V>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(key)
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Value for `key`, running `fetch` only if no caller has produced it yet.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let slot = self.slot(key);
        slot.get_or_init(|| {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            fetch()
        })
        .await
        .clone()
    }

    /// Value for `key` if it was already produced.
    pub fn peek(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Seed a value. Has no effect if the key already has one.
    pub fn insert(&self, key: K, value: V) {
        let slot = self.slot(key);
        let _ = slot.set(value);
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches actually started.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

/// Outcome of pre-warming a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrewarmSummary {
    pub requested: usize,
    pub resolved: usize,
    pub missing: usize,
    pub failed: usize,
}

/// Resolution state shared by all records of one batch operation.
///
/// Never writes to the identity store; the [`VersionSource`] does that.
#[derive(Default)]
pub struct ResolutionSession {
    version_by_id: SessionCache<i64, Option<VersionRecord>>,
    hash_by_id: SessionCache<i64, Option<String>>,
    failures: AtomicUsize,
}

impl ResolutionSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry version for an id, fetched at most once per session.
    ///
    /// Lookup errors are logged and remembered as `None` for the rest of
    /// the session.
    pub async fn version(&self, version_id: i64, source: &dyn VersionSource) -> Option<VersionRecord> {
        let record = self
            .version_by_id
            .get_or_fetch(version_id, || async {
                match source.version_by_id(version_id).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!("Failed to resolve version {}: {}", version_id, e);
                        self.failures.fetch_add(1, Ordering::SeqCst);
                        None
                    }
                }
            })
            .await;

        self.hash_by_id.insert(
            version_id,
            record.as_ref().map(|r| r.content_hash.clone()),
        );
        record
    }

    /// Already-resolved version, without fetching.
    pub fn peek_version(&self, version_id: i64) -> Option<VersionRecord> {
        self.version_by_id.peek(&version_id).flatten()
    }

    /// Content hash of an already-resolved version.
    pub fn hash_for(&self, version_id: i64) -> Option<String> {
        self.hash_by_id.peek(&version_id).flatten()
    }

    /// Seed a version the caller already holds.
    pub fn remember(&self, record: VersionRecord) {
        if let Some(version_id) = record.version_id {
            self.hash_by_id
                .insert(version_id, Some(record.content_hash.clone()));
            self.version_by_id.insert(version_id, Some(record));
        }
    }

    /// Resolve every id with bounded concurrency and a per-lookup timeout.
    pub async fn prewarm(
        &self,
        version_ids: impl IntoIterator<Item = i64>,
        source: &dyn VersionSource,
        concurrency: usize,
        timeout: Duration,
    ) -> PrewarmSummary {
        let ids: BTreeSet<i64> = version_ids.into_iter().collect();
        let failures_before = self.failures.load(Ordering::SeqCst);
        let mut summary = PrewarmSummary {
            requested: ids.len(),
            ..PrewarmSummary::default()
        };

        let outcomes: Vec<Option<Option<VersionRecord>>> = stream::iter(ids)
            .map(|id| async move {
                match tokio::time::timeout(timeout, self.version(id, source)).await {
                    Ok(record) => Some(record),
                    Err(_) => {
                        warn!("Lookup of version {} timed out after {:?}", id, timeout);
                        None
                    }
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let timed_out = outcomes.iter().filter(|o| o.is_none()).count();
        let lookup_failures = self.failures.load(Ordering::SeqCst) - failures_before;
        for outcome in outcomes.into_iter().flatten() {
            if outcome.is_some() {
                summary.resolved += 1;
            } else {
                summary.missing += 1;
            }
        }
        summary.failed = timed_out + lookup_failures;
        summary.missing = summary.missing.saturating_sub(lookup_failures);

        if summary.requested > 0 {
            info!(
                "Pre-warmed {} versions: {} resolved, {} missing, {} failed",
                summary.requested, summary.resolved, summary.missing, summary.failed
            );
        } else {
            debug!("Nothing to pre-warm");
        }
        summary
    }

    /// Distinct ids fetched from the source so far.
    pub fn fetch_count(&self) -> usize {
        self.version_by_id.fetch_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProvenanceError, Result};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct CountingSource {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl VersionSource for CountingSource {
        async fn version_by_id(&self, version_id: i64) -> Result<Option<VersionRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match version_id {
                404 => Ok(None),
                500 => Err(ProvenanceError::Other("boom".into())),
                id => Ok(Some(VersionRecord {
                    content_hash: format!("{:08x}", id),
                    version_id: Some(id),
                    model_id: Some(1),
                    name: Some(format!("v{}", id)),
                    trained_words: vec![],
                    raw_payload: Some(serde_json::json!({"id": id})),
                    last_checked_at: None,
                })),
            }
        }
    }

    fn source(delay_ms: u64) -> CountingSource {
        CountingSource {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache: SessionCache<&str, u32> = SessionCache::new();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            7
        };
        let (a, b, c) = tokio::join!(
            cache.get_or_fetch("k", fetch),
            cache.get_or_fetch("k", fetch),
            cache.get_or_fetch("k", fetch),
        );

        assert_eq!((a, b, c), (7, 7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.fetch_count(), 1);
        assert_eq!(cache.peek(&"k"), Some(7));
    }

    #[tokio::test]
    async fn test_session_fetches_each_id_once() {
        let session = ResolutionSession::new();
        let source = source(5);

        let lookups = (0..20).map(|i| session.version(if i % 2 == 0 { 1 } else { 2 }, &source));
        let results = futures::future::join_all(lookups).await;

        assert!(results.iter().all(|r| r.is_some()));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.hash_for(1).as_deref(), Some("00000001"));
    }

    #[tokio::test]
    async fn test_prewarm_summary_and_failure_memo() {
        let session = ResolutionSession::new();
        let source = source(0);

        let summary = session
            .prewarm([1, 2, 2, 404, 500], &source, 4, Duration::from_secs(5))
            .await;
        assert_eq!(
            summary,
            PrewarmSummary {
                requested: 4,
                resolved: 2,
                missing: 1,
                failed: 1,
            }
        );

        // A failed id is not retried within the session.
        assert!(session.version(500, &source).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 4);
        assert!(session.peek_version(2).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_prewarm_times_out_slow_lookups() {
        let session = ResolutionSession::new();
        let source = source(10_000);

        let summary = session
            .prewarm([1], &source, 1, Duration::from_millis(100))
            .await;
        assert_eq!(summary.failed, 1);
        assert!(session.peek_version(1).is_none());
    }
}
