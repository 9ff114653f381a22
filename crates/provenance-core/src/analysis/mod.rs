//! Batch analysis of the sample outputs published for a model version.
//!
//! One analysis pages through the registry's sample outputs, pre-warms a
//! single [`ResolutionSession`] for every version id referenced across the
//! batch, extracts each record's recipe and aggregates the results. Reports
//! are memoized in the store under a fingerprint of the subject and query.

mod params;
mod report;

use crate::config::RegistryConfig;
use crate::error::{ProvenanceError, Result};
use crate::inventory::hashing::normalize_hash;
use crate::inventory::LocalHashIndex;
use crate::models::ImageQuery;
use crate::recipe::{extract, referenced_version_ids};
use crate::resolution::{IdentityKey, IdentityResolver, ResolutionSession};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use params::{DominantParameters, ParameterCounts, TRACKED_PARAMETERS};
pub use report::{parse_prompt_tags, AnalysisReport, ResourceUsage, TagCount};

/// Which sample outputs an analysis covers.
pub type AnalysisQuery = ImageQuery;

/// Cache key of an analysis: SHA-256 of the subject and every query parameter.
pub fn fingerprint(subject_hash: &str, query: &AnalysisQuery) -> String {
    let identity = format!(
        "{}-{}-{}-{}-{}",
        normalize_hash(subject_hash),
        query.limit,
        query.sort.as_str(),
        query.nsfw.as_str(),
        query.media.as_str()
    );
    hex::encode(Sha256::digest(identity.as_bytes()))
}

/// Runs batch analyses against the registry.
pub struct Analyzer {
    resolver: Arc<IdentityResolver>,
    prewarm_concurrency: usize,
    lookup_timeout: Duration,
}

impl Analyzer {
    pub fn new(resolver: Arc<IdentityResolver>) -> Self {
        Self {
            resolver,
            prewarm_concurrency: RegistryConfig::PREWARM_CONCURRENCY,
            lookup_timeout: RegistryConfig::LOOKUP_TIMEOUT,
        }
    }

    pub fn with_prewarm_concurrency(mut self, concurrency: usize) -> Self {
        self.prewarm_concurrency = concurrency.max(1);
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    /// Analyze the sample outputs of the version behind `subject_hash`.
    ///
    /// Unless `force_refresh` is set, a cached report for the same
    /// fingerprint is returned without touching the network.
    pub async fn analyze(
        &self,
        subject_hash: &str,
        query: &AnalysisQuery,
        index: &LocalHashIndex,
        force_refresh: bool,
    ) -> Result<AnalysisReport> {
        let subject = normalize_hash(subject_hash);
        let fingerprint = fingerprint(&subject, query);
        let store = self.resolver.client().store().clone();

        if !force_refresh {
            if let Some(entry) = store.get_analysis_cache(&fingerprint)? {
                match serde_json::from_value::<AnalysisReport>(entry.payload) {
                    Ok(mut report) => {
                        debug!("Analysis for {} served from cache", subject);
                        report.from_cache = true;
                        return Ok(report);
                    }
                    Err(e) => warn!("Discarding unreadable cached analysis {}: {}", fingerprint, e),
                }
            }
        }

        let version_id = self
            .resolver
            .resolve(&IdentityKey::hash(subject.clone()))
            .await?
            .and_then(|record| record.version_id)
            .ok_or_else(|| ProvenanceError::IdentityNotFound(subject.clone()))?;

        let fetch = self
            .resolver
            .client()
            .fetch_images(version_id, query)
            .await;
        let records: Vec<serde_json::Value> = fetch
            .images
            .into_iter()
            .filter_map(|image| image.meta)
            .collect();
        if records.is_empty() {
            return Err(ProvenanceError::Other(match fetch.halted {
                Some(reason) => format!(
                    "No sample outputs with metadata for version {}: {}",
                    version_id, reason
                ),
                None => format!("No sample outputs with metadata for version {}", version_id),
            }));
        }

        let session = ResolutionSession::new();
        let version_ids: BTreeSet<i64> = records.iter().flat_map(referenced_version_ids).collect();
        let prewarm = session
            .prewarm(
                version_ids,
                self.resolver.as_ref(),
                self.prewarm_concurrency,
                self.lookup_timeout,
            )
            .await;

        let mut builder = report::ReportBuilder::new(&session);
        for record in &records {
            let Some(meta) = record.as_object() else {
                continue;
            };
            let recipe = extract(record, index, &session);
            builder.add_record(meta, &recipe);
        }
        let report = builder.finish(subject.clone(), version_id, fingerprint.clone(), prewarm.failed);

        store.set_analysis_cache(&fingerprint, &serde_json::to_value(&report)?)?;
        info!(
            "Analyzed {} records for {} ({} resources, {} skipped)",
            report.total_records,
            subject,
            report.resources.len(),
            report.skipped_records
        );
        Ok(report)
    }
}
